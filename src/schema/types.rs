// ABOUTME: Logical column types and the driver type-name lookup table
// ABOUTME: Unknown type names map to nothing so binding fails closed

use std::fmt;

use super::value::ColumnValue;

/// Native parameter type a column value is bound as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalType {
    Bool,
    SmallInt,
    Int,
    BigInt,
    Real,
    Double,
    Decimal,
    Text,
    Bytes,
    Uuid,
    Date,
    Timestamp,
    TimestampTz,
    Json,
}

/// Driver-reported type names, PostgreSQL first, then SQL Server spellings.
///
/// Names are matched after [`normalize_type_name`]. `timestamp` is the
/// PostgreSQL date-time type here, not the SQL Server rowversion alias.
const TYPE_NAMES: &[(&str, LogicalType)] = &[
    ("bool", LogicalType::Bool),
    ("boolean", LogicalType::Bool),
    ("int2", LogicalType::SmallInt),
    ("smallint", LogicalType::SmallInt),
    ("smallserial", LogicalType::SmallInt),
    ("int4", LogicalType::Int),
    ("integer", LogicalType::Int),
    ("serial", LogicalType::Int),
    ("int8", LogicalType::BigInt),
    ("bigint", LogicalType::BigInt),
    ("bigserial", LogicalType::BigInt),
    ("float4", LogicalType::Real),
    ("real", LogicalType::Real),
    ("float8", LogicalType::Double),
    ("double precision", LogicalType::Double),
    ("numeric", LogicalType::Decimal),
    ("decimal", LogicalType::Decimal),
    ("text", LogicalType::Text),
    ("varchar", LogicalType::Text),
    ("character varying", LogicalType::Text),
    ("char", LogicalType::Text),
    ("character", LogicalType::Text),
    ("bpchar", LogicalType::Text),
    ("name", LogicalType::Text),
    ("citext", LogicalType::Text),
    ("bytea", LogicalType::Bytes),
    ("uuid", LogicalType::Uuid),
    ("date", LogicalType::Date),
    ("timestamp", LogicalType::Timestamp),
    ("timestamp without time zone", LogicalType::Timestamp),
    ("timestamptz", LogicalType::TimestampTz),
    ("timestamp with time zone", LogicalType::TimestampTz),
    ("json", LogicalType::Json),
    ("jsonb", LogicalType::Json),
    // SQL Server
    ("bit", LogicalType::Bool),
    ("tinyint", LogicalType::SmallInt),
    ("int", LogicalType::Int),
    ("float", LogicalType::Double),
    ("money", LogicalType::Decimal),
    ("smallmoney", LogicalType::Decimal),
    ("nvarchar", LogicalType::Text),
    ("nchar", LogicalType::Text),
    ("ntext", LogicalType::Text),
    ("binary", LogicalType::Bytes),
    ("varbinary", LogicalType::Bytes),
    ("image", LogicalType::Bytes),
    ("uniqueidentifier", LogicalType::Uuid),
    ("datetime", LogicalType::Timestamp),
    ("datetime2", LogicalType::Timestamp),
    ("smalldatetime", LogicalType::Timestamp),
    ("datetimeoffset", LogicalType::TimestampTz),
];

/// Lowercase, trim, drop a `(n)` / `(p,s)` suffix and collapse whitespace.
fn normalize_type_name(name: &str) -> String {
    let base = match name.find('(') {
        Some(idx) => &name[..idx],
        None => name,
    };
    base.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase()
}

impl LogicalType {
    /// Look up a driver type name. Returns `None` for names the binder does
    /// not know how to bind.
    pub fn from_type_name(name: &str) -> Option<Self> {
        let normalized = normalize_type_name(name);
        TYPE_NAMES
            .iter()
            .find(|(candidate, _)| *candidate == normalized)
            .map(|(_, ty)| *ty)
    }

    /// Whether `value` can be bound as this type without coercion.
    ///
    /// `Null` fits every type. Integers must fit the column's width.
    pub fn accepts(&self, value: &ColumnValue) -> bool {
        match (self, value) {
            (_, ColumnValue::Null) => true,
            (LogicalType::Bool, ColumnValue::Bool(_)) => true,
            (LogicalType::SmallInt, ColumnValue::Int(v)) => i16::try_from(*v).is_ok(),
            (LogicalType::Int, ColumnValue::Int(v)) => i32::try_from(*v).is_ok(),
            (LogicalType::BigInt, ColumnValue::Int(_)) => true,
            (LogicalType::Real | LogicalType::Double, ColumnValue::Float(_)) => true,
            (LogicalType::Decimal, ColumnValue::Decimal(_)) => true,
            (LogicalType::Text, ColumnValue::Text(_)) => true,
            (LogicalType::Bytes, ColumnValue::Bytes(_)) => true,
            (LogicalType::Uuid, ColumnValue::Uuid(_)) => true,
            (LogicalType::Date, ColumnValue::Date(_)) => true,
            (LogicalType::Timestamp, ColumnValue::Timestamp(_)) => true,
            (LogicalType::TimestampTz, ColumnValue::TimestampTz(_)) => true,
            (LogicalType::Json, ColumnValue::Json(_)) => true,
            _ => false,
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            LogicalType::SmallInt | LogicalType::Int | LogicalType::BigInt
        )
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogicalType::Bool => "bool",
            LogicalType::SmallInt => "smallint",
            LogicalType::Int => "integer",
            LogicalType::BigInt => "bigint",
            LogicalType::Real => "real",
            LogicalType::Double => "double precision",
            LogicalType::Decimal => "numeric",
            LogicalType::Text => "text",
            LogicalType::Bytes => "bytea",
            LogicalType::Uuid => "uuid",
            LogicalType::Date => "date",
            LogicalType::Timestamp => "timestamp",
            LogicalType::TimestampTz => "timestamptz",
            LogicalType::Json => "jsonb",
        };
        f.write_str(name)
    }
}
