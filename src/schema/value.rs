// ABOUTME: Tagged column value type carried in batches
// ABOUTME: Converts values to and from the envelope's JSON representation

use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde_json::{Number, Value};

use super::types::LogicalType;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// One column value of a captured row.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(uuid::Uuid),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Json(Value),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    /// Wrap a JSON document. JSON `null` is the SQL null, so there is one
    /// way to hold it.
    pub fn json(value: Value) -> Self {
        match value {
            Value::Null => ColumnValue::Null,
            other => ColumnValue::Json(other),
        }
    }

    /// Fold `Json(null)` into `Null`; every other value is returned as is.
    pub fn normalized(self) -> Self {
        match self {
            ColumnValue::Json(v) => ColumnValue::json(v),
            other => other,
        }
    }

    /// Interpret the value as a row version. Versions are non-negative integers.
    pub fn as_version(&self) -> Option<u64> {
        match self {
            ColumnValue::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Render the value for the envelope body.
    pub fn to_json(&self) -> Value {
        match self {
            ColumnValue::Null => Value::Null,
            ColumnValue::Bool(v) => Value::Bool(*v),
            ColumnValue::Int(v) => Value::Number((*v).into()),
            ColumnValue::Float(v) => match Number::from_f64(*v) {
                Some(n) => Value::Number(n),
                // JSON has no NaN/Infinity; use PostgreSQL's spellings
                None if v.is_nan() => Value::String("NaN".to_string()),
                None if *v > 0.0 => Value::String("Infinity".to_string()),
                None => Value::String("-Infinity".to_string()),
            },
            ColumnValue::Decimal(v) => Value::String(v.to_string()),
            ColumnValue::Text(v) => Value::String(v.clone()),
            ColumnValue::Bytes(v) => Value::String(STANDARD.encode(v)),
            ColumnValue::Uuid(v) => Value::String(v.to_string()),
            ColumnValue::Date(v) => Value::String(v.format(DATE_FORMAT).to_string()),
            ColumnValue::Timestamp(v) => Value::String(v.format(TIMESTAMP_FORMAT).to_string()),
            ColumnValue::TimestampTz(v) => {
                Value::String(v.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            ColumnValue::Json(v) => v.clone(),
        }
    }

    /// Decode an envelope value for a column of known logical type.
    pub fn from_json(ty: LogicalType, value: &Value) -> Result<Self, String> {
        if value.is_null() {
            return Ok(ColumnValue::Null);
        }

        let decoded = match ty {
            LogicalType::Bool => value.as_bool().map(ColumnValue::Bool),
            LogicalType::SmallInt | LogicalType::Int | LogicalType::BigInt => {
                value.as_i64().map(ColumnValue::Int)
            }
            LogicalType::Real | LogicalType::Double => match value {
                Value::Number(n) => n.as_f64().map(ColumnValue::Float),
                Value::String(s) => match s.as_str() {
                    "NaN" => Some(ColumnValue::Float(f64::NAN)),
                    "Infinity" => Some(ColumnValue::Float(f64::INFINITY)),
                    "-Infinity" => Some(ColumnValue::Float(f64::NEG_INFINITY)),
                    _ => None,
                },
                _ => None,
            },
            LogicalType::Decimal => value.as_str().and_then(|s| match s {
                // numeric NaN and infinities travel as floats
                "NaN" => Some(ColumnValue::Float(f64::NAN)),
                "Infinity" => Some(ColumnValue::Float(f64::INFINITY)),
                "-Infinity" => Some(ColumnValue::Float(f64::NEG_INFINITY)),
                _ => Decimal::from_str(s).ok().map(ColumnValue::Decimal),
            }),
            LogicalType::Text => value.as_str().map(|s| ColumnValue::Text(s.to_string())),
            LogicalType::Bytes => value
                .as_str()
                .and_then(|s| STANDARD.decode(s).ok())
                .map(ColumnValue::Bytes),
            LogicalType::Uuid => value
                .as_str()
                .and_then(|s| uuid::Uuid::parse_str(s).ok())
                .map(ColumnValue::Uuid),
            LogicalType::Date | LogicalType::Timestamp | LogicalType::TimestampTz
                if is_infinity(value) =>
            {
                value.as_str().map(|s| ColumnValue::Text(s.to_string()))
            }
            LogicalType::Date => value
                .as_str()
                .and_then(|s| NaiveDate::parse_from_str(s, DATE_FORMAT).ok())
                .map(ColumnValue::Date),
            LogicalType::Timestamp => value
                .as_str()
                .and_then(|s| NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).ok())
                .map(ColumnValue::Timestamp),
            LogicalType::TimestampTz => value
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| ColumnValue::TimestampTz(dt.with_timezone(&Utc))),
            LogicalType::Json => Some(ColumnValue::json(value.clone())),
        };

        decoded.ok_or_else(|| format!("value {} is not a valid {}", value, ty))
    }

    /// Decode an envelope value for a column whose type name is not in the
    /// lookup table. The JSON kind decides the variant.
    pub fn from_untyped_json(value: &Value) -> Self {
        match value {
            Value::Null => ColumnValue::Null,
            Value::Bool(v) => ColumnValue::Bool(*v),
            Value::Number(n) => match n.as_i64() {
                Some(v) => ColumnValue::Int(v),
                None => ColumnValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => ColumnValue::Text(s.clone()),
            other => ColumnValue::json(other.clone()),
        }
    }
}

/// PostgreSQL's spelling of infinite dates and timestamps.
fn is_infinity(value: &Value) -> bool {
    matches!(value.as_str(), Some("infinity" | "-infinity"))
}

impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnValue::Null => f.write_str("NULL"),
            ColumnValue::Text(v) => f.write_str(v),
            other => match other.to_json() {
                Value::String(s) => f.write_str(&s),
                json => write!(f, "{}", json),
            },
        }
    }
}
