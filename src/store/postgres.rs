// ABOUTME: PostgreSQL source and target stores built on tokio-postgres
// ABOUTME: Discovers column descriptors at read time and binds values by logical type

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use postgres_native_tls::MakeTlsConnector;
use rust_decimal::Decimal;
use std::time::Duration;
use tokio_postgres::types::{FromSql, ToSql, Type};
use tokio_postgres::{Client, Row};
use tracing::warn;

use super::{RowOutcome, SourceRows, SourceStore, TargetStore};
use crate::config::TableConfig;
use crate::relay::writer::{BoundValue, UpsertStatement};
use crate::schema::{ColumnDescriptor, ColumnValue, LogicalType};
use crate::utils::{quote_ident, quote_qualified, retry_with_backoff, sanitize_url, validate_identifier};

/// Open a connection, negotiating TLS when the server offers it.
///
/// `allow_self_signed` disables certificate verification for servers with
/// self-signed certificates.
pub async fn connect(url: &str, allow_self_signed: bool) -> Result<Client> {
    let tls = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(allow_self_signed)
        .build()
        .context("Failed to build TLS connector")?;
    let connector = MakeTlsConnector::new(tls);

    let (client, connection) = tokio_postgres::connect(url, connector)
        .await
        .with_context(|| format!("Failed to connect to {}", sanitize_url(url)))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("PostgreSQL connection error: {}", e);
        }
    });

    Ok(client)
}

/// [`connect`] with three retries and exponential backoff starting at one second.
pub async fn connect_with_retry(url: &str, allow_self_signed: bool) -> Result<Client> {
    retry_with_backoff(
        || connect(url, allow_self_signed),
        3,
        Duration::from_secs(1),
    )
    .await
}

/// Reads changed rows from tables in one schema.
pub struct PostgresSource {
    client: Client,
    schema: String,
}

impl PostgresSource {
    pub fn new(client: Client, schema: impl Into<String>) -> Self {
        Self {
            client,
            schema: schema.into(),
        }
    }

    /// Columns the driver reports as identity: identity columns when the
    /// table has any, otherwise the primary key.
    async fn identity_columns(&self, table: &str) -> Result<Vec<String>> {
        let rows = self
            .client
            .query(
                "SELECT column_name::text
                 FROM information_schema.columns
                 WHERE table_schema = $1 AND table_name = $2 AND is_identity = 'YES'
                 ORDER BY ordinal_position",
                &[&self.schema.as_str(), &table],
            )
            .await
            .with_context(|| format!("Failed to get identity columns for {}.{}", self.schema, table))?;
        if !rows.is_empty() {
            return Ok(rows.iter().map(|row| row.get(0)).collect());
        }

        let rows = self
            .client
            .query(
                "SELECT a.attname::text
                 FROM pg_index i
                 JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
                 JOIN pg_class c ON c.oid = i.indrelid
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE i.indisprimary
                   AND n.nspname = $1
                   AND c.relname = $2
                 ORDER BY array_position(i.indkey, a.attnum)",
                &[&self.schema.as_str(), &table],
            )
            .await
            .with_context(|| format!("Failed to get primary key for {}.{}", self.schema, table))?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }
}

/// Result types the row reader decodes directly.
const NATIVE_TYPES: &[&str] = &[
    "int2", "int4", "int8", "bool", "float4", "float8", "numeric", "text", "varchar", "bpchar",
    "name", "bytea", "uuid", "date", "timestamp", "timestamptz", "json", "jsonb",
];

/// Select list for the change query. `money` is read as numeric and any
/// other type without a reader comes back as its text form.
fn select_list<'a>(columns: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    columns
        .into_iter()
        .map(|(name, type_name)| {
            let column = quote_ident(name);
            match type_name {
                t if NATIVE_TYPES.contains(&t) => column,
                "money" => format!("{column}::numeric AS {column}"),
                _ => format!("{column}::text AS {column}"),
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Build the range query for changes above a watermark.
///
/// With a limit, the upper bound is the version of the `limit`-th row, so
/// rows sharing that version all come back together.
fn build_changes_query(
    schema: &str,
    table: &str,
    select: &str,
    version_column: &str,
    limited: bool,
) -> String {
    let relation = quote_qualified(Some(schema), table);
    let version = quote_ident(version_column);
    if limited {
        format!(
            "SELECT {select} FROM {relation} \
             WHERE {version} > $1::bigint \
               AND {version} <= (SELECT max(next_versions.v) FROM \
                 (SELECT {version} AS v FROM {relation} WHERE {version} > $1::bigint \
                  ORDER BY {version} LIMIT $2) AS next_versions) \
             ORDER BY {version}"
        )
    } else {
        format!("SELECT {select} FROM {relation} WHERE {version} > $1::bigint ORDER BY {version}")
    }
}

#[async_trait]
impl SourceStore for PostgresSource {
    async fn fetch_changes(
        &self,
        table: &TableConfig,
        since: u64,
        limit: Option<usize>,
    ) -> Result<SourceRows> {
        validate_identifier(&self.schema).context("Invalid source schema")?;
        validate_identifier(&table.name).context("Invalid source table")?;
        validate_identifier(&table.version_column).context("Invalid version column")?;

        let since = i64::try_from(since).context("Watermark exceeds bigint range")?;
        let relation = quote_qualified(Some(&self.schema), &table.name);
        let described = self
            .client
            .prepare(&format!("SELECT * FROM {relation}"))
            .await
            .with_context(|| format!("Failed to describe {}.{}", self.schema, table.name))?;

        let identity = self.identity_columns(&table.name).await?;
        let columns: Vec<ColumnDescriptor> = described
            .columns()
            .iter()
            .map(|column| ColumnDescriptor {
                name: column.name().to_string(),
                logical_type: column.type_().name().to_string(),
                is_identity: identity.first().map(String::as_str) == Some(column.name()),
                is_version: false,
            })
            .collect();

        let select = select_list(
            columns
                .iter()
                .map(|c| (c.name.as_str(), c.logical_type.as_str())),
        );
        let query = build_changes_query(
            &self.schema,
            &table.name,
            &select,
            &table.version_column,
            limit.is_some(),
        );
        let statement = self
            .client
            .prepare(&query)
            .await
            .with_context(|| format!("Failed to prepare change query for {}.{}", self.schema, table.name))?;

        let rows = match limit {
            Some(limit) => {
                let limit = limit as i64;
                self.client.query(&statement, &[&since, &limit]).await
            }
            None => self.client.query(&statement, &[&since]).await,
        }
        .with_context(|| format!("Failed to read changes from {}.{}", self.schema, table.name))?;

        let rows = rows
            .iter()
            .map(|row| row_to_values(row, &columns))
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("Failed to convert rows from {}.{}", self.schema, table.name))?;

        Ok(SourceRows { columns, rows })
    }
}

/// Convert a row of the change query to column values.
///
/// Each value is decoded by the type the query returned it as, then mapped
/// back onto the source column's type.
pub fn row_to_values(row: &Row, columns: &[ColumnDescriptor]) -> Result<Vec<ColumnValue>> {
    columns
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            let value = read_value(row, idx)
                .with_context(|| format!("Failed to read column {}", column.name))?;
            Ok(from_source_type(&column.logical_type, value))
        })
        .collect()
}

fn read_value(row: &Row, idx: usize) -> Result<ColumnValue> {
    let type_name = row
        .columns()
        .get(idx)
        .map(|column| column.type_().name())
        .with_context(|| format!("Row has no column {}", idx))?;

    match read_typed(row, idx, type_name) {
        Ok(value) => Ok(value.unwrap_or(ColumnValue::Null)),
        Err(err) => {
            let stand_in = row
                .try_get::<_, Option<RawValue>>(idx)
                .ok()
                .flatten()
                .and_then(|RawValue(raw)| out_of_range_value(type_name, raw));
            match stand_in {
                Some(value) => {
                    warn!(
                        "Column {} holds {} {}, which has no typed counterpart",
                        idx, type_name, value
                    );
                    Ok(value)
                }
                None => Err(err),
            }
        }
    }
}

fn read_typed(row: &Row, idx: usize, type_name: &str) -> Result<Option<ColumnValue>> {
    fn get<'a, T: FromSql<'a>>(row: &'a Row, idx: usize) -> Result<Option<T>> {
        Ok(row.try_get::<_, Option<T>>(idx)?)
    }

    let value = match type_name {
        "int2" => get::<i16>(row, idx)?.map(|v| ColumnValue::Int(v.into())),
        "int4" => get::<i32>(row, idx)?.map(|v| ColumnValue::Int(v.into())),
        "int8" => get::<i64>(row, idx)?.map(ColumnValue::Int),
        "bool" => get::<bool>(row, idx)?.map(ColumnValue::Bool),
        "float4" => get::<f32>(row, idx)?.map(|v| ColumnValue::Float(v.into())),
        "float8" => get::<f64>(row, idx)?.map(ColumnValue::Float),
        "numeric" => get::<Decimal>(row, idx)?.map(ColumnValue::Decimal),
        "text" | "varchar" | "bpchar" | "name" => get::<String>(row, idx)?.map(ColumnValue::Text),
        "bytea" => get::<Vec<u8>>(row, idx)?.map(ColumnValue::Bytes),
        "uuid" => get::<uuid::Uuid>(row, idx)?.map(ColumnValue::Uuid),
        "date" => get::<NaiveDate>(row, idx)?.map(ColumnValue::Date),
        "timestamp" => get::<NaiveDateTime>(row, idx)?.map(ColumnValue::Timestamp),
        "timestamptz" => get::<DateTime<Utc>>(row, idx)?.map(ColumnValue::TimestampTz),
        "json" | "jsonb" => get::<serde_json::Value>(row, idx)?.map(ColumnValue::json),
        other => bail!("type {} has no reader", other),
    };
    Ok(value)
}

/// Column bytes as the server sent them, for any type.
struct RawValue<'a>(&'a [u8]);

impl<'a> FromSql<'a> for RawValue<'a> {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        Ok(RawValue(raw))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

/// Stand-ins for binary values the typed readers reject: numeric NaN and
/// infinities become floats, infinite dates and timestamps become text.
/// The binder rejects rows holding them.
fn out_of_range_value(type_name: &str, raw: &[u8]) -> Option<ColumnValue> {
    match type_name {
        // ndigits, weight, sign, dscale; sign carries the special values
        "numeric" if raw.len() >= 8 => match u16::from_be_bytes([raw[4], raw[5]]) {
            0xC000 => Some(ColumnValue::Float(f64::NAN)),
            0xD000 => Some(ColumnValue::Float(f64::INFINITY)),
            0xF000 => Some(ColumnValue::Float(f64::NEG_INFINITY)),
            _ => None,
        },
        "timestamp" | "timestamptz" => match i64::from_be_bytes(raw.try_into().ok()?) {
            i64::MAX => Some(ColumnValue::Text("infinity".to_string())),
            i64::MIN => Some(ColumnValue::Text("-infinity".to_string())),
            _ => None,
        },
        "date" => match i32::from_be_bytes(raw.try_into().ok()?) {
            i32::MAX => Some(ColumnValue::Text("infinity".to_string())),
            i32::MIN => Some(ColumnValue::Text("-infinity".to_string())),
            _ => None,
        },
        _ => None,
    }
}

/// Map a value read through a cast back onto its source column type.
fn from_source_type(source_type: &str, value: ColumnValue) -> ColumnValue {
    match (source_type, value) {
        ("bit", ColumnValue::Text(bits)) if bits == "1" => ColumnValue::Bool(true),
        ("bit", ColumnValue::Text(bits)) if bits == "0" => ColumnValue::Bool(false),
        (_, value) => value,
    }
}

/// Writes upserts into tables in an optional target schema.
pub struct PostgresTarget {
    client: Client,
    schema: Option<String>,
}

impl PostgresTarget {
    pub fn new(client: Client, schema: Option<String>) -> Self {
        Self { client, schema }
    }
}

/// Box a bound value as a driver parameter of its logical type.
pub fn to_sql_param(bound: &BoundValue) -> Result<Box<dyn ToSql + Sync + Send>> {
    let param: Box<dyn ToSql + Sync + Send> = match (bound.ty, &bound.value) {
        (LogicalType::Bool, ColumnValue::Bool(v)) => Box::new(*v),
        (LogicalType::SmallInt, ColumnValue::Int(v)) => Box::new(i16::try_from(*v)?),
        (LogicalType::Int, ColumnValue::Int(v)) => Box::new(i32::try_from(*v)?),
        (LogicalType::BigInt, ColumnValue::Int(v)) => Box::new(*v),
        (LogicalType::Real, ColumnValue::Float(v)) => Box::new(*v as f32),
        (LogicalType::Double, ColumnValue::Float(v)) => Box::new(*v),
        (LogicalType::Decimal, ColumnValue::Decimal(v)) => Box::new(*v),
        (LogicalType::Text, ColumnValue::Text(v)) => Box::new(v.clone()),
        (LogicalType::Bytes, ColumnValue::Bytes(v)) => Box::new(v.clone()),
        (LogicalType::Uuid, ColumnValue::Uuid(v)) => Box::new(*v),
        (LogicalType::Date, ColumnValue::Date(v)) => Box::new(*v),
        (LogicalType::Timestamp, ColumnValue::Timestamp(v)) => Box::new(*v),
        (LogicalType::TimestampTz, ColumnValue::TimestampTz(v)) => Box::new(*v),
        (LogicalType::Json, ColumnValue::Json(v)) => Box::new(v.clone()),
        (ty, ColumnValue::Null) => typed_null(ty),
        (ty, other) => bail!(
            "column {} value {} cannot be bound as {}",
            bound.column,
            other,
            ty
        ),
    };
    Ok(param)
}

fn typed_null(ty: LogicalType) -> Box<dyn ToSql + Sync + Send> {
    match ty {
        LogicalType::Bool => Box::new(None::<bool>),
        LogicalType::SmallInt => Box::new(None::<i16>),
        LogicalType::Int => Box::new(None::<i32>),
        LogicalType::BigInt => Box::new(None::<i64>),
        LogicalType::Real => Box::new(None::<f32>),
        LogicalType::Double => Box::new(None::<f64>),
        LogicalType::Decimal => Box::new(None::<Decimal>),
        LogicalType::Text => Box::new(None::<String>),
        LogicalType::Bytes => Box::new(None::<Vec<u8>>),
        LogicalType::Uuid => Box::new(None::<uuid::Uuid>),
        LogicalType::Date => Box::new(None::<NaiveDate>),
        LogicalType::Timestamp => Box::new(None::<NaiveDateTime>),
        LogicalType::TimestampTz => Box::new(None::<DateTime<Utc>>),
        LogicalType::Json => Box::new(None::<serde_json::Value>),
    }
}

#[async_trait]
impl TargetStore for PostgresTarget {
    async fn upsert(&self, statement: &UpsertStatement) -> Result<RowOutcome> {
        let sql = statement.to_postgres_sql(self.schema.as_deref());
        let values = statement
            .parameters()
            .map(to_sql_param)
            .collect::<Result<Vec<_>>>()?;
        let params: Vec<&(dyn ToSql + Sync)> = values
            .iter()
            .map(|v| v.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let row = self
            .client
            .query_opt(&sql, &params)
            .await
            .with_context(|| format!("Failed to upsert into {}", statement.table))?;

        let inserted = match row {
            Some(row) => row
                .try_get::<_, bool>(0)
                .with_context(|| format!("Failed to read upsert outcome for {}", statement.table))?,
            None => return Ok(RowOutcome::Stale),
        };
        Ok(if inserted {
            RowOutcome::Inserted
        } else {
            RowOutcome::Updated
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changes_query_unlimited() {
        assert_eq!(
            build_changes_query("public", "SampleTable1", "\"id\", \"rowver\"", "rowver", false),
            "SELECT \"id\", \"rowver\" FROM \"public\".\"SampleTable1\" WHERE \"rowver\" > $1::bigint ORDER BY \"rowver\""
        );
    }

    #[test]
    fn test_changes_query_limited_keeps_ties() {
        let query = build_changes_query("public", "orders", "\"rowver\"", "rowver", true);
        assert!(query.contains("LIMIT $2"));
        assert!(query.contains("\"rowver\" <= (SELECT max(next_versions.v)"));
        assert!(query.ends_with("ORDER BY \"rowver\""));
    }

    #[test]
    fn test_select_list_casts_types_without_reader() {
        let select = select_list([
            ("id", "int4"),
            ("bal", "money"),
            ("flag", "bit"),
            ("kind", "char"),
            ("addr", "inet"),
            ("rowver", "int8"),
        ]);
        assert_eq!(
            select,
            "\"id\", \"bal\"::numeric AS \"bal\", \"flag\"::text AS \"flag\", \
             \"kind\"::text AS \"kind\", \"addr\"::text AS \"addr\", \"rowver\""
        );
    }

    #[test]
    fn test_bit_text_maps_to_bool() {
        assert_eq!(
            from_source_type("bit", ColumnValue::Text("1".into())),
            ColumnValue::Bool(true)
        );
        assert_eq!(
            from_source_type("bit", ColumnValue::Text("0".into())),
            ColumnValue::Bool(false)
        );
        // wider bit strings stay text and fail the bool type check at bind time
        assert_eq!(
            from_source_type("bit", ColumnValue::Text("1010".into())),
            ColumnValue::Text("1010".into())
        );
        assert_eq!(from_source_type("bit", ColumnValue::Null), ColumnValue::Null);
        assert_eq!(
            from_source_type("char", ColumnValue::Text("r".into())),
            ColumnValue::Text("r".into())
        );
    }

    #[test]
    fn test_numeric_special_values_get_float_stand_ins() {
        let numeric = |sign: u16| {
            let mut raw = vec![0, 0, 0, 0];
            raw.extend_from_slice(&sign.to_be_bytes());
            raw.extend_from_slice(&[0, 0]);
            raw
        };
        assert!(matches!(
            out_of_range_value("numeric", &numeric(0xC000)),
            Some(ColumnValue::Float(v)) if v.is_nan()
        ));
        assert_eq!(
            out_of_range_value("numeric", &numeric(0xD000)),
            Some(ColumnValue::Float(f64::INFINITY))
        );
        assert_eq!(
            out_of_range_value("numeric", &numeric(0xF000)),
            Some(ColumnValue::Float(f64::NEG_INFINITY))
        );
        // positive and negative finite numbers are not special
        assert_eq!(out_of_range_value("numeric", &numeric(0x0000)), None);
        assert_eq!(out_of_range_value("numeric", &numeric(0x4000)), None);
    }

    #[test]
    fn test_infinite_dates_get_text_stand_ins() {
        assert_eq!(
            out_of_range_value("timestamptz", &i64::MAX.to_be_bytes()),
            Some(ColumnValue::Text("infinity".into()))
        );
        assert_eq!(
            out_of_range_value("timestamp", &i64::MIN.to_be_bytes()),
            Some(ColumnValue::Text("-infinity".into()))
        );
        assert_eq!(
            out_of_range_value("date", &i32::MAX.to_be_bytes()),
            Some(ColumnValue::Text("infinity".into()))
        );
        assert_eq!(out_of_range_value("date", &0i32.to_be_bytes()), None);
        assert_eq!(out_of_range_value("timestamp", &[0, 1]), None);
        assert_eq!(out_of_range_value("int4", &i32::MAX.to_be_bytes()), None);
    }

    #[test]
    fn test_to_sql_param_checks_type() {
        let bound = BoundValue {
            column: "Amount".into(),
            ty: LogicalType::Int,
            value: ColumnValue::Text("12".into()),
        };
        assert!(to_sql_param(&bound).is_err());

        let null = BoundValue {
            column: "Amount".into(),
            ty: LogicalType::Int,
            value: ColumnValue::Null,
        };
        assert!(to_sql_param(&null).is_ok());

        let narrow = BoundValue {
            column: "Flags".into(),
            ty: LogicalType::SmallInt,
            value: ColumnValue::Int(70_000),
        };
        assert!(to_sql_param(&narrow).is_err());
    }
}
