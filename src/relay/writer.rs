// ABOUTME: Merge applier - replays a batch against the target store as per-row upserts
// ABOUTME: Builds parameterized statements from the batch schema and the type lookup table

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::schema::{ColumnValue, LogicalType};
use crate::store::{RowOutcome, TargetStore};
use crate::utils::{quote_ident, quote_qualified, validate_identifier};

use super::batch::Batch;

/// Why a batch or a row could not be turned into an upsert.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BindError {
    #[error("column {column} has unrecognized type name '{type_name}'")]
    UnknownType { column: String, type_name: String },
    #[error("column {column} value {value} does not fit type {expected}")]
    TypeMismatch {
        column: String,
        expected: LogicalType,
        value: String,
    },
    #[error("invalid identifier '{name}': {reason}")]
    InvalidIdentifier { name: String, reason: String },
    #[error("column {0} is not in the batch schema")]
    MissingColumn(String),
    #[error("batch schema has no version column")]
    MissingVersionColumn,
    #[error("identity column {0} is null")]
    NullIdentity(String),
    #[error("version column {column} holds {value}, expected a non-negative integer")]
    InvalidVersion { column: String, value: String },
    #[error("row has {actual} values but the schema has {expected} columns")]
    ColumnCount { expected: usize, actual: usize },
}

/// A value ready to be bound as a statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundValue {
    pub column: String,
    pub ty: LogicalType,
    pub value: ColumnValue,
}

/// Insert-or-update of one row, keyed by its identity column.
///
/// Column names come from the batch schema and are validated when the
/// statement is built; values are only ever bound as parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertStatement {
    /// Target table name, unqualified
    pub table: String,
    pub identity: BoundValue,
    /// Every column except identity and version, in schema order
    pub assignments: Vec<BoundValue>,
    pub version: BoundValue,
    pub row_version: u64,
}

impl UpsertStatement {
    /// Parameters in placeholder order: identity, assignments, version.
    pub fn parameters(&self) -> impl Iterator<Item = &BoundValue> {
        std::iter::once(&self.identity)
            .chain(self.assignments.iter())
            .chain(std::iter::once(&self.version))
    }

    /// Render the statement for PostgreSQL.
    ///
    /// ```sql
    /// INSERT INTO "schema"."table" AS existing ("id", "col", "ver")
    /// VALUES ($1, $2, $3)
    /// ON CONFLICT ("id") DO UPDATE SET "col" = EXCLUDED."col", "ver" = EXCLUDED."ver"
    /// WHERE existing."ver" <= EXCLUDED."ver"
    /// RETURNING (xmax = 0) AS inserted
    /// ```
    ///
    /// No row comes back when the stored version is newer.
    pub fn to_postgres_sql(&self, schema: Option<&str>) -> String {
        let columns: Vec<String> = self.parameters().map(|p| quote_ident(&p.column)).collect();
        // numeric parameters are cast so money columns take them by assignment
        let placeholders: Vec<String> = self
            .parameters()
            .enumerate()
            .map(|(i, p)| match p.ty {
                LogicalType::Decimal => format!("${}::numeric", i + 1),
                _ => format!("${}", i + 1),
            })
            .collect();

        let version = quote_ident(&self.version.column);
        let mut updates: Vec<String> = self
            .assignments
            .iter()
            .map(|a| {
                let column = quote_ident(&a.column);
                format!("{} = EXCLUDED.{}", column, column)
            })
            .collect();
        updates.push(format!("{} = EXCLUDED.{}", version, version));

        format!(
            "INSERT INTO {} AS existing ({}) VALUES ({}) \
             ON CONFLICT ({}) DO UPDATE SET {} \
             WHERE existing.{} <= EXCLUDED.{} \
             RETURNING (xmax = 0) AS inserted",
            quote_qualified(schema, &self.table),
            columns.join(", "),
            placeholders.join(", "),
            quote_ident(&self.identity.column),
            updates.join(", "),
            version,
            version
        )
    }
}

fn checked_identifier(name: &str) -> Result<(), BindError> {
    validate_identifier(name).map_err(|e| BindError::InvalidIdentifier {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

/// Column positions resolved once per batch.
#[derive(Debug, Clone)]
pub struct MergePlan {
    target_table: String,
    identity: usize,
    version: usize,
    assignments: Vec<usize>,
}

impl MergePlan {
    /// Resolve identity and version columns and validate every name that
    /// will be rendered into SQL.
    pub fn for_batch(batch: &Batch, table_suffix: &str) -> Result<Self, BindError> {
        let target_table = format!("{}{}", batch.table, table_suffix);
        checked_identifier(&target_table)?;
        for column in &batch.schema {
            checked_identifier(&column.name)?;
        }

        let identity = batch
            .identity_index()
            .ok_or_else(|| BindError::MissingColumn(batch.identity_column.clone()))?;
        let version = batch
            .version_index()
            .ok_or(BindError::MissingVersionColumn)?;
        let assignments = (0..batch.schema.len())
            .filter(|idx| *idx != identity && *idx != version)
            .collect();

        Ok(Self {
            target_table,
            identity,
            version,
            assignments,
        })
    }

    pub fn target_table(&self) -> &str {
        &self.target_table
    }

    pub fn bind_row(&self, batch: &Batch, row: &[ColumnValue]) -> Result<UpsertStatement, BindError> {
        if row.len() != batch.schema.len() {
            return Err(BindError::ColumnCount {
                expected: batch.schema.len(),
                actual: row.len(),
            });
        }

        let bind = |idx: usize| -> Result<BoundValue, BindError> {
            let column = &batch.schema[idx];
            let ty = column
                .resolved_type()
                .ok_or_else(|| BindError::UnknownType {
                    column: column.name.clone(),
                    type_name: column.logical_type.clone(),
                })?;
            let value = &row[idx];
            if !ty.accepts(value) {
                return Err(BindError::TypeMismatch {
                    column: column.name.clone(),
                    expected: ty,
                    value: value.to_string(),
                });
            }
            Ok(BoundValue {
                column: column.name.clone(),
                ty,
                value: value.clone(),
            })
        };

        let identity = bind(self.identity)?;
        if identity.value.is_null() {
            return Err(BindError::NullIdentity(identity.column));
        }

        let version = bind(self.version)?;
        let row_version = match (version.ty.is_integer(), version.value.as_version()) {
            (true, Some(v)) => v,
            _ => {
                return Err(BindError::InvalidVersion {
                    column: version.column,
                    value: version.value.to_string(),
                })
            }
        };

        let assignments = self
            .assignments
            .iter()
            .map(|idx| bind(*idx))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(UpsertStatement {
            table: self.target_table.clone(),
            identity,
            assignments,
            version,
            row_version,
        })
    }
}

/// Counts of what happened to a batch's rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub inserted: u64,
    pub updated: u64,
    pub stale: u64,
    pub skipped: u64,
}

impl MergeReport {
    pub fn applied(&self) -> u64 {
        self.inserted + self.updated
    }

    fn record(&mut self, outcome: RowOutcome) {
        match outcome {
            RowOutcome::Inserted => self.inserted += 1,
            RowOutcome::Updated => self.updated += 1,
            RowOutcome::Stale => self.stale += 1,
        }
    }
}

/// Applies decoded batches to the target store.
pub struct ChangeWriter {
    target: Arc<dyn TargetStore>,
    table_suffix: String,
}

impl ChangeWriter {
    pub fn new(target: Arc<dyn TargetStore>) -> Self {
        Self {
            target,
            table_suffix: String::new(),
        }
    }

    pub fn with_table_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.table_suffix = suffix.into();
        self
    }

    /// Upsert every row of `batch`, one write per row.
    ///
    /// Rows that cannot be bound are logged and skipped. A target write
    /// failure aborts the batch so the caller can leave it for redelivery;
    /// rows written before the failure are replayed harmlessly.
    pub async fn apply_batch(&self, batch: &Batch) -> Result<MergeReport> {
        let plan = MergePlan::for_batch(batch, &self.table_suffix)
            .with_context(|| format!("Cannot apply batch for table {}", batch.table))?;

        let mut report = MergeReport::default();
        for (row_idx, row) in batch.rows.iter().enumerate() {
            let statement = match plan.bind_row(batch, row) {
                Ok(statement) => statement,
                Err(e) => {
                    tracing::warn!(
                        "Skipping row {} of {}: {}",
                        row_idx,
                        batch.table,
                        e
                    );
                    report.skipped += 1;
                    continue;
                }
            };

            let outcome = self.target.upsert(&statement).await.with_context(|| {
                format!(
                    "Failed to upsert {} = {} into {}",
                    statement.identity.column,
                    statement.identity.value,
                    plan.target_table()
                )
            })?;
            tracing::debug!(
                "{:?} {} row {} at version {}",
                outcome,
                plan.target_table(),
                statement.identity.value,
                statement.row_version
            );
            report.record(outcome);
        }

        tracing::info!(
            "Applied {} rows to {} ({} inserted, {} updated, {} stale, {} skipped)",
            report.applied(),
            plan.target_table(),
            report.inserted,
            report.updated,
            report.stale,
            report.skipped
        );
        Ok(report)
    }
}
