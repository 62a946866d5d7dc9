// ABOUTME: Extractor for change relay - reads rows newer than a table's watermark
// ABOUTME: Flags identity and version columns and computes the next watermark

use anyhow::{anyhow, bail, Context, Result};

use crate::config::TableConfig;
use crate::schema::ColumnValue;
use crate::store::{SourceRows, SourceStore};

use super::batch::Batch;

/// Result of one extraction cycle for one table.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub batch: Batch,
    pub prior_watermark: u64,
    /// Highest version in the batch, or the prior watermark when empty
    pub new_watermark: u64,
}

impl Extraction {
    pub fn change_count(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }
}

/// Reads changed rows from a source store.
pub struct ChangeReader<'a> {
    source: &'a dyn SourceStore,
}

impl<'a> ChangeReader<'a> {
    pub fn new(source: &'a dyn SourceStore) -> Self {
        Self { source }
    }

    /// Read rows of `table` whose version exceeds `since`.
    ///
    /// The source contract is checked on the way: one value per column, and
    /// versions that are integers above `since` in ascending order.
    pub async fn read_changes(
        &self,
        table: &TableConfig,
        since: u64,
        limit: Option<usize>,
    ) -> Result<Extraction> {
        table.validate()?;

        let SourceRows { mut columns, rows } = self
            .source
            .fetch_changes(table, since, limit)
            .await
            .with_context(|| format!("Failed to read changes from {}", table.name))?;

        let version_idx = columns
            .iter()
            .position(|c| c.name == table.version_column)
            .ok_or_else(|| {
                anyhow!(
                    "Table {} has no version column {}",
                    table.name,
                    table.version_column
                )
            })?;
        for (idx, column) in columns.iter_mut().enumerate() {
            column.is_version = idx == version_idx;
        }

        let identity_column = match &table.identity_column {
            Some(name) => {
                let column = columns
                    .iter_mut()
                    .find(|c| &c.name == name)
                    .ok_or_else(|| {
                        anyhow!("Table {} has no identity column {}", table.name, name)
                    })?;
                column.is_identity = true;
                name.clone()
            }
            None => columns
                .iter()
                .find(|c| c.is_identity && !c.is_version)
                .map(|c| c.name.clone())
                .ok_or_else(|| {
                    anyhow!(
                        "Table {} has no identity or primary key column; set identity_column",
                        table.name
                    )
                })?,
        };
        if identity_column == table.version_column {
            bail!(
                "Table {} uses {} as both identity and version column",
                table.name,
                identity_column
            );
        }

        let mut new_watermark = since;
        for (row_idx, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                bail!(
                    "Row {} of {} has {} values but {} columns were discovered",
                    row_idx,
                    table.name,
                    row.len(),
                    columns.len()
                );
            }
            let version = row[version_idx].as_version().ok_or_else(|| {
                anyhow!(
                    "Row {} of {} has version {} in {}, expected a non-negative integer",
                    row_idx,
                    table.name,
                    row[version_idx],
                    table.version_column
                )
            })?;
            if version <= since {
                bail!(
                    "Source returned version {} for {} at or below watermark {}",
                    version,
                    table.name,
                    since
                );
            }
            if version < new_watermark {
                bail!(
                    "Source returned {} out of version order ({} after {})",
                    table.name,
                    version,
                    new_watermark
                );
            }
            new_watermark = version;
        }

        let mut batch = Batch::new(&table.name, identity_column, columns);
        batch.rows = rows
            .into_iter()
            .map(|row| row.into_iter().map(ColumnValue::normalized).collect())
            .collect();

        Ok(Extraction {
            batch,
            prior_watermark: since,
            new_watermark,
        })
    }
}
