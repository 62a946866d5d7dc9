// ABOUTME: In-process source and target stores for tests and dry runs
// ABOUTME: Follow the same contracts as the PostgreSQL adapters, including stale-version rejection

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use super::{RowOutcome, SourceRows, SourceStore, TargetStore};
use crate::config::TableConfig;
use crate::relay::writer::UpsertStatement;
use crate::schema::{ColumnDescriptor, ColumnValue};

struct MemoryTable {
    columns: Vec<ColumnDescriptor>,
    rows: Vec<Vec<ColumnValue>>,
}

/// Source tables held in memory. Rows are stored as inserted; reads filter
/// and sort by the configured version column.
#[derive(Default)]
pub struct MemorySource {
    tables: Mutex<HashMap<String, MemoryTable>>,
    unavailable: AtomicBool,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_table(&self, name: &str, columns: Vec<ColumnDescriptor>) {
        if let Ok(mut tables) = self.tables.lock() {
            tables.insert(
                name.to_string(),
                MemoryTable {
                    columns,
                    rows: Vec::new(),
                },
            );
        }
    }

    pub fn insert_row(&self, table: &str, row: Vec<ColumnValue>) -> Result<()> {
        let mut tables = self.tables.lock().map_err(|_| anyhow!("source poisoned"))?;
        let entry = tables
            .get_mut(table)
            .ok_or_else(|| anyhow!("relation \"{}\" does not exist", table))?;
        if row.len() != entry.columns.len() {
            bail!(
                "row has {} values but {} has {} columns",
                row.len(),
                table,
                entry.columns.len()
            );
        }
        entry.rows.push(row);
        Ok(())
    }

    /// Make every read fail, as a lost connection would.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl SourceStore for MemorySource {
    async fn fetch_changes(
        &self,
        table: &TableConfig,
        since: u64,
        limit: Option<usize>,
    ) -> Result<SourceRows> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("source unavailable");
        }
        let tables = self.tables.lock().map_err(|_| anyhow!("source poisoned"))?;
        let entry = tables
            .get(&table.name)
            .ok_or_else(|| anyhow!("relation \"{}\" does not exist", table.name))?;
        let version_idx = entry
            .columns
            .iter()
            .position(|c| c.name == table.version_column)
            .ok_or_else(|| {
                anyhow!(
                    "column \"{}\" does not exist in {}",
                    table.version_column,
                    table.name
                )
            })?;

        let mut changed: Vec<(u64, Vec<ColumnValue>)> = entry
            .rows
            .iter()
            .filter_map(|row| {
                row[version_idx]
                    .as_version()
                    .filter(|v| *v > since)
                    .map(|v| (v, row.clone()))
            })
            .collect();
        changed.sort_by_key(|(v, _)| *v);

        if let Some(limit) = limit {
            if changed.len() > limit && limit > 0 {
                let cutoff = changed[limit - 1].0;
                changed.retain(|(v, _)| *v <= cutoff);
            }
        }

        Ok(SourceRows {
            columns: entry.columns.clone(),
            rows: changed.into_iter().map(|(_, row)| row).collect(),
        })
    }
}

/// A stored target row, by column name.
pub type MemoryRow = BTreeMap<String, ColumnValue>;

/// Target tables held in memory, keyed by identity value.
#[derive(Default)]
pub struct MemoryTarget {
    tables: Mutex<HashMap<String, BTreeMap<String, MemoryRow>>>,
    unavailable: AtomicBool,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// All rows of `table`, ordered by identity key.
    pub fn rows(&self, table: &str) -> Vec<MemoryRow> {
        self.tables
            .lock()
            .ok()
            .and_then(|tables| tables.get(table).map(|t| t.values().cloned().collect()))
            .unwrap_or_default()
    }

    pub fn row(&self, table: &str, identity: &ColumnValue) -> Option<MemoryRow> {
        let tables = self.tables.lock().ok()?;
        tables.get(table)?.get(&identity_key(identity)).cloned()
    }

    /// Make every write fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

fn identity_key(value: &ColumnValue) -> String {
    format!("{:?}", value)
}

#[async_trait]
impl TargetStore for MemoryTarget {
    async fn upsert(&self, statement: &UpsertStatement) -> Result<RowOutcome> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("target unavailable");
        }
        let mut tables = self.tables.lock().map_err(|_| anyhow!("target poisoned"))?;
        let table = tables.entry(statement.table.clone()).or_default();
        let key = identity_key(&statement.identity.value);

        let outcome = match table.get(&key) {
            Some(existing) => {
                let stored = existing
                    .get(&statement.version.column)
                    .and_then(ColumnValue::as_version)
                    .unwrap_or(0);
                if stored > statement.row_version {
                    return Ok(RowOutcome::Stale);
                }
                RowOutcome::Updated
            }
            None => RowOutcome::Inserted,
        };

        let row = table.entry(key).or_default();
        for param in statement.parameters() {
            row.insert(param.column.clone(), param.value.clone());
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_with_versions(versions: &[i64]) -> MemorySource {
        let source = MemorySource::new();
        source.create_table(
            "orders",
            vec![
                ColumnDescriptor::new("id", "int4").identity(),
                ColumnDescriptor::new("rowver", "int8"),
            ],
        );
        for (i, v) in versions.iter().enumerate() {
            source
                .insert_row("orders", vec![ColumnValue::Int(i as i64), ColumnValue::Int(*v)])
                .unwrap();
        }
        source
    }

    fn versions(rows: &SourceRows) -> Vec<i64> {
        rows.rows
            .iter()
            .map(|r| match r[1] {
                ColumnValue::Int(v) => v,
                _ => panic!("non-integer version"),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_fetch_filters_and_sorts() {
        let source = source_with_versions(&[4, 1, 9, 6]);
        let rows = source
            .fetch_changes(&TableConfig::new("orders"), 3, None)
            .await
            .unwrap();
        assert_eq!(versions(&rows), vec![4, 6, 9]);
    }

    #[tokio::test]
    async fn test_limit_keeps_version_ties_together() {
        let source = source_with_versions(&[1, 2, 2, 2, 3]);
        let rows = source
            .fetch_changes(&TableConfig::new("orders"), 0, Some(2))
            .await
            .unwrap();
        assert_eq!(versions(&rows), vec![1, 2, 2, 2]);
    }

    #[tokio::test]
    async fn test_missing_table_and_outage_are_errors() {
        let source = source_with_versions(&[1]);
        assert!(source
            .fetch_changes(&TableConfig::new("nope"), 0, None)
            .await
            .is_err());
        source.set_unavailable(true);
        assert!(source
            .fetch_changes(&TableConfig::new("orders"), 0, None)
            .await
            .is_err());
    }
}
