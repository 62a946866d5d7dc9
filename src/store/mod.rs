// ABOUTME: Source and target store contracts used by the extractor and merge applier
// ABOUTME: PostgreSQL adapters live in postgres.rs, in-process ones in memory.rs

pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::TableConfig;
use crate::relay::writer::UpsertStatement;
use crate::schema::{ColumnDescriptor, ColumnValue};

pub use memory::{MemorySource, MemoryTarget};
pub use postgres::{PostgresSource, PostgresTarget};

/// Rows read from a source table with the descriptors they align to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceRows {
    pub columns: Vec<ColumnDescriptor>,
    pub rows: Vec<Vec<ColumnValue>>,
}

/// Read side of a relational store.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Return rows of `table` whose version column is greater than `since`,
    /// ascending by version.
    ///
    /// With a `limit`, at least that many rows are returned when available,
    /// but rows sharing a version are never split across calls.
    async fn fetch_changes(
        &self,
        table: &TableConfig,
        since: u64,
        limit: Option<usize>,
    ) -> Result<SourceRows>;
}

/// What an upsert did to the target row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    Inserted,
    Updated,
    /// The stored row already had a higher version; nothing was written
    Stale,
}

/// Write side of a relational store.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Insert or update one row atomically.
    async fn upsert(&self, statement: &UpsertStatement) -> Result<RowOutcome>;
}
