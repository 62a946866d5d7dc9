// ABOUTME: SyncDaemon for change relay - extract, seal and send changes table by table
// ABOUTME: Advances a table's watermark only after its envelope is accepted by the transport

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use crate::config::TableConfig;
use crate::store::SourceStore;
use crate::transport::Transport;

use super::batch::Envelope;
use super::reader::ChangeReader;
use super::state::WatermarkStore;

/// Configuration for the SyncDaemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Tables to sync, in pass order
    pub tables: Vec<TableConfig>,
    /// Pause between two tables of the same pass
    pub table_delay: Duration,
    /// Pause after a full pass
    pub pass_backoff: Duration,
    /// Maximum rows per table per pass (None = all pending rows)
    pub batch_size: Option<usize>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            tables: Vec::new(),
            table_delay: Duration::from_millis(100),
            pass_backoff: Duration::from_secs(5),
            batch_size: Some(10_000),
        }
    }
}

/// Statistics from one pass over all tables.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub tables_synced: usize,
    pub tables_failed: usize,
    pub rows_sent: u64,
    pub envelopes_sent: u64,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl SyncStats {
    /// Check if the pass completed without errors.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// SyncDaemon owns the watermark store and drives the sending side.
///
/// Each pass, for every configured table in order:
/// 1. Read rows above the table's watermark
/// 2. Seal them into a compressed envelope
/// 3. Send the envelope
/// 4. Advance the watermark to the highest version sent
///
/// Watermarks are persisted at the end of every pass.
pub struct SyncDaemon {
    config: DaemonConfig,
    source: Arc<dyn SourceStore>,
    transport: Arc<dyn Transport>,
    watermarks: WatermarkStore,
}

impl SyncDaemon {
    pub fn new(
        config: DaemonConfig,
        source: Arc<dyn SourceStore>,
        transport: Arc<dyn Transport>,
        watermarks: WatermarkStore,
    ) -> Self {
        Self {
            config,
            source,
            transport,
            watermarks,
        }
    }

    pub fn watermarks(&self) -> &WatermarkStore {
        &self.watermarks
    }

    /// Run one pass over all tables, then persist watermarks.
    ///
    /// A failing table is logged and counted; the pass moves on. Only a
    /// failure to persist watermarks fails the pass.
    pub async fn run_pass(&mut self) -> Result<SyncStats> {
        let start = std::time::Instant::now();
        let mut stats = SyncStats::default();
        let tables = self.config.tables.clone();

        for (idx, table) in tables.iter().enumerate() {
            if idx > 0 && !self.config.table_delay.is_zero() {
                tokio::time::sleep(self.config.table_delay).await;
            }

            match self.sync_table(table).await {
                Ok(Some(rows)) => {
                    stats.tables_synced += 1;
                    stats.envelopes_sent += 1;
                    stats.rows_sent += rows;
                }
                Ok(None) => stats.tables_synced += 1,
                Err(e) => {
                    // Log with :? to show full error chain including root cause
                    tracing::error!("Failed to sync {}: {:?}", table.name, e);
                    stats.tables_failed += 1;
                    stats.errors.push(format!("Failed to sync {}: {}", table.name, e));
                }
            }
        }

        self.watermarks.flush().await?;

        stats.duration_ms = start.elapsed().as_millis() as u64;
        Ok(stats)
    }

    /// Sync one table. Returns the number of rows sent, or None when there
    /// was nothing new.
    async fn sync_table(&mut self, table: &TableConfig) -> Result<Option<u64>> {
        let since = self.watermarks.get(&table.name);
        let extraction = ChangeReader::new(self.source.as_ref())
            .read_changes(table, since, self.config.batch_size)
            .await?;

        if extraction.is_empty() {
            tracing::debug!("No changes in {} since version {}", table.name, since);
            return Ok(None);
        }

        let rows = extraction.change_count() as u64;
        let new_watermark = extraction.new_watermark;
        let batch = extraction.batch;
        let envelope = tokio::task::spawn_blocking(move || Envelope::seal(&batch, since, new_watermark))
            .await
            .context("Encode task failed")?
            .with_context(|| format!("Failed to encode batch for {}", table.name))?;

        self.transport
            .send(&envelope)
            .await
            .with_context(|| format!("Failed to send envelope for {}", table.name))?;

        self.watermarks.set(&table.name, new_watermark)?;
        tracing::info!(
            "Sent {} changes from {} (version {} -> {}, {} bytes)",
            rows,
            table.name,
            since,
            new_watermark,
            envelope.payload.len()
        );
        Ok(Some(rows))
    }

    /// Run passes until shutdown is signalled.
    ///
    /// A shutdown during a pass abandons the rest of the pass; watermarks of
    /// tables already sent are still persisted before returning.
    pub async fn run(&mut self, mut shutdown: tokio::sync::broadcast::Receiver<()>) -> Result<()> {
        let mut passes = 0u64;

        tracing::info!(
            "Starting SyncDaemon for {} tables with table_delay={:?}, pass_backoff={:?}",
            self.config.tables.len(),
            self.config.table_delay,
            self.config.pass_backoff
        );

        loop {
            passes += 1;
            tracing::debug!("Starting sync pass {}", passes);

            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received during sync pass, aborting");
                    break;
                }
                result = self.run_pass() => {
                    match result {
                        Ok(stats) => {
                            if stats.envelopes_sent > 0 || !stats.is_success() {
                                tracing::info!(
                                    "Sync pass {} completed: {} envelopes, {} rows in {}ms",
                                    passes,
                                    stats.envelopes_sent,
                                    stats.rows_sent,
                                    stats.duration_ms
                                );
                            }
                            if !stats.is_success() {
                                tracing::warn!("Sync pass had {} errors", stats.errors.len());
                            }
                        }
                        Err(e) => {
                            tracing::error!("Sync pass {} failed: {:?}", passes, e);
                        }
                    }
                }
            }

            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping SyncDaemon");
                    break;
                }
                _ = tokio::time::sleep(self.config.pass_backoff) => {}
            }
        }

        self.watermarks
            .flush()
            .await
            .context("Failed to persist watermarks on shutdown")
    }
}
