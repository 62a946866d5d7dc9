// ABOUTME: Sync command - runs the sending side of the relay against PostgreSQL
// ABOUTME: One pass with --once, otherwise passes until Ctrl+C

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

use crate::config::RelayConfig;
use crate::relay::{DaemonConfig, JsonFileWatermarks, SyncDaemon, WatermarkStore};
use crate::store::postgres::{connect_with_retry, PostgresSource};
use crate::transport::QueueTransport;
use crate::utils::{sanitize_url, validate_connection_string};

pub struct SyncOptions {
    pub config: RelayConfig,
    /// Overrides `[source] url`
    pub source_url: Option<String>,
    pub once: bool,
    pub allow_self_signed: bool,
}

pub async fn sync(opts: SyncOptions) -> Result<()> {
    let config = opts.config;
    if config.tables.is_empty() {
        bail!("No tables configured; add [[tables]] entries to the config file");
    }

    let source_url = opts
        .source_url
        .or_else(|| config.source.as_ref().map(|s| s.url.clone()))
        .ok_or_else(|| anyhow!("Source URL not provided. Use --source, SOURCE_URL or [source] url"))?;
    validate_connection_string(&source_url)?;
    let schema = config
        .source
        .as_ref()
        .map(|s| s.schema.clone())
        .unwrap_or_else(|| "public".to_string());

    tracing::info!("Connecting to source {}", sanitize_url(&source_url));
    let client = connect_with_retry(&source_url, opts.allow_self_signed)
        .await
        .context("Failed to connect to source database")?;
    let source = Arc::new(PostgresSource::new(client, schema));

    let transport = Arc::new(
        QueueTransport::open(
            &config.queue.path,
            config.queue.lock_duration(),
            config.queue.poll_interval(),
        )
        .context("Failed to open transport")?,
    );

    let watermarks = WatermarkStore::open(Box::new(JsonFileWatermarks::new(
        config.sync.state_path.clone(),
    )))
    .await
    .context("Failed to load watermarks")?;

    let daemon_config = DaemonConfig {
        tables: config.tables.clone(),
        table_delay: Duration::from_millis(config.sync.table_delay_ms),
        pass_backoff: Duration::from_millis(config.sync.pass_backoff_ms),
        batch_size: config.sync.batch_size,
    };
    let mut daemon = SyncDaemon::new(daemon_config, source, transport, watermarks);

    if opts.once {
        let stats = daemon.run_pass().await?;
        tracing::info!("Sync pass complete:");
        tracing::info!("  Tables synced: {}", stats.tables_synced);
        tracing::info!("  Envelopes sent: {}", stats.envelopes_sent);
        tracing::info!("  Rows sent: {}", stats.rows_sent);

        println!();
        println!("========================================");
        println!("Sync pass complete");
        println!("========================================");
        println!("  Tables synced: {}", stats.tables_synced);
        println!("  Envelopes sent: {}", stats.envelopes_sent);
        println!("  Rows sent: {}", stats.rows_sent);
        if !stats.is_success() {
            for err in &stats.errors {
                tracing::warn!("    - {}", err);
            }
            bail!("Sync pass finished with {} errors", stats.errors.len());
        }
        return Ok(());
    }

    println!();
    println!("========================================");
    println!("Starting change relay sync");
    println!("========================================");
    println!("  Tables: {}", config.tables.len());
    println!("  Pass backoff: {}ms", config.sync.pass_backoff_ms);
    println!("  Press Ctrl+C to stop");
    println!();

    daemon.run(super::shutdown_on_ctrl_c()).await
}
