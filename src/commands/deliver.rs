// ABOUTME: Deliver command - receives envelopes from the queue and merges them into PostgreSQL
// ABOUTME: Drains the queue once with --once, otherwise runs until Ctrl+C

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::config::RelayConfig;
use crate::relay::{ChangeWriter, ConsumerConfig, DeliveryLoop};
use crate::store::postgres::{connect_with_retry, PostgresTarget};
use crate::transport::QueueTransport;
use crate::utils::{sanitize_url, validate_connection_string};

pub struct DeliverOptions {
    pub config: RelayConfig,
    /// Overrides `[target] url`
    pub target_url: Option<String>,
    /// Overrides `[delivery] max_concurrent`
    pub max_concurrent: Option<usize>,
    pub once: bool,
    pub allow_self_signed: bool,
}

pub async fn deliver(opts: DeliverOptions) -> Result<()> {
    let config = opts.config;
    let target_url = opts
        .target_url
        .or_else(|| config.target.as_ref().map(|t| t.url.clone()))
        .ok_or_else(|| anyhow!("Target URL not provided. Use --target, TARGET_URL or [target] url"))?;
    validate_connection_string(&target_url)?;

    let (schema, suffix) = match &config.target {
        Some(target) => (Some(target.schema.clone()), target.table_suffix.clone()),
        None => (None, String::new()),
    };

    tracing::info!("Connecting to target {}", sanitize_url(&target_url));
    let client = connect_with_retry(&target_url, opts.allow_self_signed)
        .await
        .context("Failed to connect to target database")?;
    let target = Arc::new(PostgresTarget::new(client, schema));
    let writer = Arc::new(ChangeWriter::new(target).with_table_suffix(suffix));

    let transport = Arc::new(
        QueueTransport::open(
            &config.queue.path,
            config.queue.lock_duration(),
            config.queue.poll_interval(),
        )
        .context("Failed to open transport")?,
    );

    let consumer_config = ConsumerConfig {
        max_concurrent: opts
            .max_concurrent
            .unwrap_or(config.delivery.max_concurrent)
            .max(1),
        idle_wait: Duration::from_millis(config.delivery.idle_wait_ms),
        max_delivery_count: config.delivery.max_delivery_count,
    };
    let delivery = DeliveryLoop::new(consumer_config, transport.clone(), writer);

    if opts.once {
        let stats = delivery.drain().await?;
        let purged = transport.purge_acknowledged().await?;
        tracing::debug!("Purged {} acknowledged messages", purged);

        println!();
        println!("========================================");
        println!("Delivery complete");
        println!("========================================");
        println!("  Messages received: {}", stats.received);
        println!("  Messages applied: {}", stats.applied);
        println!("  Rows inserted: {}", stats.rows_inserted);
        println!("  Rows updated: {}", stats.rows_updated);
        println!("  Rows stale: {}", stats.rows_stale);
        if stats.rows_skipped > 0 {
            println!("  Rows skipped: {}", stats.rows_skipped);
        }
        if stats.failed > 0 {
            println!("  Failed deliveries: {}", stats.failed);
        }
        if stats.dead_lettered > 0 {
            println!("  Dead-lettered: {}", stats.dead_lettered);
        }
        return Ok(());
    }

    println!();
    println!("========================================");
    println!("Starting change relay delivery");
    println!("========================================");
    println!("  Queue: {}", config.queue.path.display());
    println!("  Press Ctrl+C to stop");
    println!();

    delivery.run(super::shutdown_on_ctrl_c()).await?;
    transport.purge_acknowledged().await?;
    Ok(())
}
