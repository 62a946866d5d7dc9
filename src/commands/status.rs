// ABOUTME: Status command - prints per-table watermarks and queue depth
// ABOUTME: Reads local state only; no database connections are made

use anyhow::{Context, Result};

use crate::config::RelayConfig;
use crate::relay::{JsonFileWatermarks, WatermarkStore};
use crate::transport::QueueTransport;

pub async fn status(config: &RelayConfig) -> Result<()> {
    let watermarks = WatermarkStore::open(Box::new(JsonFileWatermarks::new(
        config.sync.state_path.clone(),
    )))
    .await
    .context("Failed to load watermarks")?;

    println!("Watermarks ({}):", config.sync.state_path.display());
    for table in &config.tables {
        println!("  {:<32} {}", table.name, watermarks.get(&table.name));
    }
    for (table, watermark) in watermarks.snapshot() {
        if !config.tables.iter().any(|t| &t.name == table) {
            println!("  {:<32} {} (not configured)", table, watermark);
        }
    }

    let queue_exists = tokio::fs::try_exists(&config.queue.path)
        .await
        .with_context(|| format!("Failed to check queue file {:?}", config.queue.path))?;
    if queue_exists {
        let transport = QueueTransport::open(
            &config.queue.path,
            config.queue.lock_duration(),
            config.queue.poll_interval(),
        )?;
        println!();
        println!("Queue ({}):", config.queue.path.display());
        println!("  Pending messages: {}", transport.pending_count().await?);
        println!("  Dead letters: {}", transport.dead_letter_count().await?);
    } else {
        println!();
        println!("Queue {} does not exist yet", config.queue.path.display());
    }

    Ok(())
}
