// ABOUTME: Command implementations for the relay binary
// ABOUTME: Exports sync (sending side), deliver (receiving side) and status

pub mod deliver;
pub mod status;
pub mod sync;

pub use deliver::{deliver, DeliverOptions};
pub use status::status;
pub use sync::{sync, SyncOptions};

use tokio::sync::broadcast;

/// Shutdown channel fed by Ctrl+C.
pub(crate) fn shutdown_on_ctrl_c() -> broadcast::Receiver<()> {
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Received shutdown signal");
        let _ = shutdown_tx.send(());
    });
    shutdown_rx
}
