// ABOUTME: At-least-once transport contracts: send envelopes, receive under peek-lock, ack
// ABOUTME: Adapters: relay-queue (SQLite) in queue.rs, in-process channel in memory.rs

pub mod memory;
pub mod queue;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::relay::batch::{Envelope, MessageMetadata};
use crate::relay::codec::CodecError;

pub use memory::MemoryTransport;
pub use queue::QueueTransport;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("lock lost for message {0}")]
    LockLost(AckHandle),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Identifies one delivery of a message. A handle goes stale once the
/// message is acknowledged or handed out again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckHandle {
    pub message_id: i64,
    pub delivery_count: u32,
}

impl fmt::Display for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (delivery {})", self.message_id, self.delivery_count)
    }
}

/// A received message: string properties, the compressed payload and the
/// handle to settle it with.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub properties: BTreeMap<String, String>,
    pub payload: Vec<u8>,
    pub handle: AckHandle,
}

impl Delivery {
    pub fn delivery_count(&self) -> u32 {
        self.handle.delivery_count
    }

    /// Table named in the properties, if any; for log lines.
    pub fn table(&self) -> &str {
        self.properties
            .get(MessageMetadata::TABLE)
            .map(String::as_str)
            .unwrap_or("<unknown>")
    }

    /// Rebuild the envelope from properties and payload.
    pub fn envelope(&self) -> Result<Envelope, CodecError> {
        let metadata = MessageMetadata::from_properties(&self.properties)?;
        Ok(Envelope::from_parts(metadata, self.payload.clone()))
    }
}

/// Sending side of the channel.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Durably hand one envelope to the channel. Returns only once the
    /// channel has accepted it.
    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError>;
}

/// Receiving side of the channel.
#[async_trait]
pub trait Receiver: Send + Sync {
    /// Wait up to `wait` for a message and lock it. `None` when nothing arrived.
    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, TransportError>;

    /// Mark the delivery consumed.
    async fn ack(&self, handle: &AckHandle) -> Result<(), TransportError>;

    /// Release the lock so the message is redelivered right away.
    async fn abandon(&self, handle: &AckHandle) -> Result<(), TransportError>;

    /// Park the message for inspection; it is never delivered again.
    async fn dead_letter(&self, handle: &AckHandle, reason: &str) -> Result<(), TransportError>;
}

/// Callback for transport faults the loops recover from.
pub type ErrorObserver = Arc<dyn Fn(&TransportError) + Send + Sync>;

/// Observer that logs each fault.
pub fn log_errors() -> ErrorObserver {
    Arc::new(|e: &TransportError| tracing::error!("Transport error: {:?}", e))
}
