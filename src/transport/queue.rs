// ABOUTME: Transport adapter over the durable relay-queue SQLite message queue
// ABOUTME: Queue calls are blocking and run on tokio's blocking pool

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use relay_queue::{MessageQueue, NewMessage};
use tokio::time::Instant;

use super::{AckHandle, Delivery, Receiver, Transport, TransportError};
use crate::relay::batch::Envelope;

/// Both ends of a relay-queue database.
#[derive(Clone)]
pub struct QueueTransport {
    queue: Arc<Mutex<MessageQueue>>,
    lock: Duration,
    poll_interval: Duration,
}

impl QueueTransport {
    pub fn open(path: &Path, lock: Duration, poll_interval: Duration) -> Result<Self> {
        let queue = MessageQueue::open(path)
            .with_context(|| format!("Failed to open relay queue at {:?}", path))?;
        Ok(Self {
            queue: Arc::new(Mutex::new(queue)),
            lock,
            poll_interval,
        })
    }

    pub async fn pending_count(&self) -> Result<u64> {
        self.with_queue(|queue| queue.pending_count()).await
    }

    pub async fn dead_letter_count(&self) -> Result<u64> {
        self.with_queue(|queue| queue.dead_letter_count()).await
    }

    pub async fn purge_acknowledged(&self) -> Result<u64> {
        self.with_queue(|queue| queue.purge_acknowledged()).await
    }

    async fn with_queue<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut MessageQueue) -> Result<T> + Send + 'static,
    {
        let queue = self.queue.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = queue
                .lock()
                .map_err(|_| anyhow!("relay queue mutex poisoned"))?;
            op(&mut guard)
        })
        .await
        .context("Relay queue task failed")?
    }

    async fn settle<F>(&self, handle: &AckHandle, op: F) -> Result<(), TransportError>
    where
        F: FnOnce(&MessageQueue, i64, u32) -> Result<bool> + Send + 'static,
    {
        let (id, count) = (handle.message_id, handle.delivery_count);
        let current = self
            .with_queue(move |queue| op(queue, id, count))
            .await
            .map_err(|e| TransportError::Unavailable(format!("{:#}", e)))?;
        if current {
            Ok(())
        } else {
            Err(TransportError::LockLost(handle.clone()))
        }
    }
}

#[async_trait]
impl Transport for QueueTransport {
    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let message = NewMessage {
            properties: envelope.metadata().to_properties(),
            body: envelope.payload.clone(),
        };
        let id = self
            .with_queue(move |queue| queue.enqueue(&message))
            .await
            .map_err(|e| TransportError::Unavailable(format!("{:#}", e)))?;
        tracing::debug!("Enqueued message {} for {}", id, envelope.table);
        Ok(())
    }
}

#[async_trait]
impl Receiver for QueueTransport {
    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, TransportError> {
        let deadline = Instant::now() + wait;
        loop {
            let lock = self.lock;
            let received = self
                .with_queue(move |queue| queue.receive(lock))
                .await
                .map_err(|e| TransportError::Unavailable(format!("{:#}", e)))?;
            if let Some(message) = received {
                return Ok(Some(Delivery {
                    properties: message.properties,
                    payload: message.body,
                    handle: AckHandle {
                        message_id: message.message_id,
                        delivery_count: message.delivery_count,
                    },
                }));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, handle: &AckHandle) -> Result<(), TransportError> {
        self.settle(handle, |queue, id, count| queue.ack(id, count)).await
    }

    async fn abandon(&self, handle: &AckHandle) -> Result<(), TransportError> {
        match self
            .settle(handle, |queue, id, count| queue.abandon(id, count))
            .await
        {
            // Already redelivered elsewhere; nothing left to release
            Err(TransportError::LockLost(_)) => Ok(()),
            other => other,
        }
    }

    async fn dead_letter(&self, handle: &AckHandle, reason: &str) -> Result<(), TransportError> {
        let reason = reason.to_string();
        self.settle(handle, move |queue, id, count| {
            queue.dead_letter(id, count, &reason)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::batch::MessageMetadata;

    fn envelope(to: u64) -> Envelope {
        Envelope::from_parts(
            MessageMetadata {
                table: "orders".into(),
                change_from: 0,
                change_to: to,
                changes: 1,
            },
            vec![0x1f, 0x8b, 1, 2],
        )
    }

    #[tokio::test]
    async fn test_send_receive_ack() {
        let dir = tempfile::tempdir().unwrap();
        let transport = QueueTransport::open(
            &dir.path().join("queue.db"),
            Duration::from_secs(30),
            Duration::from_millis(5),
        )
        .unwrap();

        transport.send(&envelope(4)).await.unwrap();
        assert_eq!(transport.pending_count().await.unwrap(), 1);

        let delivery = transport
            .receive(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.envelope().unwrap(), envelope(4));
        assert!(transport
            .receive(Duration::from_millis(20))
            .await
            .unwrap()
            .is_none());

        transport.ack(&delivery.handle).await.unwrap();
        assert_eq!(transport.pending_count().await.unwrap(), 0);
        assert!(matches!(
            transport.ack(&delivery.handle).await,
            Err(TransportError::LockLost(_))
        ));
    }

    #[tokio::test]
    async fn test_unacked_message_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        {
            let transport =
                QueueTransport::open(&path, Duration::from_secs(30), Duration::from_millis(5))
                    .unwrap();
            transport.send(&envelope(9)).await.unwrap();
            let delivery = transport.receive(Duration::ZERO).await.unwrap().unwrap();
            transport.abandon(&delivery.handle).await.unwrap();
        }

        let reopened =
            QueueTransport::open(&path, Duration::from_secs(30), Duration::from_millis(5)).unwrap();
        let delivery = reopened.receive(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(delivery.delivery_count(), 2);
        reopened
            .dead_letter(&delivery.handle, "test")
            .await
            .unwrap();
        assert_eq!(reopened.dead_letter_count().await.unwrap(), 1);
    }
}
