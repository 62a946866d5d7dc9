// ABOUTME: In-process transport with peek-lock redelivery, for tests and dry runs
// ABOUTME: Mirrors relay-queue semantics: lock deadline, delivery count, ack, abandon, dead letter

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{AckHandle, Delivery, Receiver, Transport, TransportError};
use crate::relay::batch::Envelope;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
struct StoredMessage {
    properties: BTreeMap<String, String>,
    payload: Vec<u8>,
    visible_at: Option<Instant>,
    delivery_count: u32,
    acked: bool,
    dead_letter: Option<String>,
}

#[derive(Default)]
struct QueueState {
    next_id: i64,
    messages: BTreeMap<i64, StoredMessage>,
}

/// In-memory queue shared by a sender and any number of receivers.
pub struct MemoryTransport {
    state: Mutex<QueueState>,
    notify: Notify,
    lock: Duration,
    unavailable: AtomicBool,
}

impl MemoryTransport {
    pub fn new(lock: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            lock,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make send and receive fail until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Enqueue a message as-is, bypassing envelope construction.
    pub fn enqueue_raw(
        &self,
        properties: BTreeMap<String, String>,
        payload: Vec<u8>,
    ) -> Result<i64, TransportError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| TransportError::Unavailable("queue state poisoned".into()))?;
        state.next_id += 1;
        let id = state.next_id;
        state.messages.insert(
            id,
            StoredMessage {
                properties,
                payload,
                visible_at: None,
                delivery_count: 0,
                acked: false,
                dead_letter: None,
            },
        );
        drop(state);
        self.notify.notify_waiters();
        Ok(id)
    }

    /// Messages that are neither acknowledged nor dead-lettered.
    pub fn pending_count(&self) -> usize {
        self.count(|m| !m.acked && m.dead_letter.is_none())
    }

    pub fn acked_count(&self) -> usize {
        self.count(|m| m.acked)
    }

    pub fn dead_letter_count(&self) -> usize {
        self.count(|m| m.dead_letter.is_some())
    }

    pub fn total_count(&self) -> usize {
        self.count(|_| true)
    }

    /// Delivery count per message id.
    pub fn delivery_counts(&self) -> HashMap<i64, u32> {
        self.state
            .lock()
            .map(|s| {
                s.messages
                    .iter()
                    .map(|(id, m)| (*id, m.delivery_count))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Properties of every message in send order.
    pub fn sent_properties(&self) -> Vec<BTreeMap<String, String>> {
        self.state
            .lock()
            .map(|s| s.messages.values().map(|m| m.properties.clone()).collect())
            .unwrap_or_default()
    }

    fn count(&self, predicate: impl Fn(&StoredMessage) -> bool) -> usize {
        self.state
            .lock()
            .map(|s| s.messages.values().filter(|m| predicate(m)).count())
            .unwrap_or_default()
    }

    fn check_available(&self) -> Result<(), TransportError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("memory transport offline".into()));
        }
        Ok(())
    }

    fn try_lock_next(&self) -> Result<Option<Delivery>, TransportError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| TransportError::Unavailable("queue state poisoned".into()))?;
        let now = Instant::now();
        let lock = self.lock;
        let next = state.messages.iter_mut().find(|(_, m)| {
            !m.acked && m.dead_letter.is_none() && m.visible_at.map_or(true, |t| t <= now)
        });
        Ok(next.map(|(id, message)| {
            message.visible_at = Some(now + lock);
            message.delivery_count += 1;
            Delivery {
                properties: message.properties.clone(),
                payload: message.payload.clone(),
                handle: AckHandle {
                    message_id: *id,
                    delivery_count: message.delivery_count,
                },
            }
        }))
    }

    /// Apply `settle` to the message if `handle` is still its current delivery.
    fn settle(
        &self,
        handle: &AckHandle,
        settle: impl FnOnce(&mut StoredMessage),
    ) -> Result<bool, TransportError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| TransportError::Unavailable("queue state poisoned".into()))?;
        match state.messages.get_mut(&handle.message_id) {
            Some(m) if !m.acked && m.delivery_count == handle.delivery_count => {
                settle(m);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        self.check_available()?;
        self.enqueue_raw(envelope.metadata().to_properties(), envelope.payload.clone())?;
        Ok(())
    }
}

#[async_trait]
impl Receiver for MemoryTransport {
    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, TransportError> {
        self.check_available()?;
        let deadline = Instant::now() + wait;
        loop {
            if let Some(delivery) = self.try_lock_next()? {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let nap = POLL_INTERVAL.min(deadline - now);
            let _ = tokio::time::timeout(nap, self.notify.notified()).await;
        }
    }

    async fn ack(&self, handle: &AckHandle) -> Result<(), TransportError> {
        if self.settle(handle, |m| m.acked = true)? {
            Ok(())
        } else {
            Err(TransportError::LockLost(handle.clone()))
        }
    }

    async fn abandon(&self, handle: &AckHandle) -> Result<(), TransportError> {
        if self.settle(handle, |m| m.visible_at = None)? {
            self.notify.notify_waiters();
        }
        Ok(())
    }

    async fn dead_letter(&self, handle: &AckHandle, reason: &str) -> Result<(), TransportError> {
        if self.settle(handle, |m| m.dead_letter = Some(reason.to_string()))? {
            Ok(())
        } else {
            Err(TransportError::LockLost(handle.clone()))
        }
    }
}
