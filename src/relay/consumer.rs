// ABOUTME: Delivery loop - receives envelopes, decodes and merges them, then acknowledges
// ABOUTME: Runs up to a fixed number of handlers at once; failures leave messages for redelivery

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;

use crate::transport::{log_errors, Delivery, ErrorObserver, Receiver};

use super::codec::CodecError;
use super::writer::{ChangeWriter, MergeReport};

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Maximum handlers running at once
    pub max_concurrent: usize,
    /// How long one receive call waits for a message
    pub idle_wait: Duration,
    /// Dead-letter a message whose handler fails on this delivery
    pub max_delivery_count: Option<u32>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            idle_wait: Duration::from_secs(1),
            max_delivery_count: Some(10),
        }
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Applied(MergeReport),
    /// Left unacknowledged for redelivery
    Abandoned,
    DeadLettered,
}

/// Counters shared by all handlers.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    received: AtomicU64,
    applied: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
    rows_inserted: AtomicU64,
    rows_updated: AtomicU64,
    rows_stale: AtomicU64,
    rows_skipped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliverySnapshot {
    pub received: u64,
    pub applied: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub rows_inserted: u64,
    pub rows_updated: u64,
    pub rows_stale: u64,
    pub rows_skipped: u64,
}

impl DeliveryStats {
    pub fn snapshot(&self) -> DeliverySnapshot {
        DeliverySnapshot {
            received: self.received.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            rows_inserted: self.rows_inserted.load(Ordering::Relaxed),
            rows_updated: self.rows_updated.load(Ordering::Relaxed),
            rows_stale: self.rows_stale.load(Ordering::Relaxed),
            rows_skipped: self.rows_skipped.load(Ordering::Relaxed),
        }
    }

    fn record(&self, report: &MergeReport) {
        self.applied.fetch_add(1, Ordering::Relaxed);
        self.rows_inserted.fetch_add(report.inserted, Ordering::Relaxed);
        self.rows_updated.fetch_add(report.updated, Ordering::Relaxed);
        self.rows_stale.fetch_add(report.stale, Ordering::Relaxed);
        self.rows_skipped.fetch_add(report.skipped, Ordering::Relaxed);
    }
}

struct DeliveryHandler {
    receiver: Arc<dyn Receiver>,
    writer: Arc<ChangeWriter>,
    observer: ErrorObserver,
    stats: Arc<DeliveryStats>,
    max_delivery_count: Option<u32>,
}

impl DeliveryHandler {
    async fn handle(&self, delivery: Delivery) -> DeliveryOutcome {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        let handle = delivery.handle.clone();
        let table = delivery.table().to_string();

        match self.apply(delivery).await {
            Ok(report) => {
                self.stats.record(&report);
                if let Err(e) = self.receiver.ack(&handle).await {
                    // Applied but not settled: the message comes back and replays harmlessly
                    (self.observer)(&e);
                }
                DeliveryOutcome::Applied(report)
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                let corrupt = e
                    .downcast_ref::<CodecError>()
                    .is_some_and(CodecError::is_corrupt);
                tracing::error!(
                    "Failed to apply message {} for {}{}: {:?}",
                    handle,
                    table,
                    if corrupt { " (corrupt envelope)" } else { "" },
                    e
                );

                let poisoned = self
                    .max_delivery_count
                    .is_some_and(|max| handle.delivery_count >= max);
                if poisoned {
                    tracing::warn!(
                        "Message {} for {} failed {} deliveries; moving it to dead letters",
                        handle,
                        table,
                        handle.delivery_count
                    );
                    match self.receiver.dead_letter(&handle, &format!("{:#}", e)).await {
                        Ok(()) => {
                            self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
                            return DeliveryOutcome::DeadLettered;
                        }
                        Err(e) => (self.observer)(&e),
                    }
                } else if let Err(e) = self.receiver.abandon(&handle).await {
                    (self.observer)(&e);
                }
                DeliveryOutcome::Abandoned
            }
        }
    }

    async fn apply(&self, delivery: Delivery) -> Result<MergeReport> {
        let envelope = delivery.envelope()?;
        let table = envelope.table.clone();
        let batch = tokio::task::spawn_blocking(move || envelope.open())
            .await
            .context("Decode task failed")?
            .with_context(|| format!("Failed to decode envelope for {}", table))?;
        self.writer.apply_batch(&batch).await
    }
}

/// Receives envelopes and applies them with bounded concurrency.
pub struct DeliveryLoop {
    config: ConsumerConfig,
    handler: Arc<DeliveryHandler>,
}

impl DeliveryLoop {
    pub fn new(config: ConsumerConfig, receiver: Arc<dyn Receiver>, writer: Arc<ChangeWriter>) -> Self {
        let handler = DeliveryHandler {
            receiver,
            writer,
            observer: log_errors(),
            stats: Arc::new(DeliveryStats::default()),
            max_delivery_count: config.max_delivery_count,
        };
        Self {
            config,
            handler: Arc::new(handler),
        }
    }

    /// Replace the default logging observer for transport faults.
    pub fn with_error_observer(mut self, observer: ErrorObserver) -> Self {
        if let Some(handler) = Arc::get_mut(&mut self.handler) {
            handler.observer = observer;
        }
        self
    }

    pub fn stats(&self) -> Arc<DeliveryStats> {
        self.handler.stats.clone()
    }

    /// Decode, apply and settle one delivery.
    pub async fn process(&self, delivery: Delivery) -> DeliveryOutcome {
        self.handler.handle(delivery).await
    }

    /// Process messages one at a time until a receive comes back empty.
    pub async fn drain(&self) -> Result<DeliverySnapshot> {
        while let Some(delivery) = self
            .handler
            .receiver
            .receive(self.config.idle_wait)
            .await
            .context("Failed to receive message")?
        {
            self.process(delivery).await;
        }
        Ok(self.handler.stats.snapshot())
    }

    /// Receive and dispatch until shutdown is signalled, then wait for
    /// in-flight handlers to finish their batches.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut handlers = JoinSet::new();

        tracing::info!(
            "Starting delivery loop with max_concurrent={}, idle_wait={:?}",
            self.config.max_concurrent,
            self.config.idle_wait
        );

        loop {
            while let Some(result) = handlers.try_join_next() {
                if let Err(err) = result {
                    tracing::error!("Delivery handler panicked: {}", err);
                }
            }

            let permit = tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping delivery loop");
                    break;
                }
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    permit.context("Delivery semaphore closed")?
                }
            };

            let received = tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping delivery loop");
                    break;
                }
                received = self.handler.receiver.receive(self.config.idle_wait) => received,
            };

            match received {
                Ok(Some(delivery)) => {
                    let handler = Arc::clone(&self.handler);
                    handlers.spawn(async move {
                        let _permit = permit;
                        handler.handle(delivery).await;
                    });
                }
                Ok(None) => drop(permit),
                Err(e) => {
                    drop(permit);
                    (self.handler.observer)(&e);
                    tokio::select! {
                        biased;
                        _ = shutdown.recv() => {
                            tracing::info!("Shutdown signal received, stopping delivery loop");
                            break;
                        }
                        _ = tokio::time::sleep(self.config.idle_wait) => {}
                    }
                }
            }
        }

        if !handlers.is_empty() {
            tracing::info!("Waiting for {} in-flight handlers", handlers.len());
        }
        while let Some(result) = handlers.join_next().await {
            if let Err(err) = result {
                tracing::error!("Delivery handler panicked: {}", err);
            }
        }

        let stats = self.handler.stats.snapshot();
        tracing::info!(
            "Delivery loop stopped: {} received, {} applied, {} failed, {} dead-lettered",
            stats.received,
            stats.applied,
            stats.failed,
            stats.dead_lettered
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::batch::{Batch, Envelope, MessageMetadata};
    use crate::relay::writer::UpsertStatement;
    use crate::schema::{ColumnDescriptor, ColumnValue};
    use crate::store::{MemoryTarget, RowOutcome, TargetStore};
    use crate::transport::{MemoryTransport, Transport, TransportError};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn batch(table: &str, from: i64, to: i64) -> Batch {
        let mut batch = Batch::new(
            table,
            "RowId",
            vec![
                ColumnDescriptor::new("RowId", "int4").identity(),
                ColumnDescriptor::new("Name", "text"),
                ColumnDescriptor::new("rowver", "int8").version(),
            ],
        );
        for v in (from + 1)..=to {
            batch.rows.push(vec![
                ColumnValue::Int(v),
                ColumnValue::Text(format!("row {}", v)),
                ColumnValue::Int(v),
            ]);
        }
        batch
    }

    async fn send(transport: &MemoryTransport, table: &str, from: i64, to: i64) {
        let envelope = Envelope::seal(&batch(table, from, to), from as u64, to as u64).unwrap();
        transport.send(&envelope).await.unwrap();
    }

    fn delivery_loop(
        transport: Arc<MemoryTransport>,
        target: Arc<dyn TargetStore>,
        config: ConsumerConfig,
    ) -> DeliveryLoop {
        DeliveryLoop::new(config, transport, Arc::new(ChangeWriter::new(target)))
    }

    fn quick_config() -> ConsumerConfig {
        ConsumerConfig {
            max_concurrent: 2,
            idle_wait: Duration::from_millis(10),
            max_delivery_count: Some(3),
        }
    }

    #[tokio::test]
    async fn test_applied_message_is_acked() {
        let transport = Arc::new(MemoryTransport::new(Duration::from_secs(30)));
        let target = Arc::new(MemoryTarget::new());
        send(&transport, "SampleTable1", 0, 3).await;

        let consumer = delivery_loop(transport.clone(), target.clone(), quick_config());
        let stats = consumer.drain().await.unwrap();

        assert_eq!(stats.applied, 1);
        assert_eq!(stats.rows_inserted, 3);
        assert_eq!(transport.acked_count(), 1);
        assert_eq!(target.rows("SampleTable1").len(), 3);
    }

    #[tokio::test]
    async fn test_corrupt_envelope_stays_unacked() {
        let transport = Arc::new(MemoryTransport::new(Duration::from_secs(30)));
        let target = Arc::new(MemoryTarget::new());
        let metadata = MessageMetadata {
            table: "SampleTable1".into(),
            change_from: 0,
            change_to: 1,
            changes: 1,
        };
        transport
            .enqueue_raw(metadata.to_properties(), b"not gzip at all".to_vec())
            .unwrap();

        let consumer = delivery_loop(transport.clone(), target.clone(), quick_config());
        let delivery = transport.receive(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(consumer.process(delivery).await, DeliveryOutcome::Abandoned);

        assert_eq!(transport.acked_count(), 0);
        assert_eq!(transport.pending_count(), 1);
        assert!(target.rows("SampleTable1").is_empty());
        assert_eq!(consumer.stats().snapshot().failed, 1);
    }

    #[tokio::test]
    async fn test_repeated_failure_is_dead_lettered() {
        let transport = Arc::new(MemoryTransport::new(Duration::from_secs(30)));
        let target = Arc::new(MemoryTarget::new());
        transport
            .enqueue_raw(Default::default(), vec![1, 2, 3])
            .unwrap();

        let consumer = delivery_loop(transport.clone(), target, quick_config());
        let mut outcomes = Vec::new();
        while let Some(delivery) = transport.receive(Duration::ZERO).await.unwrap() {
            outcomes.push(consumer.process(delivery).await);
        }

        assert_eq!(
            outcomes,
            vec![
                DeliveryOutcome::Abandoned,
                DeliveryOutcome::Abandoned,
                DeliveryOutcome::DeadLettered
            ]
        );
        assert_eq!(transport.dead_letter_count(), 1);
    }

    #[tokio::test]
    async fn test_target_failure_abandons_then_recovers() {
        let transport = Arc::new(MemoryTransport::new(Duration::from_secs(30)));
        let target = Arc::new(MemoryTarget::new());
        send(&transport, "SampleTable1", 0, 2).await;

        let consumer = delivery_loop(transport.clone(), target.clone(), quick_config());
        target.set_unavailable(true);
        let delivery = transport.receive(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(consumer.process(delivery).await, DeliveryOutcome::Abandoned);

        target.set_unavailable(false);
        consumer.drain().await.unwrap();
        assert_eq!(transport.acked_count(), 1);
        assert_eq!(target.rows("SampleTable1").len(), 2);
    }

    #[tokio::test]
    async fn test_receive_errors_reach_observer() {
        let transport = Arc::new(MemoryTransport::new(Duration::from_secs(30)));
        transport.set_unavailable(true);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let consumer = delivery_loop(transport.clone(), Arc::new(MemoryTarget::new()), quick_config())
            .with_error_observer(Arc::new(move |e: &TransportError| {
                sink.lock().unwrap().push(e.to_string());
            }));

        let (tx, rx) = broadcast::channel(1);
        let run = tokio::spawn(async move { consumer.run(rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();
        run.await.unwrap().unwrap();

        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        assert!(seen[0].contains("unavailable"));
    }

    /// Counts concurrent upserts and holds each one briefly.
    struct SlowTarget {
        inner: MemoryTarget,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl TargetStore for SlowTarget {
        async fn upsert(&self, statement: &UpsertStatement) -> anyhow::Result<RowOutcome> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            let outcome = self.inner.upsert(statement).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            outcome
        }
    }

    #[tokio::test]
    async fn test_handlers_respect_concurrency_limit() {
        let transport = Arc::new(MemoryTransport::new(Duration::from_secs(30)));
        for i in 0..8 {
            send(&transport, &format!("Table{}", i), 0, 2).await;
        }
        let target = Arc::new(SlowTarget {
            inner: MemoryTarget::new(),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });

        let consumer = delivery_loop(transport.clone(), target.clone(), quick_config());
        let (tx, rx) = broadcast::channel(1);
        let run = tokio::spawn(async move { consumer.run(rx).await });

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while transport.acked_count() < 8 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(()).unwrap();
        run.await.unwrap().unwrap();

        assert_eq!(transport.acked_count(), 8);
        let peak = target.peak.load(Ordering::SeqCst);
        assert!(peak >= 1 && peak <= 2, "peak concurrency was {}", peak);
    }
}
