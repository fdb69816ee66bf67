//! Bounded ingestion buffer with batched persistence and broadcast staging.
//!
//! One producer path (`enqueue`, called from many handlers), one drainer.
//! The drainer bulk-inserts batches into the store and hands persisted
//! events to a staging buffer, which a second task feeds to the broadcast
//! hub in small ticks.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use opspulse_broadcast::BroadcastHub;
use opspulse_core::Event;
use opspulse_store::EventStore;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_queue_size: usize,
    pub batch_size: usize,
    pub batch_interval: Duration,
    pub broadcast_batch_size: usize,
    pub broadcast_batch_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            batch_size: 100,
            batch_interval: Duration::from_secs(1),
            broadcast_batch_size: 10,
            broadcast_batch_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    QueueFull,
    ShuttingDown,
}

/// Admission verdict. Rejection is a value, never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueue {
    Accepted { queue_size: usize },
    Rejected { reason: RejectReason, queue_size: usize },
}

impl Enqueue {
    pub fn accepted(&self) -> bool {
        matches!(self, Enqueue::Accepted { .. })
    }
}

/// Load snapshot for the admission gate and health surfaces.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueTelemetry {
    pub queue_size: usize,
    pub max_queue_size: usize,
    /// 0.0..=1.0.
    pub utilization: f64,
    pub under_pressure: bool,
    pub dropped_batches: u64,
    pub inserted_total: u64,
    pub duplicates_total: u64,
}

#[derive(Debug, Default)]
struct Inner {
    queue: VecDeque<Event>,
    staging: VecDeque<Event>,
    accepting: bool,
}

/// The ingest buffer. Share behind an `Arc`; spawn its workers once.
#[derive(Debug)]
pub struct EventQueue {
    config: QueueConfig,
    inner: Mutex<Inner>,
    drain_wakeup: Notify,
    stage_wakeup: Notify,
    dropped_batches: AtomicU64,
    inserted_total: AtomicU64,
    duplicates_total: AtomicU64,
}

impl EventQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                staging: VecDeque::new(),
                accepting: true,
            }),
            drain_wakeup: Notify::new(),
            stage_wakeup: Notify::new(),
            dropped_batches: AtomicU64::new(0),
            inserted_total: AtomicU64::new(0),
            duplicates_total: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Synchronous, non-blocking admission. Never panics, never waits.
    pub fn enqueue(&self, event: Event) -> Enqueue {
        let mut inner = self.lock();
        if !inner.accepting {
            return Enqueue::Rejected {
                reason: RejectReason::ShuttingDown,
                queue_size: inner.queue.len(),
            };
        }
        if inner.queue.len() >= self.config.max_queue_size {
            return Enqueue::Rejected {
                reason: RejectReason::QueueFull,
                queue_size: inner.queue.len(),
            };
        }
        inner.queue.push_back(event);
        let queue_size = inner.queue.len();
        drop(inner);
        self.drain_wakeup.notify_one();
        Enqueue::Accepted { queue_size }
    }

    pub fn queue_size(&self) -> usize {
        self.lock().queue.len()
    }

    /// Queue fill ratio, 0.0..=1.0.
    pub fn utilization(&self) -> f64 {
        self.queue_size() as f64 / self.config.max_queue_size.max(1) as f64
    }

    /// High-water flag: utilization at or past 80%.
    pub fn under_pressure(&self) -> bool {
        self.utilization() >= 0.80
    }

    pub fn telemetry(&self) -> QueueTelemetry {
        let queue_size = self.queue_size();
        let utilization = queue_size as f64 / self.config.max_queue_size.max(1) as f64;
        QueueTelemetry {
            queue_size,
            max_queue_size: self.config.max_queue_size,
            utilization,
            under_pressure: utilization >= 0.80,
            dropped_batches: self.dropped_batches.load(Ordering::Relaxed),
            inserted_total: self.inserted_total.load(Ordering::Relaxed),
            duplicates_total: self.duplicates_total.load(Ordering::Relaxed),
        }
    }

    /// Pop up to one persistence batch from the head.
    fn take_batch(&self) -> Vec<Event> {
        let mut inner = self.lock();
        let n = inner.queue.len().min(self.config.batch_size);
        inner.queue.drain(..n).collect()
    }

    fn take_stage_batch(&self) -> Vec<Event> {
        let mut inner = self.lock();
        let n = inner.staging.len().min(self.config.broadcast_batch_size);
        inner.staging.drain(..n).collect()
    }

    /// Persist one batch; on success move the inserted events to staging.
    /// On failure the batch is dropped; redelivery would duplicate events.
    async fn persist_batch(&self, store: &dyn EventStore, batch: Vec<Event>) {
        if batch.is_empty() {
            return;
        }
        let size = batch.len();
        match store.insert_many(batch.clone()).await {
            Ok(report) => {
                self.inserted_total.fetch_add(report.inserted, Ordering::Relaxed);
                self.duplicates_total
                    .fetch_add(report.duplicates.len() as u64, Ordering::Relaxed);
                let rejected: HashSet<_> = report.duplicates.iter().copied().collect();
                let mut inner = self.lock();
                inner
                    .staging
                    .extend(batch.into_iter().filter(|e| !rejected.contains(&e.event_id)));
                drop(inner);
                self.stage_wakeup.notify_one();
            }
            Err(err) => {
                self.dropped_batches.fetch_add(1, Ordering::Relaxed);
                tracing::error!(%err, size, "bulk insert failed, dropping batch");
            }
        }
    }

    /// Block intake, then drain queue and staging to empty.
    pub async fn flush(&self, store: &dyn EventStore, hub: &BroadcastHub) {
        self.lock().accepting = false;
        loop {
            let batch = self.take_batch();
            if batch.is_empty() {
                break;
            }
            self.persist_batch(store, batch).await;
        }
        loop {
            let staged = self.take_stage_batch();
            if staged.is_empty() {
                break;
            }
            for event in &staged {
                hub.publish_event(event);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle to the queue's two background tasks.
pub struct QueueHandle {
    queue: Arc<EventQueue>,
    store: Arc<dyn EventStore>,
    hub: Arc<BroadcastHub>,
    shutdown: watch::Sender<bool>,
    drain: JoinHandle<()>,
    stage: JoinHandle<()>,
}

impl QueueHandle {
    /// Stop the workers, then flush whatever is still buffered.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.drain.await;
        let _ = self.stage.await;
        self.queue.flush(self.store.as_ref(), self.hub.as_ref()).await;
    }
}

/// Spawn the drainer and the broadcast stager for a queue.
pub fn start(
    queue: Arc<EventQueue>,
    store: Arc<dyn EventStore>,
    hub: Arc<BroadcastHub>,
) -> QueueHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let drain = {
        let queue = queue.clone();
        let store = store.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                let batch = queue.take_batch();
                let drained_full = batch.len() == queue.config().batch_size;
                queue.persist_batch(store.as_ref(), batch).await;

                // Reschedule immediately while there is work; otherwise arm
                // the interval timer and wait for an enqueue or the clock.
                if drained_full && queue.queue_size() > 0 {
                    continue;
                }
                tokio::select! {
                    _ = queue.drain_wakeup.notified() => {}
                    _ = tokio::time::sleep(queue.config().batch_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    };

    let stage = {
        let queue = queue.clone();
        let hub = hub.clone();
        let mut shutdown = shutdown_rx;
        tokio::spawn(async move {
            loop {
                let staged = queue.take_stage_batch();
                for event in &staged {
                    hub.publish_event(event);
                }
                if !staged.is_empty() {
                    continue;
                }
                tokio::select! {
                    _ = queue.stage_wakeup.notified() => {}
                    _ = tokio::time::sleep(queue.config().broadcast_batch_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    };

    QueueHandle {
        queue,
        store,
        hub,
        shutdown: shutdown_tx,
        drain,
        stage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use opspulse_broadcast::HubConfig;
    use opspulse_core::{EventId, IncidentId, Severity};
    use opspulse_store::{
        EventFilter, EventSort, EventStatsSummary, InMemoryStore, InsertReport, Page, Pagination,
        StoreError,
    };

    fn event(service: &str) -> Event {
        Event::new(service, Severity::clamped(3), json!({}))
    }

    fn small_queue(max: usize) -> EventQueue {
        EventQueue::new(QueueConfig {
            max_queue_size: max,
            batch_size: 4,
            batch_interval: Duration::from_millis(20),
            broadcast_batch_size: 2,
            broadcast_batch_interval: Duration::from_millis(5),
        })
    }

    /// Store whose bulk inserts can be toggled to fail.
    struct FlakyStore {
        inner: InMemoryStore,
        fail: AtomicBool,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: InMemoryStore::new(),
                fail: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl EventStore for FlakyStore {
        async fn insert_many(&self, events: Vec<Event>) -> Result<InsertReport, StoreError> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(StoreError::unavailable("injected failure"));
            }
            self.inner.insert_many(events).await
        }

        async fn find_recent_unassigned(
            &self,
            since: DateTime<Utc>,
        ) -> Result<Vec<Event>, StoreError> {
            self.inner.find_recent_unassigned(since).await
        }

        async fn find_by_ids(
            &self,
            ids: &[EventId],
            limit: usize,
        ) -> Result<Vec<Event>, StoreError> {
            self.inner.find_by_ids(ids, limit).await
        }

        async fn assign_incident(
            &self,
            ids: &[EventId],
            incident_id: IncidentId,
        ) -> Result<u64, StoreError> {
            self.inner.assign_incident(ids, incident_id).await
        }

        async fn get_event(&self, id: EventId) -> Result<Option<Event>, StoreError> {
            self.inner.get_event(id).await
        }

        async fn list_events(
            &self,
            filter: &EventFilter,
            pagination: Pagination,
            sort: EventSort,
        ) -> Result<Page<Event>, StoreError> {
            self.inner.list_events(filter, pagination, sort).await
        }

        async fn stats(
            &self,
            start: Option<DateTime<Utc>>,
            end: Option<DateTime<Utc>>,
        ) -> Result<EventStatsSummary, StoreError> {
            self.inner.stats(start, end).await
        }
    }

    #[test]
    fn rejects_when_full_without_throwing() {
        let queue = small_queue(2);
        assert!(queue.enqueue(event("a")).accepted());
        assert!(queue.enqueue(event("a")).accepted());
        match queue.enqueue(event("a")) {
            Enqueue::Rejected { reason, queue_size } => {
                assert_eq!(reason, RejectReason::QueueFull);
                assert_eq!(queue_size, 2);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(queue.queue_size(), 2);
    }

    #[test]
    fn pressure_thresholds() {
        let queue = small_queue(10);
        for _ in 0..7 {
            queue.enqueue(event("a"));
        }
        assert!(!queue.under_pressure());
        queue.enqueue(event("a"));
        assert!(queue.under_pressure());
        let telemetry = queue.telemetry();
        assert_eq!(telemetry.queue_size, 8);
        assert!((telemetry.utilization - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn drains_batches_and_broadcasts_in_order() {
        let queue = Arc::new(small_queue(100));
        let store = Arc::new(InMemoryStore::new());
        let hub = Arc::new(BroadcastHub::new(HubConfig::default()));
        let (_, mut rx) = hub.attach();

        let handle = start(queue.clone(), store.clone(), hub.clone());

        let mut sent = Vec::new();
        for _ in 0..10 {
            let e = event("orders");
            sent.push(e.event_id);
            assert!(queue.enqueue(e).accepted());
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.queue_size(), 0);
        assert_eq!(queue.telemetry().inserted_total, 10);

        let mut seen = Vec::new();
        // Greeting frame first, then events in enqueue order.
        while let Ok(frame) = rx.try_recv() {
            if let opspulse_broadcast::Outbound::Frame(
                opspulse_broadcast::ServerFrame::Event { data, .. },
            ) = frame
            {
                seen.push(data.event_id);
            }
        }
        assert_eq!(seen, sent);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn failed_batches_are_dropped_not_redelivered() {
        let queue = Arc::new(small_queue(100));
        let store = Arc::new(FlakyStore::new());
        store.fail.store(true, Ordering::Relaxed);
        let hub = Arc::new(BroadcastHub::new(HubConfig::default()));

        let handle = start(queue.clone(), store.clone(), hub.clone());
        for _ in 0..4 {
            queue.enqueue(event("orders"));
        }
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(queue.queue_size(), 0);
        let telemetry = queue.telemetry();
        assert!(telemetry.dropped_batches >= 1);
        assert_eq!(telemetry.inserted_total, 0);

        // Recovery: later batches persist normally.
        store.fail.store(false, Ordering::Relaxed);
        queue.enqueue(event("orders"));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(queue.telemetry().inserted_total, 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn duplicates_are_not_rebroadcast() {
        let queue = Arc::new(small_queue(100));
        let store = Arc::new(InMemoryStore::new());
        let hub = Arc::new(BroadcastHub::new(HubConfig::default()));
        let (_, mut rx) = hub.attach();

        let e = event("orders");
        store.insert_many(vec![e.clone()]).await.unwrap();

        queue.enqueue(e);
        queue.flush(store.as_ref(), hub.as_ref()).await;

        let mut events = 0;
        while let Ok(frame) = rx.try_recv() {
            if matches!(
                frame,
                opspulse_broadcast::Outbound::Frame(opspulse_broadcast::ServerFrame::Event { .. })
            ) {
                events += 1;
            }
        }
        assert_eq!(events, 0);
        assert_eq!(queue.telemetry().duplicates_total, 1);
    }

    #[tokio::test]
    async fn flush_blocks_intake_and_drains_everything() {
        let queue = Arc::new(small_queue(100));
        let store = Arc::new(InMemoryStore::new());
        let hub = Arc::new(BroadcastHub::new(HubConfig::default()));

        for _ in 0..9 {
            queue.enqueue(event("orders"));
        }
        queue.flush(store.as_ref(), hub.as_ref()).await;

        assert_eq!(queue.queue_size(), 0);
        assert_eq!(queue.telemetry().inserted_total, 9);
        assert!(matches!(
            queue.enqueue(event("orders")),
            Enqueue::Rejected {
                reason: RejectReason::ShuttingDown,
                ..
            }
        ));
    }
}
