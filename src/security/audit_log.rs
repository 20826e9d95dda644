use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::AuditConfig;
use crate::store::AuditStore;

/// Request and response bodies are cut to this many bytes before queueing.
pub const MAX_BODY_LOG_SIZE: usize = 1024 * 1024;

const TRUNCATED_SUFFIX: &str = "...(truncated)";

/// Snapshot of one completed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub user_id: Option<u64>,
    pub ip: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub latency_ms: u64,
    pub agent: String,
    pub body: String,
    pub resp: String,
    pub request_id: String,
    pub trace_id: String,
    pub error_msg: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            user_id: None,
            ip: String::new(),
            method: method.into(),
            path: path.into(),
            status: 0,
            latency_ms: 0,
            agent: String::new(),
            body: String::new(),
            resp: String::new(),
            request_id: String::new(),
            trace_id: String::new(),
            error_msg: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_bodies(mut self, body: &[u8], resp: &[u8]) -> Self {
        self.body = truncate_body(&String::from_utf8_lossy(body), MAX_BODY_LOG_SIZE);
        self.resp = truncate_body(&String::from_utf8_lossy(resp), MAX_BODY_LOG_SIZE);
        self
    }
}

/// Cut `s` to at most `max` bytes on a char boundary, marking the cut.
pub fn truncate_body(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = String::with_capacity(end + TRUNCATED_SUFFIX.len());
    out.push_str(&s[..end]);
    out.push_str(TRUNCATED_SUFFIX);
    out
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit worker did not finish draining within {0:?}")]
    CloseTimeout(Duration),
    #[error("audit batcher is already closed")]
    AlreadyClosed,
    #[error("audit worker failed: {0}")]
    Worker(String),
}

#[derive(Debug, Default)]
struct Counters {
    pushed: AtomicU64,
    dropped: AtomicU64,
    flushed: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AuditStats {
    /// Accepted into the queue.
    pub pushed: u64,
    /// Rejected because the queue was full or closed.
    pub dropped: u64,
    /// Written to the store.
    pub flushed: u64,
    /// Lost to failed batch writes.
    pub failed: u64,
}

/// Moves audit persistence off the request path.
///
/// `push` enqueues into a bounded channel and never waits: when the queue is
/// full the record is dropped with a warning, trading audit completeness for
/// caller latency. A single worker task batches records and writes them when
/// the batch reaches `batch_size` or `flush_interval` passes without a flush.
/// A failed write is logged and the batch discarded.
///
/// Shutdown is close-then-drain-then-confirm: [`AuditBatcher::close`] signals
/// the worker, the worker closes the queue so later pushes are refused,
/// drains what is buffered, writes the final batch and exits; `close` waits
/// for that exit up to its timeout.
#[derive(Debug)]
pub struct AuditBatcher {
    tx: mpsc::Sender<AuditRecord>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl AuditBatcher {
    /// Start the worker. Must be called inside a tokio runtime.
    pub fn spawn(store: Arc<dyn AuditStore>, config: &AuditConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let counters = Arc::new(Counters::default());

        let worker = Worker {
            rx,
            shutdown: shutdown_rx,
            store,
            batch_size: config.batch_size.max(1),
            flush_interval: config.flush_interval,
            counters: counters.clone(),
        };
        let handle = tokio::spawn(worker.run());

        Self {
            tx,
            shutdown: Mutex::new(Some(shutdown_tx)),
            worker: Mutex::new(Some(handle)),
            counters,
        }
    }

    /// Enqueue a record without waiting. Drops it when the queue is full or closed.
    pub fn push(&self, record: AuditRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {
                self.counters.pushed.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(record)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(target: "audit", path = %record.path, "audit record dropped, queue full");
            }
            Err(mpsc::error::TrySendError::Closed(record)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(target: "audit", path = %record.path, "audit record dropped, batcher closed");
            }
        }
    }

    /// Stop accepting records, flush what is buffered and wait for the worker.
    ///
    /// On timeout the worker is left running to finish in the background.
    pub async fn close(&self, timeout: Duration) -> Result<(), AuditError> {
        let signal = self.shutdown.lock().take().ok_or(AuditError::AlreadyClosed)?;
        let _ = signal.send(());

        let Some(mut handle) = self.worker.lock().take() else {
            return Err(AuditError::AlreadyClosed);
        };

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => {
                info!(target: "audit", "audit batcher closed gracefully");
                Ok(())
            }
            Ok(Err(join_err)) => {
                error!(target: "audit", error = %join_err, "audit worker terminated abnormally");
                Err(AuditError::Worker(join_err.to_string()))
            }
            Err(_) => {
                warn!(target: "audit", ?timeout, "audit batcher close timed out, draining in background");
                Err(AuditError::CloseTimeout(timeout))
            }
        }
    }

    pub fn stats(&self) -> AuditStats {
        AuditStats {
            pushed: self.counters.pushed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            flushed: self.counters.flushed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

struct Worker {
    rx: mpsc::Receiver<AuditRecord>,
    shutdown: oneshot::Receiver<()>,
    store: Arc<dyn AuditStore>,
    batch_size: usize,
    flush_interval: Duration,
    counters: Arc<Counters>,
}

impl Worker {
    async fn run(mut self) {
        let mut batch = Vec::with_capacity(self.batch_size);
        let mut ticker = interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                maybe = self.rx.recv() => match maybe {
                    Some(record) => {
                        batch.push(record);
                        if batch.len() >= self.batch_size {
                            self.flush(&mut batch).await;
                            ticker.reset();
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        self.flush(&mut batch).await;
                    }
                }
                // Fires on close() and also when the batcher is dropped.
                _ = &mut self.shutdown => break,
            }
        }

        self.rx.close();
        while let Some(record) = self.rx.recv().await {
            batch.push(record);
            if batch.len() >= self.batch_size {
                self.flush(&mut batch).await;
            }
        }
        if !batch.is_empty() {
            self.flush(&mut batch).await;
        }
        debug!(target: "audit", "audit worker drained and stopped");
    }

    async fn flush(&self, batch: &mut Vec<AuditRecord>) {
        let count = batch.len() as u64;
        match self.store.create_batch(batch).await {
            Ok(()) => {
                self.counters.flushed.fetch_add(count, Ordering::Relaxed);
                debug!(target: "audit", count, "audit batch flushed");
            }
            Err(err) => {
                self.counters.failed.fetch_add(count, Ordering::Relaxed);
                error!(target: "audit", error = %err, count, "audit batch write failed, batch discarded");
            }
        }
        batch.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryAuditStore, StoreError};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use tokio::sync::Semaphore;

    fn config(capacity: usize, batch_size: usize) -> AuditConfig {
        AuditConfig {
            capacity,
            batch_size,
            flush_interval: Duration::from_secs(2),
            close_timeout: Duration::from_secs(5),
        }
    }

    fn record(n: usize) -> AuditRecord {
        let mut r = AuditRecord::new("POST", format!("/items/{n}"));
        r.request_id = format!("req-{n}");
        r
    }

    /// Store whose writes wait for a permit.
    #[derive(Debug)]
    struct GatedStore {
        gate: Semaphore,
        inner: MemoryAuditStore,
    }

    #[async_trait]
    impl AuditStore for GatedStore {
        async fn create_batch(&self, records: &[AuditRecord]) -> Result<(), StoreError> {
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            permit.forget();
            self.inner.create_batch(records).await
        }
    }

    #[derive(Debug, Default)]
    struct FailingStore;

    #[async_trait]
    impl AuditStore for FailingStore {
        async fn create_batch(&self, _records: &[AuditRecord]) -> Result<(), StoreError> {
            Err(StoreError::Backend("disk full".into()))
        }
    }

    #[test]
    fn test_truncate_body_respects_char_boundary() {
        let s = "é".repeat(10); // 20 bytes
        let cut = truncate_body(&s, 5);
        assert_eq!(cut, format!("éé{TRUNCATED_SUFFIX}"));
        assert_eq!(truncate_body("short", 10), "short");
    }

    #[test]
    fn test_with_bodies_caps_at_one_mebibyte() {
        let big = vec![b'a'; MAX_BODY_LOG_SIZE + 10];
        let r = AuditRecord::new("POST", "/upload").with_bodies(&big, b"ok");
        assert_eq!(r.body.len(), MAX_BODY_LOG_SIZE + TRUNCATED_SUFFIX.len());
        assert!(r.body.ends_with(TRUNCATED_SUFFIX));
        assert_eq!(r.resp, "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_when_batch_is_full() {
        let store = MemoryAuditStore::new();
        let batcher = AuditBatcher::spawn(Arc::new(store.clone()), &config(100, 3));
        for n in 0..3 {
            batcher.push(record(n));
        }
        // Let the worker run without reaching the flush interval.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(store.batch_sizes(), vec![3]);
        batcher.close(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_on_interval() {
        let store = MemoryAuditStore::new();
        let batcher = AuditBatcher::spawn(Arc::new(store.clone()), &config(100, 50));
        batcher.push(record(1));
        batcher.push(record(2));

        tokio::time::sleep(Duration::from_millis(1_900)).await;
        assert!(store.is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.len(), 2);
        batcher.close(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_never_blocks_and_drops_when_full() {
        let store = Arc::new(GatedStore {
            gate: Semaphore::new(0),
            inner: MemoryAuditStore::new(),
        });
        let batcher = AuditBatcher::spawn(store.clone(), &config(4, 1));

        let started = std::time::Instant::now();
        for n in 0..10 {
            batcher.push(record(n));
        }
        assert!(started.elapsed() < Duration::from_secs(1));

        let stats = batcher.stats();
        assert_eq!(stats.pushed, 4);
        assert_eq!(stats.dropped, 6);

        store.gate.add_permits(100);
        batcher.close(Duration::from_secs(5)).await.unwrap();
        assert_eq!(store.inner.len(), 4);
        assert!(store.inner.len() < 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_drains_every_record_exactly_once() {
        let store = MemoryAuditStore::new();
        let batcher = AuditBatcher::spawn(Arc::new(store.clone()), &config(1_000, 7));
        for n in 0..250 {
            batcher.push(record(n));
        }
        batcher.close(Duration::from_secs(30)).await.unwrap();

        let records = store.records();
        assert_eq!(records.len(), 250);
        let unique: HashSet<_> = records.iter().map(|r| r.request_id.clone()).collect();
        assert_eq!(unique.len(), 250);
        assert_eq!(batcher.stats().flushed, 250);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_preserve_push_order() {
        let store = MemoryAuditStore::new();
        let batcher = AuditBatcher::spawn(Arc::new(store.clone()), &config(100, 10));
        for n in 0..25 {
            batcher.push(record(n));
        }
        batcher.close(Duration::from_secs(5)).await.unwrap();

        let ids: Vec<_> = store.records().into_iter().map(|r| r.request_id).collect();
        let expected: Vec<_> = (0..25).map(|n| format!("req-{n}")).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_after_close_is_dropped() {
        let store = MemoryAuditStore::new();
        let batcher = AuditBatcher::spawn(Arc::new(store.clone()), &config(10, 10));
        batcher.close(Duration::from_secs(1)).await.unwrap();

        batcher.push(record(1));
        assert_eq!(batcher.stats().dropped, 1);
        assert!(store.is_empty());
        assert!(matches!(
            batcher.close(Duration::from_secs(1)).await,
            Err(AuditError::AlreadyClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_timeout_leaves_worker_draining() {
        let store = Arc::new(GatedStore {
            gate: Semaphore::new(0),
            inner: MemoryAuditStore::new(),
        });
        let batcher = AuditBatcher::spawn(store.clone(), &config(10, 10));
        batcher.push(record(1));

        let result = batcher.close(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(AuditError::CloseTimeout(_))));

        store.gate.add_permits(1);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(store.inner.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_is_discarded() {
        let batcher = AuditBatcher::spawn(Arc::new(FailingStore), &config(10, 2));
        batcher.push(record(1));
        batcher.push(record(2));
        batcher.push(record(3));
        batcher.close(Duration::from_secs(1)).await.unwrap();

        let stats = batcher.stats();
        assert_eq!(stats.failed, 3);
        assert_eq!(stats.flushed, 0);
    }
}
