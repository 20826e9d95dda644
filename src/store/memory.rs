use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

use super::{AuditStore, KvStore, StoreError};
use crate::security::audit_log::AuditRecord;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// In-process TTL map. Expired keys are invisible immediately and removed lazily.
#[derive(Debug, Clone, Default)]
pub struct MemoryKvStore {
    entries: Arc<DashMap<String, Entry>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired key. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
            Some(_) => {}
            None => return Ok(None),
        }
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let expires_at = (!ttl.is_zero()).then(|| Instant::now() + ttl);
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Keeps every flushed batch in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditStore {
    records: Arc<Mutex<Vec<AuditRecord>>>,
    batches: Arc<Mutex<Vec<usize>>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Size of each batch in the order it was written.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().clone()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn create_batch(&self, records: &[AuditRecord]) -> Result<(), StoreError> {
        self.records.lock().extend_from_slice(records);
        self.batches.lock().push(records.len());
        Ok(())
    }
}

/// Writes records to the `audit` tracing target. Used when no database is wired.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditStore;

#[async_trait]
impl AuditStore for TracingAuditStore {
    async fn create_batch(&self, records: &[AuditRecord]) -> Result<(), StoreError> {
        for r in records {
            info!(
                target: "audit",
                event = "operation",
                user_id = r.user_id.unwrap_or(0),
                ip = %r.ip,
                method = %r.method,
                path = %r.path,
                status = r.status,
                latency_ms = r.latency_ms,
                request_id = %r.request_id,
                error = r.error_msg.as_deref().unwrap_or(""),
            );
        }
        Ok(())
    }
}
