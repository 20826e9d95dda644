//! Collaborator seams consumed by the governance pipeline.
//!
//! The pipeline never owns persistence. It talks to a key-value store with
//! native TTL (revocation list) and to a record store that accepts bulk
//! inserts (audit trail). In-memory and log-backed implementations live in
//! [`memory`].

pub mod memory;

use async_trait::async_trait;
use std::time::Duration;

use crate::security::audit_log::AuditRecord;

pub use memory::{MemoryAuditStore, MemoryKvStore, TracingAuditStore};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store operation failed: {0}")]
    Backend(String),
}

/// Key-value store with per-key expiry.
#[async_trait]
pub trait KvStore: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// `ttl == Duration::ZERO` stores the value without expiry.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Bulk sink for completed-request records. Partial success is reported as failure.
#[async_trait]
pub trait AuditStore: Send + Sync + std::fmt::Debug {
    async fn create_batch(&self, records: &[AuditRecord]) -> Result<(), StoreError>;
}
