use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::config::RateLimitConfig;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

impl Bucket {
    fn full(burst: f64, now: Instant) -> Self {
        Self {
            tokens: burst,
            last_refill: now,
            last_seen: now,
        }
    }

    fn try_take(&mut self, qps: f64, burst: f64, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * qps).min(burst);
        self.last_refill = now;
        self.last_seen = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Debug)]
struct Buckets {
    qps: f64,
    burst: f64,
    by_key: DashMap<String, Mutex<Bucket>>,
}

/// Token-bucket limiter keyed by caller (usually the client IP).
///
/// Every key gets its own bucket with the process-wide refill rate and burst.
/// Buckets are created on first sight and live until [`RateLimiter::evict_idle`]
/// removes them, so the map grows with key cardinality; run the sweeper in
/// deployments exposed to many distinct callers.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    inner: Option<Arc<Buckets>>,
}

impl RateLimiter {
    pub fn new(qps: u32, burst: u32) -> Self {
        Self {
            inner: Some(Arc::new(Buckets {
                qps: f64::from(qps),
                burst: f64::from(burst),
                by_key: DashMap::new(),
            })),
        }
    }

    /// A limiter that admits everything and keeps no state.
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn from_config(cfg: &RateLimitConfig) -> Self {
        if cfg.enabled {
            Self::new(cfg.qps, cfg.burst)
        } else {
            Self::disabled()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Consume one token for `key`. Never waits; `false` means the bucket is empty.
    pub fn allow(&self, key: &str) -> bool {
        let Some(buckets) = self.inner.as_ref() else {
            return true;
        };
        let now = Instant::now();

        if let Some(bucket) = buckets.by_key.get(key) {
            return bucket.lock().try_take(buckets.qps, buckets.burst, now);
        }

        // Concurrent first callers race on the shard lock; only the winner's bucket is kept.
        let bucket = buckets
            .by_key
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(Bucket::full(buckets.burst, now)));
        let allowed = bucket.lock().try_take(buckets.qps, buckets.burst, now);
        allowed
    }

    /// Remove buckets not touched for `idle`. Returns how many were dropped.
    pub fn evict_idle(&self, idle: Duration) -> usize {
        let Some(buckets) = self.inner.as_ref() else {
            return 0;
        };
        let now = Instant::now();
        let before = buckets.by_key.len();
        buckets
            .by_key
            .retain(|_, bucket| now.saturating_duration_since(bucket.get_mut().last_seen) < idle);
        before.saturating_sub(buckets.by_key.len())
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.inner.as_ref().map_or(0, |b| b.by_key.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Background eviction of idle buckets, off the request path.
    pub fn spawn_sweeper(&self, interval: Duration, idle: Duration) -> Option<JoinHandle<()>> {
        if !self.is_enabled() {
            return None;
        }
        let limiter = self.clone();
        Some(tokio::spawn(async move {
            loop {
                // Jitter keeps replicas from sweeping in lockstep.
                let jitter = {
                    use rand::Rng;
                    rand::thread_rng().gen_range(0..=interval.as_millis().min(1_000) as u64 / 10)
                };
                sleep(interval + Duration::from_millis(jitter)).await;

                let evicted = limiter.evict_idle(idle);
                if evicted > 0 {
                    debug!(evicted, remaining = limiter.len(), "evicted idle rate-limit buckets");
                }
            }
        }))
    }
}
