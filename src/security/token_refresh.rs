use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

/// Collapses concurrent calls with the same key into one execution.
///
/// The first caller for a key becomes the leader and runs `work`; callers
/// arriving while it runs await the same cell and receive a clone of its
/// output, success or error alike. The key is removed once the work completes,
/// so the next call after that starts a fresh flight.
///
/// If the leader is cancelled mid-flight, a waiting joiner takes over and runs
/// its own `work`; the key stays registered so later callers join the
/// takeover instead of starting a second flight.
#[derive(Debug)]
pub struct SingleFlight<T> {
    calls: DashMap<String, Arc<OnceCell<T>>>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            calls: DashMap::new(),
        }
    }
}

impl<T: Clone> SingleFlight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run<F, Fut>(&self, key: &str, work: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let (cell, leader) = match self.calls.entry(key.to_string()) {
            Entry::Occupied(existing) => (Arc::clone(existing.get()), false),
            Entry::Vacant(slot) => {
                let cell = Arc::new(OnceCell::new());
                slot.insert(Arc::clone(&cell));
                (cell, true)
            }
        };
        if !leader {
            debug!("joining in-flight call");
        }

        let _guard = FlightGuard {
            calls: &self.calls,
            key,
            cell: &cell,
        };
        cell.get_or_init(work).await.clone()
    }

    /// Keys with a call currently running.
    pub fn in_flight(&self) -> usize {
        self.calls.len()
    }
}

struct FlightGuard<'a, T> {
    calls: &'a DashMap<String, Arc<OnceCell<T>>>,
    key: &'a str,
    cell: &'a Arc<OnceCell<T>>,
}

impl<T> Drop for FlightGuard<'_, T> {
    fn drop(&mut self) {
        // The map holds one reference and this caller another. An unfinished
        // flight stays registered while anyone else is still waiting on it.
        // Joiners clone under the shard lock, so the count cannot race them.
        let done = self.cell.initialized();
        self.calls.remove_if(self.key, |_, current| {
            Arc::ptr_eq(current, self.cell) && (done || Arc::strong_count(current) <= 2)
        });
    }
}
