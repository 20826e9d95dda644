use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        };
        f.write_str(s)
    }
}

/// Request tallies for the current generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests += 1;
    }

    fn on_success(&mut self) {
        self.total_successes += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }

    pub fn failure_ratio(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            f64::from(self.total_failures) / f64::from(self.requests)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub name: String,
    pub from: CircuitState,
    pub to: CircuitState,
}

#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("circuit breaker '{0}' is open")]
    Open(String),
    #[error("circuit breaker '{0}' is half-open and its probe slots are taken")]
    TooManyProbes(String),
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// True for the two short-circuit rejections (the wrapped call never ran).
    pub fn is_rejection(&self) -> bool {
        matches!(self, BreakerError::Open(_) | BreakerError::TooManyProbes(_))
    }
}

enum Rejection {
    Open,
    TooManyProbes,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
    pending: Vec<(CircuitState, CircuitState)>,
}

/// Closed / open / half-open state machine guarding one endpoint group.
///
/// While closed, calls run and their outcomes are tallied over a rolling
/// window of `interval`. Once `min_requests` calls have been seen and the
/// failure ratio reaches `failure_ratio`, the breaker opens and rejects
/// everything for `open_timeout`. After that it admits up to `max_probes`
/// probe calls: that many consecutive successes close it again, any failure
/// reopens it and restarts the cool-down.
///
/// An outcome reported for a generation that has since ended is ignored, so a
/// slow call started before a trip cannot close the breaker after it.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    settings: BreakerConfig,
    inner: Mutex<Inner>,
    transitions: broadcast::Sender<StateTransition>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerConfig) -> Self {
        Self::with_transitions(name, settings, broadcast::channel(64).0)
    }

    /// Publish transitions on an existing channel (shared by a registry).
    pub fn with_transitions(
        name: impl Into<String>,
        settings: BreakerConfig,
        transitions: broadcast::Sender<StateTransition>,
    ) -> Self {
        let now = Instant::now();
        let expiry = (!settings.interval.is_zero()).then(|| now + settings.interval);
        Self {
            name: name.into(),
            settings,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry,
                pending: Vec::new(),
            }),
            transitions,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        let state = {
            let mut inner = self.inner.lock();
            self.current(&mut inner, Instant::now()).0
        };
        self.publish_pending();
        state
    }

    pub fn counts(&self) -> Counts {
        self.inner.lock().counts
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions.subscribe()
    }

    /// Run `f` under the breaker; an `Err` from `f` counts as a failure.
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_classified(f, |result| result.is_err()).await
    }

    /// Run `f` under the breaker and let `is_failure` judge the outcome, so an
    /// `Ok` carrying a server-error status can still count against the breaker.
    pub async fn execute_classified<F, Fut, T, E, C>(
        &self,
        f: F,
        is_failure: C,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnOnce(&Result<T, E>) -> bool,
    {
        let generation = match self.before_call() {
            Ok(generation) => generation,
            Err(Rejection::Open) => return Err(BreakerError::Open(self.name.clone())),
            Err(Rejection::TooManyProbes) => {
                return Err(BreakerError::TooManyProbes(self.name.clone()))
            }
        };

        let mut guard = CallGuard {
            breaker: self,
            generation,
            finished: false,
        };
        let result = f().await;
        guard.finish(!is_failure(&result));

        result.map_err(BreakerError::Inner)
    }

    fn before_call(&self) -> Result<u64, Rejection> {
        let outcome = {
            let mut inner = self.inner.lock();
            let (state, generation) = self.current(&mut inner, Instant::now());
            match state {
                CircuitState::Open => Err(Rejection::Open),
                CircuitState::HalfOpen if inner.counts.requests >= self.settings.max_probes => {
                    Err(Rejection::TooManyProbes)
                }
                _ => {
                    inner.counts.on_request();
                    Ok(generation)
                }
            }
        };
        self.publish_pending();
        outcome
    }

    fn after_call(&self, generation: u64, success: bool) {
        {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            let (state, current) = self.current(&mut inner, now);
            if current == generation {
                if success {
                    self.on_success(&mut inner, state, now);
                } else {
                    self.on_failure(&mut inner, state, now);
                }
            }
        }
        self.publish_pending();
    }

    /// A call dropped before completing. In half-open it counts as failed; in
    /// closed it is taken back out of the tally.
    fn abandon_call(&self, generation: u64) {
        {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            let (state, current) = self.current(&mut inner, now);
            if current == generation {
                match state {
                    CircuitState::HalfOpen => self.on_failure(&mut inner, state, now),
                    CircuitState::Closed => {
                        inner.counts.requests = inner.counts.requests.saturating_sub(1);
                    }
                    CircuitState::Open => {}
                }
            }
        }
        self.publish_pending();
    }

    fn on_success(&self, inner: &mut Inner, state: CircuitState, now: Instant) {
        match state {
            CircuitState::Closed => inner.counts.on_success(),
            CircuitState::HalfOpen => {
                inner.counts.on_success();
                if inner.counts.consecutive_successes >= self.settings.max_probes {
                    self.set_state(inner, CircuitState::Closed, now);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, inner: &mut Inner, state: CircuitState, now: Instant) {
        match state {
            CircuitState::Closed => {
                inner.counts.on_failure();
                if self.ready_to_trip(&inner.counts) {
                    self.set_state(inner, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => self.set_state(inner, CircuitState::Open, now),
            CircuitState::Open => {}
        }
    }

    fn ready_to_trip(&self, counts: &Counts) -> bool {
        counts.requests >= self.settings.min_requests
            && counts.failure_ratio() >= self.settings.failure_ratio
    }

    /// Apply time-driven transitions: window rollover while closed, cool-down end while open.
    fn current(&self, inner: &mut Inner, now: Instant) -> (CircuitState, u64) {
        match inner.state {
            CircuitState::Closed => {
                if matches!(inner.expiry, Some(at) if at <= now) {
                    self.new_generation(inner, now);
                }
            }
            CircuitState::Open => {
                if matches!(inner.expiry, Some(at) if at <= now) {
                    self.set_state(inner, CircuitState::HalfOpen, now);
                }
            }
            CircuitState::HalfOpen => {}
        }
        (inner.state, inner.generation)
    }

    fn set_state(&self, inner: &mut Inner, to: CircuitState, now: Instant) {
        if inner.state == to {
            return;
        }
        let from = inner.state;
        inner.state = to;
        self.new_generation(inner, now);
        inner.pending.push((from, to));
    }

    fn new_generation(&self, inner: &mut Inner, now: Instant) {
        inner.generation += 1;
        inner.counts = Counts::default();
        inner.expiry = match inner.state {
            CircuitState::Closed if self.settings.interval.is_zero() => None,
            CircuitState::Closed => Some(now + self.settings.interval),
            CircuitState::Open => Some(now + self.settings.open_timeout),
            CircuitState::HalfOpen => None,
        };
    }

    /// Log and broadcast transitions recorded under the lock. Sending never waits.
    fn publish_pending(&self) {
        let pending = std::mem::take(&mut self.inner.lock().pending);
        for (from, to) in pending {
            match to {
                CircuitState::Open => error!(
                    target: "breaker",
                    name = %self.name,
                    %from,
                    "circuit breaker opened, shedding load"
                ),
                CircuitState::HalfOpen => warn!(
                    target: "breaker",
                    name = %self.name,
                    "circuit breaker half-open, admitting probes"
                ),
                CircuitState::Closed => info!(
                    target: "breaker",
                    name = %self.name,
                    %from,
                    "circuit breaker closed, traffic restored"
                ),
            }
            let _ = self.transitions.send(StateTransition {
                name: self.name.clone(),
                from,
                to,
            });
        }
    }
}

/// Settles a call whose future is dropped before it completes, otherwise a
/// cancelled half-open call would hold its slot forever.
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    finished: bool,
}

impl CallGuard<'_> {
    fn finish(&mut self, success: bool) {
        self.finished = true;
        self.breaker.after_call(self.generation, success);
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.breaker.abandon_call(self.generation);
        }
    }
}

/// One breaker per endpoint group, created on first use.
#[derive(Debug)]
pub struct BreakerRegistry {
    settings: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    transitions: broadcast::Sender<StateTransition>,
}

impl BreakerRegistry {
    /// Group used for every request when per-route breakers are off.
    pub const GLOBAL: &'static str = "http";

    pub fn new(settings: BreakerConfig) -> Self {
        Self {
            settings,
            breakers: DashMap::new(),
            transitions: broadcast::channel(256).0,
        }
    }

    /// Breaker for a route template, or the global one when `per_route` is off.
    pub fn for_route(&self, route: &str) -> Arc<CircuitBreaker> {
        if self.settings.per_route {
            self.get(route)
        } else {
            self.get(Self::GLOBAL)
        }
    }

    pub fn get(&self, group: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(group) {
            return Arc::clone(existing.value());
        }
        self.breakers
            .entry(group.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::with_transitions(
                    group,
                    self.settings.clone(),
                    self.transitions.clone(),
                ))
            })
            .value()
            .clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions.subscribe()
    }

    pub fn states(&self) -> Vec<(String, CircuitState)> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|e| e.value().clone()).collect();
        breakers
            .into_iter()
            .map(|b| (b.name().to_string(), b.state()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn settings() -> BreakerConfig {
        BreakerConfig {
            per_route: true,
            min_requests: 5,
            failure_ratio: 0.6,
            interval: Duration::from_secs(60),
            open_timeout: Duration::from_secs(30),
            max_probes: 1,
        }
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        cb.execute(|| async { Err::<(), _>("boom") }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        cb.execute(|| async { Ok::<(), &'static str>(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_trips_after_min_requests_and_ratio() {
        let cb = CircuitBreaker::new("api", settings());
        for _ in 0..4 {
            assert!(matches!(fail(&cb).await, Err(BreakerError::Inner("boom"))));
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        assert!(matches!(fail(&cb).await, Err(BreakerError::Inner(_))));
        assert_eq!(cb.state(), CircuitState::Open);

        let invoked = AtomicUsize::new(0);
        let result = cb
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<(), &'static str>(())
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Open(ref name)) if name == "api"));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stays_closed_below_ratio() {
        let cb = CircuitBreaker::new("api", settings());
        // 2 failures out of 5 is 40%.
        for _ in 0..3 {
            succeed(&cb).await.unwrap();
        }
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.counts().requests, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_rollover_clears_counts() {
        let cb = CircuitBreaker::new("api", settings());
        for _ in 0..4 {
            let _ = fail(&cb).await;
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.counts().total_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_probe_then_closes() {
        let cb = Arc::new(CircuitBreaker::new("api", settings()));
        for _ in 0..5 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let probe = {
            let cb = cb.clone();
            tokio::spawn(async move {
                cb.execute(|| async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, &'static str>("probe")
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        let invoked = AtomicUsize::new(0);
        let second = cb
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &'static str>("second")
            })
            .await;
        assert!(matches!(second, Err(BreakerError::TooManyProbes(_))));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        assert_eq!(probe.await.unwrap().unwrap(), "probe");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.counts(), Counts::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens_and_restarts_cooldown() {
        let cb = CircuitBreaker::new("api", settings());
        for _ in 0..5 {
            let _ = fail(&cb).await;
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(matches!(fail(&cb).await, Err(BreakerError::Inner(_))));
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(matches!(succeed(&cb).await, Err(BreakerError::Open(_))));

        tokio::time::advance(Duration::from_secs(1)).await;
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_classifier_counts_ok_values_as_failures() {
        let cb = CircuitBreaker::new("api", settings());
        for _ in 0..5 {
            let status = cb
                .execute_classified(
                    || async { Ok::<u16, std::convert::Infallible>(503) },
                    |r| matches!(r, Ok(code) if *code >= 500),
                )
                .await;
            assert!(matches!(status, Ok(503)));
        }
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_probe_releases_slot() {
        let cb = Arc::new(CircuitBreaker::new("api", settings()));
        for _ in 0..5 {
            let _ = fail(&cb).await;
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        let probe = {
            let cb = cb.clone();
            tokio::spawn(async move {
                cb.execute(|| async {
                    tokio::time::sleep(Duration::from_secs(3_600)).await;
                    Ok::<(), &'static str>(())
                })
                .await
            })
        };
        tokio::task::yield_now().await;
        probe.abort();
        let _ = probe.await;

        // The abandoned probe counts as a failure: open again, not stuck half-open.
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_calls_do_not_trip_closed_breaker() {
        let cb = Arc::new(CircuitBreaker::new("api", settings()));
        for _ in 0..10 {
            let call = {
                let cb = cb.clone();
                tokio::spawn(async move {
                    cb.execute(|| async {
                        tokio::time::sleep(Duration::from_secs(3_600)).await;
                        Ok::<(), &'static str>(())
                    })
                    .await
                })
            };
            tokio::task::yield_now().await;
            call.abort();
            let _ = call.await;
        }

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.counts(), Counts::default());

        // Real failures still trip it.
        for _ in 0..5 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transitions_are_broadcast() {
        let cb = CircuitBreaker::new("api", settings());
        let mut rx = cb.subscribe();
        for _ in 0..5 {
            let _ = fail(&cb).await;
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        succeed(&cb).await.unwrap();

        let seen: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|t| (t.from, t.to))
            .collect();
        assert_eq!(
            seen,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_isolates_routes() {
        let registry = BreakerRegistry::new(settings());
        let users = registry.for_route("/api/v1/users");
        for _ in 0..5 {
            let _ = fail(&users).await;
        }
        assert_eq!(users.state(), CircuitState::Open);

        let menus = registry.for_route("/api/v1/menus");
        assert_eq!(menus.state(), CircuitState::Closed);
        assert!(Arc::ptr_eq(&users, &registry.for_route("/api/v1/users")));
        assert_eq!(registry.states().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_global_mode_shares_one_breaker() {
        let registry = BreakerRegistry::new(BreakerConfig {
            per_route: false,
            ..settings()
        });
        let a = registry.for_route("/a");
        let b = registry.for_route("/b");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name(), BreakerRegistry::GLOBAL);
    }
}
