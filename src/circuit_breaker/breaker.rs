//! Keyed circuit breaker.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;

use crate::circuit_breaker::error::CircuitOpenError;
use crate::circuit_breaker::state::{CircuitRecord, CircuitState, CircuitStats, Outcome, Ticket};
use crate::clock::{Clock, Timestamp};
use crate::config::CircuitBreakerConfig;
use crate::error::GuardError;
use crate::observability::Observer;
use crate::store::{KeyedState, StateStore};

/// Point-in-time view of one circuit.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub policy: String,
    pub key: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub window_successes: u32,
    pub window_failures: u32,
    pub last_transition: Option<Timestamp>,
    pub next_probe_time: Option<Timestamp>,
    pub stats: CircuitStats,
}

impl CircuitSnapshot {
    fn from_record(
        config: &CircuitBreakerConfig,
        key: &str,
        record: &CircuitRecord,
        now: Timestamp,
    ) -> Self {
        let (window_successes, window_failures) = record.window_counts(config, now);
        Self {
            policy: config.name.clone(),
            key: key.to_string(),
            state: record.state(),
            failure_count: record.failure_count(),
            success_count: record.success_count(),
            window_successes,
            window_failures,
            last_transition: record.last_transition(),
            next_probe_time: record.next_probe_time(),
            stats: record.stats().clone(),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    config: CircuitBreakerConfig,
    states: KeyedState<CircuitRecord>,
    clock: Arc<dyn Clock>,
    observer: Observer,
}

/// Per-key circuit breaker.
///
/// Cheap to clone; clones share state. Circuits for distinct keys are fully
/// independent.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    inner: Arc<BreakerInner>,
}

impl CircuitBreaker {
    /// In-process breaker without metrics.
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_parts(config, clock, Observer::default(), None)
    }

    pub(crate) fn with_parts(
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        observer: Observer,
        store: Option<Arc<dyn StateStore>>,
    ) -> Self {
        let namespace = crate::store::namespace("circuit", &config.name, &config);
        let states = match store {
            Some(store) => {
                // Keep shared records well past any window or recovery period.
                let ttl = config.evaluation_window().max(config.recovery_timeout()) * 10;
                KeyedState::shared(namespace, clock.clone(), store, ttl)
            }
            None => KeyedState::local(namespace, clock.clone()),
        };
        Self {
            inner: Arc::new(BreakerInner {
                config,
                states,
                clock,
                observer,
            }),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.inner.config
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Ask to make one call for `key`.
    ///
    /// Open circuits fail fast until `next_probe_time`; the first admission
    /// after it moves the circuit to HalfOpen and becomes a trial call.
    pub async fn acquire(&self, key: &str) -> Result<CallPermit, CircuitOpenError> {
        let inner = &self.inner;
        let now = inner.clock.now();
        let admission = match inner
            .states
            .update(key, |record| record.admit(&inner.config, now))
            .await
        {
            Ok(admission) => admission,
            Err(e) => {
                inner.observer.store_error("circuit_breaker", key, &e);
                return Ok(self.permit(key, Ticket::DETACHED));
            }
        };

        if let Some(transition) = &admission.transition {
            inner
                .observer
                .circuit_transition(self.name(), key, transition);
        }

        match admission.result {
            Ok(ticket) => Ok(self.permit(key, ticket)),
            Err(rejection) => {
                let error = rejection.into_error(key);
                inner.observer.circuit_rejected(self.name(), &error);
                Err(error)
            }
        }
    }

    /// Run `operation` for `key` behind the breaker.
    ///
    /// Successful results count as [`Outcome::Success`]; errors are classified
    /// by `classify`. The operation's error is returned unchanged as
    /// [`GuardError::Operation`].
    pub async fn execute<T, E, F, Fut, C>(
        &self,
        key: &str,
        operation: F,
        classify: C,
    ) -> Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> Outcome,
    {
        let permit = self.acquire(key).await?;
        match operation().await {
            Ok(value) => {
                permit.record(Outcome::Success).await;
                Ok(value)
            }
            Err(error) => {
                permit.record(classify(&error)).await;
                Err(GuardError::Operation(error))
            }
        }
    }

    /// Whether a call for `key` would be rejected right now. Admits nothing.
    pub async fn check(&self, key: &str) -> Result<(), CircuitOpenError> {
        let inner = &self.inner;
        let now = inner.clock.now();
        let rejection = match inner
            .states
            .read(key, |record| record.peek(&inner.config, now))
            .await
        {
            Ok(found) => found.flatten(),
            Err(e) => {
                inner.observer.store_error("circuit_breaker", key, &e);
                None
            }
        };
        match rejection {
            Some(rejection) => Err(rejection.into_error(key)),
            None => Ok(()),
        }
    }

    /// Current state for `key`; `Closed` for keys never seen.
    pub async fn state(&self, key: &str) -> CircuitState {
        self.snapshot(key)
            .await
            .map(|s| s.state)
            .unwrap_or_default()
    }

    pub async fn snapshot(&self, key: &str) -> Option<CircuitSnapshot> {
        let inner = &self.inner;
        let now = inner.clock.now();
        match inner
            .states
            .read(key, |record| {
                CircuitSnapshot::from_record(&inner.config, key, record, now)
            })
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                inner.observer.store_error("circuit_breaker", key, &e);
                None
            }
        }
    }

    /// Snapshots of every circuit held in this process.
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let inner = &self.inner;
        let now = inner.clock.now();
        let mut snapshots = Vec::new();
        inner.states.for_each_local(|key, record| {
            snapshots.push(CircuitSnapshot::from_record(&inner.config, key, record, now));
        });
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    /// Force the circuit for `key` back to Closed and clear its statistics.
    pub async fn reset(&self, key: &str) {
        let inner = &self.inner;
        let now = inner.clock.now();
        match inner
            .states
            .update(key, |record| record.reset(&inner.config, now))
            .await
        {
            Ok(Some(transition)) => {
                inner
                    .observer
                    .circuit_transition(self.name(), key, &transition)
            }
            Ok(None) => {}
            Err(e) => inner.observer.store_error("circuit_breaker", key, &e),
        }
        tracing::info!(policy = self.name(), key = %key, "Circuit reset");
    }

    /// Drop Closed circuits with no outcomes in the evaluation window.
    pub fn evict_idle(&self) -> usize {
        let config = &self.inner.config;
        self.inner
            .states
            .evict_idle(config.evaluation_window(), |record, now| {
                record.is_idle(config, now)
            })
    }

    pub fn tracked_keys(&self) -> usize {
        self.inner.states.len()
    }

    async fn record(&self, key: &str, ticket: Ticket, outcome: Outcome) {
        let inner = &self.inner;
        let now = inner.clock.now();
        match inner
            .states
            .update(key, |record| record.record(&inner.config, now, ticket, outcome))
            .await
        {
            Ok(Some(transition)) => {
                inner
                    .observer
                    .circuit_transition(self.name(), key, &transition)
            }
            Ok(None) => {}
            Err(e) => inner.observer.store_error("circuit_breaker", key, &e),
        }
    }

    fn release(&self, key: &str, ticket: Ticket) {
        let released = self
            .inner
            .states
            .update_local(key, |record| record.release(ticket));
        if released.is_some() {
            return;
        }
        // Shared state needs an async round trip.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let breaker = self.clone();
            let key = key.to_string();
            handle.spawn(async move {
                if let Err(e) = breaker
                    .inner
                    .states
                    .update(&key, |record| record.release(ticket))
                    .await
                {
                    breaker
                        .inner
                        .observer
                        .store_error("circuit_breaker", &key, &e);
                }
            });
        }
    }

    fn permit(&self, key: &str, ticket: Ticket) -> CallPermit {
        CallPermit {
            breaker: self.clone(),
            key: key.to_string(),
            ticket,
            recorded: false,
        }
    }
}

/// Admission to make one call through a [`CircuitBreaker`].
///
/// Report the outcome with [`CallPermit::record`]. A permit dropped without
/// an outcome (e.g. because the call was cancelled) gives its half-open
/// trial slot back so the circuit cannot wedge in HalfOpen.
#[derive(Debug)]
#[must_use = "record the call outcome or drop the permit to abandon it"]
pub struct CallPermit {
    breaker: CircuitBreaker,
    key: String,
    ticket: Ticket,
    recorded: bool,
}

impl CallPermit {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether this call is a half-open trial.
    pub fn is_trial(&self) -> bool {
        self.ticket.trial
    }

    pub async fn record(mut self, outcome: Outcome) {
        self.recorded = true;
        self.breaker.record(&self.key, self.ticket, outcome).await;
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.recorded && self.ticket.trial {
            self.breaker.release(&self.key, self.ticket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitOpenReason;
    use crate::clock::ManualClock;
    use crate::observability::observer::testing::RecordingSink;
    use crate::observability::{metrics, EventBus, GuardEvent};
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn breaker(clock: Arc<ManualClock>) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig {
                name: "db".into(),
                failure_threshold: 5,
                recovery_timeout_ms: 30_000,
                success_threshold: 1,
                half_open_max_calls: 1,
                ..Default::default()
            },
            clock,
        )
    }

    async fn failing(breaker: &CircuitBreaker, key: &str) -> GuardError<&'static str> {
        breaker
            .execute(key, || async { Err::<(), _>("boom") }, |_| Outcome::RetryableFailure)
            .await
            .unwrap_err()
    }

    #[tokio::test]
    async fn test_open_circuit_never_invokes_operation() {
        let clock = Arc::new(ManualClock::new());
        let breaker = breaker(clock.clone());
        for _ in 0..5 {
            assert!(matches!(failing(&breaker, "orders").await, GuardError::Operation("boom")));
        }
        assert_eq!(breaker.state("orders").await, CircuitState::Open);

        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = breaker
            .execute(
                "orders",
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, &str>(())
                },
                |_| Outcome::RetryableFailure,
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        match result {
            Err(GuardError::CircuitOpen(open)) => {
                assert_eq!(open.key, "orders");
                assert_eq!(open.reason, CircuitOpenReason::Open);
                assert_eq!(open.retry_after(clock.now()), Duration::from_secs(30));
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let clock = Arc::new(ManualClock::new());
        let breaker = breaker(clock);
        for _ in 0..5 {
            failing(&breaker, "orders").await;
        }
        assert!(breaker.check("orders").await.is_err());
        assert!(breaker.check("users").await.is_ok());
        let ok = breaker
            .execute("users", || async { Ok::<_, &str>(7) }, |_| Outcome::FatalFailure)
            .await;
        assert_eq!(ok.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_probe_after_recovery_closes_circuit() {
        let clock = Arc::new(ManualClock::new());
        let breaker = breaker(clock.clone());
        for _ in 0..5 {
            failing(&breaker, "orders").await;
        }
        clock.advance(Duration::from_millis(29_999));
        assert!(breaker.acquire("orders").await.is_err());
        clock.advance(Duration::from_millis(1));

        let permit = breaker.acquire("orders").await.unwrap();
        assert!(permit.is_trial());
        permit.record(Outcome::Success).await;

        let snapshot = breaker.snapshot("orders").await.unwrap();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(snapshot.stats.total_rejections, 1);
    }

    #[tokio::test]
    async fn test_dropped_trial_permit_frees_slot() {
        let clock = Arc::new(ManualClock::new());
        let breaker = breaker(clock.clone());
        for _ in 0..5 {
            failing(&breaker, "orders").await;
        }
        clock.advance(Duration::from_secs(30));
        let permit = breaker.acquire("orders").await.unwrap();
        let saturated = breaker.acquire("orders").await.unwrap_err();
        assert_eq!(saturated.reason, CircuitOpenReason::HalfOpenSaturated);
        drop(permit);
        assert!(breaker.acquire("orders").await.is_ok());
    }

    #[tokio::test]
    async fn test_transitions_publish_events_and_metrics() {
        let clock = Arc::new(ManualClock::new());
        let sink = Arc::new(RecordingSink::default());
        let bus = EventBus::new(16);
        let mut events = bus.subscribe();
        let breaker = CircuitBreaker::with_parts(
            CircuitBreakerConfig {
                name: "db".into(),
                failure_threshold: 2,
                ..Default::default()
            },
            clock,
            Observer::new(sink.clone(), bus),
            None,
        );
        failing(&breaker, "orders").await;
        failing(&breaker, "orders").await;
        let _ = breaker.acquire("orders").await;

        match events.recv().await.unwrap() {
            GuardEvent::CircuitTransition { key, from, to, .. } => {
                assert_eq!(key, "orders");
                assert_eq!(from, CircuitState::Closed);
                assert_eq!(to, CircuitState::Open);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(sink.count(metrics::CIRCUIT_TRANSITIONS), 1);
        assert_eq!(sink.count(metrics::CIRCUIT_REJECTIONS), 1);
    }

    #[tokio::test]
    async fn test_reset_closes_open_circuit() {
        let clock = Arc::new(ManualClock::new());
        let breaker = breaker(clock);
        for _ in 0..5 {
            failing(&breaker, "orders").await;
        }
        breaker.reset("orders").await;
        assert_eq!(breaker.state("orders").await, CircuitState::Closed);
        assert!(breaker.check("orders").await.is_ok());
    }

    #[tokio::test]
    async fn test_shared_store_state_is_visible_across_breakers() {
        let clock = Arc::new(ManualClock::new());
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new(clock.clone()));
        let config = CircuitBreakerConfig {
            name: "db".into(),
            failure_threshold: 2,
            ..Default::default()
        };
        let a = CircuitBreaker::with_parts(config.clone(), clock.clone(), Observer::default(), Some(store.clone()));
        let b = CircuitBreaker::with_parts(config, clock, Observer::default(), Some(store));

        failing(&a, "orders").await;
        failing(&b, "orders").await;
        assert_eq!(a.state("orders").await, CircuitState::Open);
        assert!(b.check("orders").await.is_err());
    }

    #[tokio::test]
    async fn test_store_outage_fails_open() {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let breaker = CircuitBreaker::with_parts(
            CircuitBreakerConfig::default(),
            clock,
            Observer::default(),
            Some(store.clone() as Arc<dyn StateStore>),
        );
        store.set_available(false);
        let result = breaker
            .execute("orders", || async { Ok::<_, &str>(1) }, |_| Outcome::FatalFailure)
            .await;
        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_idle_closed_circuits_are_evicted() {
        let clock = Arc::new(ManualClock::new());
        let breaker = breaker(clock.clone());
        breaker
            .execute("orders", || async { Ok::<_, &str>(()) }, |_| Outcome::FatalFailure)
            .await
            .unwrap();
        for _ in 0..5 {
            failing(&breaker, "users").await;
        }
        clock.advance(Duration::from_secs(120));
        assert_eq!(breaker.evict_idle(), 1);
        assert_eq!(breaker.tracked_keys(), 1);
        assert_eq!(breaker.state("users").await, CircuitState::Open);
    }
}
