//! Explicit registry of named guards.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::circuit_breaker::CircuitBreaker;
use crate::clock::Clock;
use crate::config::{CircuitBreakerConfig, RateLimiterConfig};
use crate::error::GuardError;
use crate::guard::call::GuardedCallBuilder;
use crate::observability::events::DEFAULT_EVENT_CAPACITY;
use crate::observability::{EventBus, FacadeSink, GuardEvent, MetricsSink, Observer};
use crate::rate_limit::SlidingWindowRateLimiter;
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::store::StateStore;

#[derive(Debug)]
struct RegistryInner {
    clock: Arc<dyn Clock>,
    observer: Observer,
    store: Option<Arc<dyn StateStore>>,
    limiters: DashMap<String, Vec<SlidingWindowRateLimiter>>,
    breakers: DashMap<String, Vec<CircuitBreaker>>,
}

/// Owns every limiter and breaker, keyed by policy name and config.
///
/// Built once at startup and injected where needed (axum state, `Arc`).
/// Clones share the same guards. Call sites passing equal configs share
/// state; a differently configured guard under the same name is kept apart.
#[derive(Debug, Clone)]
pub struct GuardRegistry {
    inner: Arc<RegistryInner>,
}

impl GuardRegistry {
    /// Registry with the default metrics sink and in-process state.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::builder(clock).build()
    }

    pub fn builder(clock: Arc<dyn Clock>) -> GuardRegistryBuilder {
        GuardRegistryBuilder {
            clock,
            sink: Arc::new(FacadeSink),
            store: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn observer(&self) -> &Observer {
        &self.inner.observer
    }

    /// Receive circuit transitions, rate-limit rejections and retry exhaustion.
    pub fn subscribe(&self) -> broadcast::Receiver<GuardEvent> {
        self.inner.observer.events().subscribe()
    }

    /// Limiter for `config`, created on first use.
    ///
    /// Lookups with an equal config return the same limiter. A config that
    /// differs from the ones already registered under its name gets its own.
    pub fn rate_limiter(&self, config: &RateLimiterConfig) -> SlidingWindowRateLimiter {
        let inner = &self.inner;
        let mut variants = inner.limiters.entry(config.name.clone()).or_default();
        if let Some(limiter) = variants.iter().find(|l| l.config() == config) {
            return limiter.clone();
        }
        if !variants.is_empty() {
            tracing::debug!(policy = %config.name, variants = variants.len() + 1, "Registering another rate limiter config under this name");
        }
        let limiter = SlidingWindowRateLimiter::with_parts(
            config.clone(),
            inner.clock.clone(),
            inner.observer.clone(),
            inner.store.clone(),
        );
        variants.push(limiter.clone());
        limiter
    }

    /// Breaker for `config`, created on first use. Same sharing rules as
    /// [`rate_limiter`](Self::rate_limiter).
    pub fn circuit_breaker(&self, config: &CircuitBreakerConfig) -> CircuitBreaker {
        let inner = &self.inner;
        let mut variants = inner.breakers.entry(config.name.clone()).or_default();
        if let Some(breaker) = variants.iter().find(|b| b.config() == config) {
            return breaker.clone();
        }
        if !variants.is_empty() {
            tracing::debug!(policy = %config.name, variants = variants.len() + 1, "Registering another circuit breaker config under this name");
        }
        let breaker = CircuitBreaker::with_parts(
            config.clone(),
            inner.clock.clone(),
            inner.observer.clone(),
            inner.store.clone(),
        );
        variants.push(breaker.clone());
        breaker
    }

    /// Every breaker registered under `name`, oldest first.
    pub fn find_breakers(&self, name: &str) -> Vec<CircuitBreaker> {
        self.inner
            .breakers
            .get(name)
            .map(|variants| variants.clone())
            .unwrap_or_default()
    }

    /// All registered breakers, ordered by name.
    pub fn breakers(&self) -> Vec<CircuitBreaker> {
        let mut breakers: Vec<_> = self
            .inner
            .breakers
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect();
        breakers.sort_by(|a, b| a.name().cmp(b.name()));
        breakers
    }

    pub fn retry_executor(&self) -> RetryExecutor {
        RetryExecutor::with_observer(self.inner.clock.clone(), self.inner.observer.clone())
    }

    /// Start composing a [`GuardedCall`](crate::guard::GuardedCall).
    pub fn call<E>(&self) -> GuardedCallBuilder<E> {
        GuardedCallBuilder::new(self.clone())
    }

    /// Run `operation` for `key` through the limiter, breaker and retry
    /// policy, in that order.
    pub async fn guarded_call<T, E, F, Fut>(
        &self,
        key: &str,
        operation: F,
        limiter_config: &RateLimiterConfig,
        circuit_config: &CircuitBreakerConfig,
        retry_policy: &RetryPolicy<E>,
    ) -> Result<T, GuardError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display + 'static,
    {
        self.call()
            .rate_limit(limiter_config)
            .circuit_breaker(circuit_config)
            .retry(retry_policy.clone())
            .build()
            .call(key, operation)
            .await
    }

    /// Drop idle per-key state from every guard. Returns how many keys went.
    pub fn evict_idle(&self) -> usize {
        let limiters: usize = self
            .inner
            .limiters
            .iter()
            .map(|entry| entry.value().iter().map(|l| l.evict_idle()).sum::<usize>())
            .sum();
        let breakers: usize = self
            .inner
            .breakers
            .iter()
            .map(|entry| entry.value().iter().map(|b| b.evict_idle()).sum::<usize>())
            .sum();
        limiters + breakers
    }

    /// Sweep idle keys every `interval` until shutdown is signalled.
    pub fn spawn_maintenance(
        &self,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = registry.evict_idle();
                        if evicted > 0 {
                            tracing::debug!(evicted, "Evicted idle guard state");
                        }
                    }
                    _ = shutdown.recv() => {
                        tracing::debug!("Guard maintenance stopped");
                        break;
                    }
                }
            }
        })
    }
}

/// Builder for [`GuardRegistry`].
pub struct GuardRegistryBuilder {
    clock: Arc<dyn Clock>,
    sink: Arc<dyn MetricsSink>,
    store: Option<Arc<dyn StateStore>>,
    event_capacity: usize,
}

impl GuardRegistryBuilder {
    pub fn metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Share limiter and breaker state through `store`.
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn build(self) -> GuardRegistry {
        GuardRegistry {
            inner: Arc::new(RegistryInner {
                clock: self.clock,
                observer: Observer::new(self.sink, EventBus::new(self.event_capacity)),
                store: self.store,
                limiters: DashMap::new(),
                breakers: DashMap::new(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitState, Outcome};
    use crate::clock::ManualClock;
    use crate::config::RetryConfig;
    use crate::retry::Jitter;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq, thiserror::Error)]
    #[error("upstream unavailable")]
    struct Unavailable;

    fn quick_retry(max_attempts: u32) -> RetryPolicy<Unavailable> {
        RetryPolicy::always(RetryConfig {
            max_attempts,
            base_delay_ms: 10,
            jitter: Jitter::None,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_guards_are_shared_by_name() {
        let registry = GuardRegistry::new(Arc::new(ManualClock::new()));
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        };
        let a = registry.circuit_breaker(&config.clone().named("payments"));
        let b = registry.circuit_breaker(&config.clone().named("payments"));
        let c = registry.circuit_breaker(&config.named("search"));

        let _ = a
            .execute("key", || async { Err::<(), _>(Unavailable) }, |_| Outcome::RetryableFailure)
            .await;
        assert_eq!(b.state("key").await, CircuitState::Open);
        assert_eq!(c.state("key").await, CircuitState::Closed);

        let names: Vec<_> = registry.breakers().iter().map(|b| b.name().to_string()).collect();
        assert_eq!(names, vec!["payments", "search"]);
        assert_eq!(registry.find_breakers("payments").len(), 1);
        assert!(registry.find_breakers("missing").is_empty());
    }

    #[test]
    fn test_different_configs_under_one_name_are_kept_apart() {
        let registry = GuardRegistry::new(Arc::new(ManualClock::new()));
        let strict = registry.rate_limiter(&RateLimiterConfig::per_minute(10).named("api"));
        let loose = registry.rate_limiter(&RateLimiterConfig::per_minute(99).named("api"));
        let again = registry.rate_limiter(&RateLimiterConfig::per_minute(10).named("api"));

        assert_eq!(strict.config().windows[0].limit, 10);
        assert_eq!(loose.config().windows[0].limit, 99);
        assert_eq!(again.config().windows[0].limit, 10);

        registry.circuit_breaker(&CircuitBreakerConfig::default());
        registry.circuit_breaker(&CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        });
        assert_eq!(registry.find_breakers("default").len(), 2);
        assert_eq!(registry.breakers().len(), 2);
    }

    #[tokio::test]
    async fn test_guarded_call_honors_each_callers_config() {
        let registry = GuardRegistry::new(Arc::new(ManualClock::new()));
        let circuit_config = CircuitBreakerConfig::default();
        let tight = RateLimiterConfig::per_minute(1);
        let roomy = RateLimiterConfig::per_minute(100);

        let first = registry
            .guarded_call("client", || async { Ok::<_, Unavailable>(()) }, &tight, &circuit_config, &RetryPolicy::none())
            .await;
        assert!(first.is_ok());
        let second = registry
            .guarded_call("client", || async { Ok::<_, Unavailable>(()) }, &roomy, &circuit_config, &RetryPolicy::none())
            .await;
        assert!(second.is_ok());
        let third = registry
            .guarded_call("client", || async { Ok::<_, Unavailable>(()) }, &tight, &circuit_config, &RetryPolicy::none())
            .await;
        assert!(matches!(third, Err(GuardError::RateLimitExceeded { .. })));
    }

    #[tokio::test]
    async fn test_circuit_configs_do_not_share_state() {
        let registry = GuardRegistry::new(Arc::new(ManualClock::new()));
        let sensitive = CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        };
        let tolerant = CircuitBreakerConfig::default();
        let limits = RateLimiterConfig::per_minute(100);

        let _ = registry
            .guarded_call("db", || async { Err::<(), _>(Unavailable) }, &limits, &sensitive, &RetryPolicy::none())
            .await;
        assert_eq!(registry.circuit_breaker(&sensitive).state("db").await, CircuitState::Open);
        assert_eq!(registry.circuit_breaker(&tolerant).state("db").await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_rate_limited_call_never_invokes_operation() {
        let registry = GuardRegistry::new(Arc::new(ManualClock::new()));
        let limiter_config = RateLimiterConfig::per_minute(1);
        let circuit_config = CircuitBreakerConfig::default();
        let calls = AtomicU32::new(0);
        let calls = &calls;

        for _ in 0..2 {
            let _ = registry
                .guarded_call(
                    "client-1",
                    move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, Unavailable>(())
                    },
                    &limiter_config,
                    &circuit_config,
                    &quick_retry(3),
                )
                .await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_guarded_call_opens_circuit_and_reports_events() {
        let registry = GuardRegistry::new(Arc::new(ManualClock::new()));
        let mut events = registry.subscribe();
        let limiter_config = RateLimiterConfig::per_minute(100);
        let circuit_config = CircuitBreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        };

        let result: Result<(), _> = registry
            .guarded_call(
                "inventory",
                || async { Err(Unavailable) },
                &limiter_config,
                &circuit_config,
                &quick_retry(5),
            )
            .await;
        assert!(matches!(result, Err(GuardError::CircuitOpen(_))));

        let breaker = registry.circuit_breaker(&circuit_config);
        assert_eq!(breaker.state("inventory").await, CircuitState::Open);
        assert!(matches!(
            events.try_recv(),
            Ok(GuardEvent::CircuitTransition { to: CircuitState::Open, .. })
        ));
    }

    #[tokio::test]
    async fn test_shared_store_spans_registries() {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let first = GuardRegistry::builder(clock.clone()).store(store.clone()).build();
        let second = GuardRegistry::builder(clock).store(store).build();
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        };

        let _ = first
            .circuit_breaker(&config)
            .execute("db", || async { Err::<(), _>(Unavailable) }, |_| Outcome::RetryableFailure)
            .await;
        assert_eq!(second.circuit_breaker(&config).state("db").await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_evict_idle_sweeps_all_guards() {
        let clock = Arc::new(ManualClock::new());
        let registry = GuardRegistry::new(clock.clone());
        let limiter = registry.rate_limiter(&RateLimiterConfig::per_minute(5).with_window(100, Duration::from_secs(120)));
        let breaker = registry.circuit_breaker(&CircuitBreakerConfig::default());
        limiter.try_acquire("a", 1).await;
        let _ = breaker
            .execute("b", || async { Ok::<_, Unavailable>(()) }, |_| Outcome::RetryableFailure)
            .await;

        clock.advance(Duration::from_secs(3 * 60 * 60));
        assert_eq!(registry.evict_idle(), 2);
        assert_eq!(limiter.tracked_keys(), 0);
        assert_eq!(breaker.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn test_maintenance_stops_on_shutdown() {
        let registry = GuardRegistry::new(Arc::new(ManualClock::new()));
        let (tx, rx) = broadcast::channel(1);
        let handle = registry.spawn_maintenance(Duration::from_millis(10), rx);
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
