//! Keyed sliding-window rate limiter.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, Timestamp};
use crate::config::RateLimiterConfig;
use crate::observability::Observer;
use crate::rate_limit::burst::TokenBucket;
use crate::rate_limit::window::WindowCounter;
use crate::store::{KeyedState, StateStore, StoreError};

/// Wait suggested to callers rejected because a shared key stayed contended.
const CONTENTION_RETRY_AFTER: Duration = Duration::from_millis(100);

/// Outcome of [`SlidingWindowRateLimiter::try_acquire`].
///
/// A cost above [`RateLimiterConfig::max_cost`] is always rejected; its
/// `retry_after` is the shortest window, but waiting never helps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    /// Zero when allowed; otherwise the longest wait across rejecting windows.
    pub retry_after: Duration,
    /// Units still available in the tightest window after this decision.
    pub remaining: u32,
}

impl Decision {
    fn reject_contended() -> Self {
        Self {
            allowed: false,
            retry_after: CONTENTION_RETRY_AFTER,
            remaining: 0,
        }
    }

    fn admit_unchecked(config: &RateLimiterConfig) -> Self {
        Self {
            allowed: true,
            retry_after: Duration::ZERO,
            remaining: config.windows.iter().map(|w| w.limit).min().unwrap_or(0),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Evaluation {
    pub decision: Decision,
    /// Largest window count seen before this request.
    pub current_count: u32,
}

/// Per-key limiter state: one counter per configured window plus the
/// optional burst bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitState {
    windows: Vec<WindowCounter>,
    burst: Option<TokenBucket>,
}

/// (capacity, tokens per second, shortest window) for the burst bucket.
///
/// The refill rate is high enough that the bucket is full again after the
/// shortest window, so an idle key always behaves like a fresh one.
fn burst_params(config: &RateLimiterConfig, allowance: u32) -> (f64, f64, Duration) {
    let shortest = config
        .windows
        .iter()
        .min_by_key(|w| w.window())
        .map(|w| (w.limit, w.window()))
        .unwrap_or((allowance, Duration::from_secs(1)));
    let capacity = f64::from(allowance);
    let rate = f64::from(shortest.0.max(allowance)) / shortest.1.as_secs_f64().max(0.001);
    (capacity, rate, shortest.1)
}

impl RateLimitState {
    /// Check every window (and the burst bucket); commit only if all admit.
    pub(crate) fn evaluate(
        &mut self,
        config: &RateLimiterConfig,
        now: Timestamp,
        cost: u32,
    ) -> Evaluation {
        self.windows
            .resize_with(config.windows.len(), WindowCounter::default);

        let mut allowed = true;
        let mut retry_after = Duration::ZERO;
        let mut remaining = u32::MAX;
        let mut current_count = 0;

        for (counter, window) in self.windows.iter_mut().zip(&config.windows) {
            counter.purge(now, window.window());
            current_count = current_count.max(counter.count());
            match counter.check(now, cost, window) {
                Ok(left) => remaining = remaining.min(left),
                Err(wait) => {
                    allowed = false;
                    retry_after = retry_after.max(wait);
                    remaining = remaining.min(window.limit.saturating_sub(counter.count()));
                }
            }
        }

        match config.burst_allowance {
            Some(allowance) => {
                let (capacity, rate, shortest) = burst_params(config, allowance);
                let bucket = self
                    .burst
                    .get_or_insert_with(|| TokenBucket::full(capacity, now));
                match bucket.check(now, cost, capacity, rate) {
                    Ok(left) => remaining = remaining.min(left),
                    Err(wait) => {
                        allowed = false;
                        retry_after = retry_after.max(wait.min(shortest));
                        remaining = remaining.min(bucket.tokens().floor() as u32);
                    }
                }
            }
            None => self.burst = None,
        }

        if allowed {
            for (counter, window) in self.windows.iter_mut().zip(&config.windows) {
                counter.add(now, cost, window.granularity());
            }
            if let Some(bucket) = &mut self.burst {
                bucket.consume(cost);
            }
            retry_after = Duration::ZERO;
        }

        Evaluation {
            decision: Decision {
                allowed,
                retry_after,
                remaining: if remaining == u32::MAX { 0 } else { remaining },
            },
            current_count,
        }
    }

    /// No counted events and a full burst bucket: same as a fresh key.
    pub(crate) fn is_idle(&mut self, config: &RateLimiterConfig, now: Timestamp) -> bool {
        for (counter, window) in self.windows.iter_mut().zip(&config.windows) {
            counter.purge(now, window.window());
        }
        let windows_empty = self.windows.iter().all(WindowCounter::is_empty);
        let burst_full = match (&mut self.burst, config.burst_allowance) {
            (Some(bucket), Some(allowance)) => {
                let (capacity, rate, _) = burst_params(config, allowance);
                let _ = bucket.check(now, 0, capacity, rate);
                bucket.is_full(capacity)
            }
            _ => true,
        };
        windows_empty && burst_full
    }
}

#[derive(Debug)]
struct LimiterInner {
    config: RateLimiterConfig,
    states: KeyedState<RateLimitState>,
    clock: Arc<dyn Clock>,
    observer: Observer,
}

/// Admission gate keyed by resource identity.
///
/// Cheap to clone; clones share state. Keys are created lazily and evicted
/// once idle for `idle_ttl`.
#[derive(Debug, Clone)]
pub struct SlidingWindowRateLimiter {
    inner: Arc<LimiterInner>,
}

impl SlidingWindowRateLimiter {
    /// In-process limiter without metrics.
    pub fn new(config: RateLimiterConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_parts(config, clock, Observer::default(), None)
    }

    pub(crate) fn with_parts(
        config: RateLimiterConfig,
        clock: Arc<dyn Clock>,
        observer: Observer,
        store: Option<Arc<dyn StateStore>>,
    ) -> Self {
        let namespace = crate::store::namespace("ratelimit", &config.name, &config);
        let states = match store {
            Some(store) => {
                let ttl = config.longest_window().max(config.idle_ttl());
                KeyedState::shared(namespace, clock.clone(), store, ttl)
            }
            None => KeyedState::local(namespace, clock.clone()),
        };
        Self {
            inner: Arc::new(LimiterInner {
                config,
                states,
                clock,
                observer,
            }),
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.inner.config
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Try to admit `cost` units for `key`.
    ///
    /// Admission requires every window (and the burst bucket, if configured)
    /// to have room; nothing is counted on rejection. If a shared store
    /// fails, the call is admitted. If the shared key stays contended, the
    /// call is rejected with a short `retry_after`, since admitting it could
    /// exceed the limit.
    pub async fn try_acquire(&self, key: &str, cost: u32) -> Decision {
        let inner = &self.inner;
        let now = inner.clock.now();
        if cost > inner.config.max_cost() {
            tracing::warn!(
                policy = %self.name(),
                key = %key,
                cost,
                max_cost = inner.config.max_cost(),
                "Cost can never be admitted"
            );
        }
        let evaluation = match inner
            .states
            .update(key, |state| state.evaluate(&inner.config, now, cost))
            .await
        {
            Ok(evaluation) => evaluation,
            Err(e @ StoreError::Contention { .. }) => {
                inner.observer.store_contention("rate_limiter", key, &e);
                return Decision::reject_contended();
            }
            Err(e) => {
                inner.observer.store_error("rate_limiter", key, &e);
                return Decision::admit_unchecked(&inner.config);
            }
        };

        let decision = evaluation.decision;
        if decision.allowed {
            inner.observer.rate_admitted(self.name());
        } else {
            inner.observer.rate_limited(
                self.name(),
                key,
                decision.retry_after,
                evaluation.current_count,
            );
        }
        decision
    }

    /// Drop keys idle for `idle_ttl` with nothing left in their windows.
    pub fn evict_idle(&self) -> usize {
        let config = &self.inner.config;
        self.inner
            .states
            .evict_idle(config.idle_ttl(), |state, now| state.is_idle(config, now))
    }

    pub fn tracked_keys(&self) -> usize {
        self.inner.states.len()
    }
}
