//! Single reporting point shared by every guard.
//!
//! Each helper writes a tracing event, a metric and (where applicable) a
//! [`GuardEvent`], so the three views never drift apart.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::circuit_breaker::{CircuitOpenError, Transition};
use crate::circuit_breaker::CircuitState;
use crate::observability::events::{EventBus, GuardEvent};
use crate::observability::metrics::{self, MetricsSink, NoopSink};
use crate::store::StoreError;

#[derive(Debug, Clone)]
pub struct Observer {
    sink: Arc<dyn MetricsSink>,
    events: EventBus,
}

impl Default for Observer {
    fn default() -> Self {
        Self::new(Arc::new(NoopSink), EventBus::default())
    }
}

impl Observer {
    pub fn new(sink: Arc<dyn MetricsSink>, events: EventBus) -> Self {
        Self { sink, events }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn sink(&self) -> &Arc<dyn MetricsSink> {
        &self.sink
    }

    pub(crate) fn circuit_transition(&self, policy: &str, key: &str, transition: &Transition) {
        match transition.to {
            CircuitState::Open => tracing::warn!(
                policy,
                key = %key,
                from = %transition.from,
                failure_count = transition.failure_count,
                "Circuit opened"
            ),
            CircuitState::HalfOpen => tracing::info!(policy, key = %key, "Circuit half-open, probing recovery"),
            CircuitState::Closed => tracing::info!(policy, key = %key, from = %transition.from, "Circuit closed"),
        }
        self.sink.record_count(
            metrics::CIRCUIT_TRANSITIONS,
            &[("policy", policy), ("to", transition.to.as_str())],
        );
        self.events.publish(GuardEvent::CircuitTransition {
            policy: policy.to_string(),
            key: key.to_string(),
            from: transition.from,
            to: transition.to,
            at: transition.at,
        });
    }

    pub(crate) fn circuit_rejected(&self, policy: &str, error: &CircuitOpenError) {
        tracing::debug!(policy, key = %error.key, reason = ?error.reason, "Circuit rejected call");
        self.sink
            .record_count(metrics::CIRCUIT_REJECTIONS, &[("policy", policy)]);
    }

    pub(crate) fn rate_admitted(&self, policy: &str) {
        self.sink
            .record_count(metrics::RATE_LIMIT_ADMITTED, &[("policy", policy)]);
    }

    pub(crate) fn rate_limited(
        &self,
        policy: &str,
        key: &str,
        retry_after: Duration,
        current_count: u32,
    ) {
        let retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX);
        tracing::warn!(policy, key = %key, retry_after_ms, current_count, "Rate limit exceeded");
        self.sink
            .record_count(metrics::RATE_LIMIT_REJECTIONS, &[("policy", policy)]);
        self.events.publish(GuardEvent::RateLimited {
            policy: policy.to_string(),
            key: key.to_string(),
            retry_after_ms,
            current_count,
        });
    }

    pub(crate) fn retry_scheduled(&self, policy: &str, key: &str, attempt: u32, delay: Duration) {
        tracing::debug!(policy, key = %key, attempt, delay = ?delay, "Retrying operation");
        self.sink
            .record_count(metrics::RETRY_ATTEMPTS, &[("policy", policy)]);
    }

    pub(crate) fn retry_exhausted(
        &self,
        policy: &str,
        key: &str,
        attempts: u32,
        last_error: &dyn fmt::Display,
    ) {
        let last_error = last_error.to_string();
        tracing::warn!(policy, key = %key, attempts, error = %last_error, "Retries exhausted");
        self.sink
            .record_count(metrics::RETRY_EXHAUSTED, &[("policy", policy)]);
        self.events.publish(GuardEvent::RetryExhausted {
            policy: policy.to_string(),
            key: key.to_string(),
            attempts,
            last_error,
        });
    }

    pub(crate) fn store_error(&self, component: &str, key: &str, error: &StoreError) {
        tracing::warn!(component, key = %key, error = %error, "State store failed, failing open");
        self.sink
            .record_count(metrics::STORE_ERRORS, &[("component", component)]);
    }

    pub(crate) fn store_contention(&self, component: &str, key: &str, error: &StoreError) {
        tracing::warn!(component, key = %key, error = %error, "State store contended, rejecting");
        self.sink
            .record_count(metrics::STORE_ERRORS, &[("component", component)]);
    }

    pub(crate) fn call_finished(&self, policy: &str, outcome: &str, elapsed: Duration) {
        self.sink.record_duration(
            metrics::CALL_DURATION,
            elapsed,
            &[("policy", policy), ("outcome", outcome)],
        );
    }
}
