//! Circuit breaker state machine.
//!
//! A [`CircuitRecord`] is the complete per-key state. Every operation is a
//! plain method over `&mut CircuitRecord`, so the same transitions run under
//! a local per-key mutex or inside a shared-store compare-and-swap loop.
//!
//! # Transitions
//! ```text
//! Closed   → Open:     windowed failures meet the threshold
//! Open     → HalfOpen: first admission at or after next_probe_time
//! HalfOpen → Closed:   success_threshold consecutive trial successes
//! HalfOpen → Open:     any trial failure (recovery timer restarts)
//! ```
//!
//! Every transition bumps `epoch`. Outcomes carrying an older epoch only
//! update statistics, so a slow call admitted while Closed cannot move a
//! circuit that has since opened.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::error::{CircuitOpenError, CircuitOpenReason};
use crate::clock::Timestamp;
use crate::config::CircuitBreakerConfig;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through and outcomes are counted.
    #[default]
    Closed,
    /// Calls are rejected without invoking the operation.
    Open,
    /// A bounded number of trial calls probe recovery.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a completed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// A failure the caller may retry; counts toward opening the circuit.
    RetryableFailure,
    /// A failure that will not be retried; counts toward opening the circuit.
    FatalFailure,
    /// Not counted at all (e.g. caller errors such as bad input).
    Ignored,
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::RetryableFailure | Self::FatalFailure)
    }
}

/// Lifetime counters for one circuit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitStats {
    pub total_successes: u64,
    pub total_retryable_failures: u64,
    pub total_fatal_failures: u64,
    pub total_ignored: u64,
    pub total_rejections: u64,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl CircuitStats {
    fn observe(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Success => {
                self.total_successes += 1;
                self.consecutive_successes = self.consecutive_successes.saturating_add(1);
                self.consecutive_failures = 0;
            }
            Outcome::RetryableFailure | Outcome::FatalFailure => {
                if outcome == Outcome::RetryableFailure {
                    self.total_retryable_failures += 1;
                } else {
                    self.total_fatal_failures += 1;
                }
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.consecutive_successes = 0;
            }
            Outcome::Ignored => self.total_ignored += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct OutcomeBucket {
    start: Timestamp,
    successes: u32,
    failures: u32,
}

/// Rolling evaluation window of call outcomes, split into time buckets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct OutcomeWindow {
    buckets: VecDeque<OutcomeBucket>,
}

impl OutcomeWindow {
    fn purge(&mut self, now: Timestamp, window: Duration) {
        while let Some(front) = self.buckets.front() {
            if front.start + window <= now {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    fn record(&mut self, now: Timestamp, width: Duration, failure: bool) {
        let starts_bucket = self
            .buckets
            .back()
            .map_or(true, |back| now >= back.start + width);
        if starts_bucket {
            self.buckets.push_back(OutcomeBucket {
                start: now,
                successes: 0,
                failures: 0,
            });
        }
        if let Some(bucket) = self.buckets.back_mut() {
            if failure {
                bucket.failures = bucket.failures.saturating_add(1);
            } else {
                bucket.successes = bucket.successes.saturating_add(1);
            }
        }
    }

    /// (successes, failures) currently in the window.
    fn counts(&self) -> (u32, u32) {
        self.buckets.iter().fold((0u32, 0u32), |(s, f), b| {
            (s.saturating_add(b.successes), f.saturating_add(b.failures))
        })
    }

    fn clear(&mut self) {
        self.buckets.clear();
    }
}

/// Proof of admission handed out by [`CircuitRecord::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Ticket {
    pub epoch: u64,
    /// Whether the call holds one of the half-open trial slots.
    pub trial: bool,
}

impl Ticket {
    /// Ticket for a call admitted while the state could not be consulted.
    pub(crate) const DETACHED: Ticket = Ticket {
        epoch: u64::MAX,
        trial: false,
    };
}

/// A state change, reported after the per-key lock is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: Timestamp,
    pub failure_count: u32,
}

/// Rejection details, turned into a [`CircuitOpenError`] by the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Rejection {
    pub next_probe_time: Timestamp,
    pub failure_count: u32,
    pub reason: CircuitOpenReason,
}

impl Rejection {
    pub(crate) fn into_error(self, key: &str) -> CircuitOpenError {
        CircuitOpenError {
            key: key.to_string(),
            next_probe_time: self.next_probe_time,
            failure_count: self.failure_count,
            reason: self.reason,
        }
    }
}

/// Result of an admission attempt.
#[derive(Debug)]
pub(crate) struct Admission {
    pub result: Result<Ticket, Rejection>,
    pub transition: Option<Transition>,
}

/// Complete state of one circuit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CircuitRecord {
    state: CircuitState,
    epoch: u64,
    window: OutcomeWindow,
    /// Failures since the circuit last entered Closed.
    failure_count: u32,
    /// Consecutive trial successes in the current HalfOpen period.
    success_count: u32,
    half_open_in_flight: u32,
    half_open_since: Option<Timestamp>,
    last_transition: Option<Timestamp>,
    next_probe_time: Option<Timestamp>,
    stats: CircuitStats,
}

impl CircuitRecord {
    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn success_count(&self) -> u32 {
        self.success_count
    }

    pub fn next_probe_time(&self) -> Option<Timestamp> {
        self.next_probe_time
    }

    pub fn last_transition(&self) -> Option<Timestamp> {
        self.last_transition
    }

    pub fn stats(&self) -> &CircuitStats {
        &self.stats
    }

    /// Try to admit one call.
    pub(crate) fn admit(&mut self, config: &CircuitBreakerConfig, now: Timestamp) -> Admission {
        let mut transition = None;

        if self.state == CircuitState::Open {
            let probe_at = self.next_probe_time.unwrap_or(now);
            if now < probe_at {
                self.stats.total_rejections += 1;
                return Admission {
                    result: Err(Rejection {
                        next_probe_time: probe_at,
                        failure_count: self.failure_count,
                        reason: CircuitOpenReason::Open,
                    }),
                    transition: None,
                };
            }
            transition = Some(self.transition_to(config, CircuitState::HalfOpen, now));
        }

        if self.state == CircuitState::HalfOpen {
            if self.half_open_in_flight >= config.half_open_max_calls.max(1) {
                // Trials that never reported back within a recovery period are reclaimed.
                let since = self.half_open_since.unwrap_or(now);
                if now < since + config.recovery_timeout() {
                    self.stats.total_rejections += 1;
                    return Admission {
                        result: Err(Rejection {
                            next_probe_time: now,
                            failure_count: self.failure_count,
                            reason: CircuitOpenReason::HalfOpenSaturated,
                        }),
                        transition,
                    };
                }
                self.epoch = self.epoch.wrapping_add(1);
                self.half_open_in_flight = 0;
                self.half_open_since = Some(now);
            }
            self.half_open_in_flight += 1;
            return Admission {
                result: Ok(Ticket {
                    epoch: self.epoch,
                    trial: true,
                }),
                transition,
            };
        }

        Admission {
            result: Ok(Ticket {
                epoch: self.epoch,
                trial: false,
            }),
            transition,
        }
    }

    /// Whether a call would currently be rejected, without admitting it.
    pub(crate) fn peek(&self, config: &CircuitBreakerConfig, now: Timestamp) -> Option<Rejection> {
        match self.state {
            CircuitState::Open => {
                let probe_at = self.next_probe_time.unwrap_or(now);
                (now < probe_at).then_some(Rejection {
                    next_probe_time: probe_at,
                    failure_count: self.failure_count,
                    reason: CircuitOpenReason::Open,
                })
            }
            CircuitState::HalfOpen => {
                let since = self.half_open_since.unwrap_or(now);
                let saturated = self.half_open_in_flight >= config.half_open_max_calls.max(1)
                    && now < since + config.recovery_timeout();
                saturated.then_some(Rejection {
                    next_probe_time: now,
                    failure_count: self.failure_count,
                    reason: CircuitOpenReason::HalfOpenSaturated,
                })
            }
            CircuitState::Closed => None,
        }
    }

    /// Record the outcome of an admitted call.
    pub(crate) fn record(
        &mut self,
        config: &CircuitBreakerConfig,
        now: Timestamp,
        ticket: Ticket,
        outcome: Outcome,
    ) -> Option<Transition> {
        self.stats.observe(outcome);
        if ticket.epoch != self.epoch {
            return None;
        }
        if ticket.trial {
            self.half_open_in_flight = self.half_open_in_flight.saturating_sub(1);
        }
        if outcome == Outcome::Ignored {
            return None;
        }

        match self.state {
            CircuitState::Closed => {
                self.window.purge(now, config.evaluation_window());
                self.window
                    .record(now, config.bucket_width(), outcome.is_failure());
                if outcome.is_failure() {
                    self.failure_count = self.failure_count.saturating_add(1);
                    let (successes, failures) = self.window.counts();
                    if config.trips(successes, failures) {
                        return Some(self.transition_to(config, CircuitState::Open, now));
                    }
                }
                None
            }
            CircuitState::HalfOpen if outcome.is_failure() => {
                self.failure_count = self.failure_count.saturating_add(1);
                Some(self.transition_to(config, CircuitState::Open, now))
            }
            CircuitState::HalfOpen => {
                self.success_count = self.success_count.saturating_add(1);
                if self.success_count >= config.success_threshold.max(1) {
                    Some(self.transition_to(config, CircuitState::Closed, now))
                } else {
                    None
                }
            }
            CircuitState::Open => None,
        }
    }

    /// Give back a trial slot whose call ended without an outcome.
    pub(crate) fn release(&mut self, ticket: Ticket) {
        if ticket.trial && ticket.epoch == self.epoch {
            self.half_open_in_flight = self.half_open_in_flight.saturating_sub(1);
        }
    }

    /// Force the circuit back to a fresh Closed state.
    pub(crate) fn reset(&mut self, config: &CircuitBreakerConfig, now: Timestamp) -> Option<Transition> {
        let transition = (self.state != CircuitState::Closed)
            .then(|| self.transition_to(config, CircuitState::Closed, now));
        self.failure_count = 0;
        self.window.clear();
        self.stats = CircuitStats::default();
        transition
    }

    /// Closed with no recent outcomes: indistinguishable from a fresh circuit.
    pub(crate) fn is_idle(&mut self, config: &CircuitBreakerConfig, now: Timestamp) -> bool {
        self.window.purge(now, config.evaluation_window());
        self.state == CircuitState::Closed && self.window.buckets.is_empty()
    }

    /// (successes, failures) inside the evaluation window.
    pub fn window_counts(&self, config: &CircuitBreakerConfig, now: Timestamp) -> (u32, u32) {
        let mut window = self.window.clone();
        window.purge(now, config.evaluation_window());
        window.counts()
    }

    fn transition_to(
        &mut self,
        config: &CircuitBreakerConfig,
        to: CircuitState,
        now: Timestamp,
    ) -> Transition {
        let from = self.state;
        self.state = to;
        self.epoch = self.epoch.wrapping_add(1);
        self.last_transition = Some(now);
        self.half_open_in_flight = 0;
        self.success_count = 0;

        match to {
            CircuitState::Open => {
                self.next_probe_time = Some(now + config.recovery_timeout());
                self.half_open_since = None;
            }
            CircuitState::HalfOpen => {
                self.next_probe_time = None;
                self.half_open_since = Some(now);
            }
            CircuitState::Closed => {
                self.failure_count = 0;
                self.window.clear();
                self.next_probe_time = None;
                self.half_open_since = None;
            }
        }

        Transition {
            from,
            to,
            at: now,
            failure_count: self.failure_count,
        }
    }
}
