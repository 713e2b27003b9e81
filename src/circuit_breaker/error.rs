//! Circuit breaker error types.
//!
//! Defines the error returned when the circuit breaker rejects a call.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::clock::Timestamp;

/// Error returned when the circuit breaker rejects a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("circuit for '{key}' is {reason} (failures: {failure_count}, next probe at {next_probe_time})")]
pub struct CircuitOpenError {
    pub key: String,
    /// Earliest time a call may be admitted again.
    pub next_probe_time: Timestamp,
    pub failure_count: u32,
    pub reason: CircuitOpenReason,
}

/// Reason why the circuit breaker rejected a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitOpenReason {
    /// Circuit is open due to failures
    Open,
    /// Circuit is half-open and every trial slot is taken
    HalfOpenSaturated,
}

impl CircuitOpenError {
    /// Time left until `next_probe_time`, zero if it already passed.
    pub fn retry_after(&self, now: Timestamp) -> Duration {
        self.next_probe_time.saturating_duration_since(now)
    }
}

impl fmt::Display for CircuitOpenReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => f.write_str("open"),
            Self::HalfOpenSaturated => f.write_str("testing recovery with every trial slot taken"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_message_names_key_and_reason() {
        let error = CircuitOpenError {
            key: "orders".into(),
            next_probe_time: Timestamp::from_millis(30_000),
            failure_count: 5,
            reason: CircuitOpenReason::Open,
        };
        let message = error.to_string();
        assert!(message.starts_with("circuit for 'orders' is open (failures: 5"));
        assert!(error.source().is_none());

        let saturated = CircuitOpenError {
            reason: CircuitOpenReason::HalfOpenSaturated,
            ..error
        };
        assert!(saturated.to_string().contains("every trial slot taken"));
    }
}
