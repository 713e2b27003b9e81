//! Error taxonomy for guarded calls.
//!
//! # Data Flow
//! ```text
//! rate limiter rejects   → RateLimitExceeded (operation never invoked)
//! circuit is open        → CircuitOpen       (operation never invoked)
//! operation keeps failing → RetryExhausted   (last error kept as source)
//! deadline / cancel      → Cancelled
//! non-retryable error    → Operation         (returned unchanged)
//! ```

use std::time::Duration;

use crate::circuit_breaker::CircuitOpenError;
use crate::clock::Timestamp;

/// Error returned by a guarded call around an operation failing with `E`.
#[derive(Debug, thiserror::Error)]
pub enum GuardError<E> {
    #[error("rate limit exceeded for '{key}', retry after {retry_after:?}")]
    RateLimitExceeded { key: String, retry_after: Duration },

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last_error: E,
    },

    #[error("guarded call cancelled")]
    Cancelled,

    #[error(transparent)]
    Operation(E),
}

impl<E> GuardError<E> {
    /// True for errors produced without invoking the operation.
    pub fn is_fail_fast(&self) -> bool {
        matches!(self, Self::RateLimitExceeded { .. } | Self::CircuitOpen(_))
    }

    /// How long a caller should wait before trying again, for fail-fast errors.
    pub fn retry_after(&self, now: Timestamp) -> Option<Duration> {
        match self {
            Self::RateLimitExceeded { retry_after, .. } => Some(*retry_after),
            Self::CircuitOpen(open) => Some(open.retry_after(now)),
            _ => None,
        }
    }

    /// The underlying operation error, if the operation produced one.
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            Self::RetryExhausted { last_error, .. } => Some(last_error),
            Self::Operation(e) => Some(e),
            _ => None,
        }
    }

    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimitExceeded { .. } => "rate_limited",
            Self::CircuitOpen(_) => "circuit_open",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::Cancelled => "cancelled",
            Self::Operation(_) => "operation_error",
        }
    }
}
