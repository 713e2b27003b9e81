//! Retry with exponential backoff.
//!
//! # Responsibilities
//! - Compute delays: exponential growth, capped, with optional jitter
//! - Re-run an operation while the caller's predicate says it is retryable
//! - Stop on exhaustion, non-retryable errors, open circuits and cancellation
//!
//! # Design Decisions
//! - Retryability is always the caller's decision
//! - Waiting goes through the Clock so tests observe exact delays
//! - Jittered backoff prevents thundering herd
//! - Named presets for common call types (network, database, idempotent)

mod backoff;
mod executor;
mod policy;

pub use backoff::{apply_jitter, calculate_backoff, next_delay, BackoffStrategy, Jitter};
pub use executor::RetryExecutor;
pub use policy::RetryPolicy;
