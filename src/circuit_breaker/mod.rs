//! Circuit breaker for dependency protection.
//!
//! # States
//! - Closed: normal operation, calls pass through and outcomes are counted
//! - Open: dependency assumed down, calls fail fast
//! - Half-Open: a bounded number of trial calls probe recovery
//!
//! # Data Flow
//! ```text
//! acquire(key)
//!     → per-key lock: admit (may move Open → HalfOpen), release lock
//!     → CallPermit handed to caller; operation runs with no lock held
//!     → permit.record(outcome): per-key lock, update window, release lock
//!     → transition events/metrics emitted after the lock is released
//! ```
//!
//! # Design Decisions
//! - Per-key circuit breaker (not global)
//! - Fail fast in Open state (no waiting for timeout)
//! - Outcome classification is supplied by the caller
//! - An abandoned permit returns its trial slot (RAII)

mod breaker;
mod error;
mod state;

pub use breaker::{CallPermit, CircuitBreaker, CircuitSnapshot};
pub use error::{CircuitOpenError, CircuitOpenReason};
pub use state::{CircuitRecord, CircuitState, CircuitStats, Outcome, Transition};
