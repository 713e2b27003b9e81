//! Guard composition.
//!
//! # Data Flow
//! ```text
//! GuardRegistry (built at startup, injected)
//!     → rate_limiter(config) / circuit_breaker(config)   shared by name + config
//!     → call().rate_limit(..).circuit_breaker(..).retry(..).build()
//!
//! GuardedCall::call(key, op)
//!     → SlidingWindowRateLimiter::try_acquire(key)   → RateLimitExceeded
//!     → RetryExecutor loop
//!           → CircuitBreaker::acquire(key)          → CircuitOpen
//!           → op()                                  → record outcome
//!     → call duration metric tagged with the outcome
//! ```
//!
//! # Design Decisions
//! - No global registry: callers own a `GuardRegistry` and pass it around
//! - The breaker is re-consulted on every retry attempt, so a circuit opening
//!   mid-sequence stops the remaining attempts
//! - The protected operation is a closure returning a future; it is called
//!   once per attempt

mod call;
mod registry;

pub use call::{GuardedCall, GuardedCallBuilder};
pub use registry::{GuardRegistry, GuardRegistryBuilder};
