//! Gatekeeper: resilience and admission control.
//!
//! Three guards, composable around any async operation:
//! - [`SlidingWindowRateLimiter`]: per-key admission over one or more windows
//! - [`CircuitBreaker`]: per-key Closed → Open → HalfOpen failure isolation
//! - [`RetryExecutor`]: exponential backoff with jitter
//!
//! [`GuardedCall`] applies them in a fixed order (limiter, breaker, retry) and
//! [`GuardRegistry`] owns the named instances. The `gatekeeper` binary puts
//! the same guards in front of an HTTP upstream.

// Guards
pub mod circuit_breaker;
pub mod guard;
pub mod rate_limit;
pub mod retry;

// Foundations
pub mod clock;
pub mod context;
pub mod error;
pub mod store;

// Gateway surface
pub mod admin;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod observability;

pub use circuit_breaker::{CircuitBreaker, CircuitOpenError, CircuitState, Outcome};
pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use config::GatekeeperConfig;
pub use context::CallContext;
pub use error::GuardError;
pub use guard::{GuardRegistry, GuardedCall};
pub use http::GatewayServer;
pub use lifecycle::Shutdown;
pub use rate_limit::{Decision, SlidingWindowRateLimiter};
pub use retry::{RetryExecutor, RetryPolicy};
