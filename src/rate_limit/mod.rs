//! Sliding-window rate limiting.
//!
//! # Data Flow
//! ```text
//! try_acquire(key, cost)
//!     → per-key lock
//!     → window.rs: purge expired buckets, check every window
//!     → burst.rs: refill and check the token bucket (optional)
//!     → all admit: count cost in every window, take tokens
//!     → release lock, report Decision (metrics / event on rejection)
//! ```
//!
//! # Design Decisions
//! - Bucketed windows bound memory per key
//! - Multiple windows per key are ANDed; retry_after is the max over rejections
//! - Rejected requests leave no trace in the counters

mod burst;
mod limiter;
mod window;

pub use burst::TokenBucket;
pub use limiter::{Decision, RateLimitState, SlidingWindowRateLimiter};
pub use window::WindowCounter;
