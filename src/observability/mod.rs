//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! limiter / breaker / retry executor
//!     → observer.rs (one call per noteworthy thing)
//!         → tracing (structured log events, logging.rs installs the subscriber)
//!         → MetricsSink (metrics.rs, Prometheus via the `metrics` facade)
//!         → EventBus (events.rs, broadcast to in-process subscribers)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Metrics are cheap (atomic increments) and labelled by policy, not key
//! - Events never block the guard that emits them

pub mod events;
pub mod logging;
pub mod metrics;
pub mod observer;

pub use events::{EventBus, GuardEvent};
pub use metrics::{FacadeSink, MetricsSink, NoopSink};
pub use observer::Observer;
