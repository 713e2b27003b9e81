//! Lifecycle management.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     trigger() → every subscriber (server, maintenance sweep) wakes → exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//! ```
//!
//! # Design Decisions
//! - Ordered startup in main: config, logging, metrics, registry, listener
//! - One broadcast channel fans the shutdown signal out to all tasks

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::wait_for_signal;
