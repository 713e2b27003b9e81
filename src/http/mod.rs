//! HTTP surface of the gateway.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request ID, trace, timeout)
//!     → admission.rs (client key → rate limiter, upstream circuit check)
//!     → server.rs forward_handler
//!         → outbound GuardedCall (breaker + retry) → hyper-util client → upstream
//!     → response, or 429 / 503 / 504 / 502 mapped from the guard error
//! ```

pub mod admission;
pub mod request;
pub mod server;

pub use admission::{admission_middleware, AdmissionState, UpstreamGate};
pub use request::{MakeRequestUuidV4, X_REQUEST_ID};
pub use server::{AppState, GatewayServer, ServerError, Upstream, UpstreamError};
