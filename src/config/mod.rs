//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GatekeeperConfig (validated, immutable)
//!     → component configs handed explicitly to the registry
//! ```
//!
//! # Design Decisions
//! - One explicit struct per component; nothing is read from globals
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AdminConfig, AdmissionConfig, CircuitBreakerConfig, GatekeeperConfig, ListenerConfig,
    LogFormat, ObservabilityConfig, RateLimiterConfig, RetryConfig, UpstreamConfig,
    WindowConfig,
};
pub use validation::ValidationError;
