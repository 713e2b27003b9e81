//! Structured logging.
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - JSON format for production, pretty format for development
//! - Log level from config; `RUST_LOG` overrides it

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, ObservabilityConfig};

/// Build the filter: `RUST_LOG` if set, otherwise the configured level.
pub fn env_filter(config: &ObservabilityConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "gatekeeper={level},tower_http={level}",
            level = config.log_level
        ))
    })
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(
    config: &ObservabilityConfig,
) -> Result<(), tracing_subscriber::util::TryInitError> {
    let json = (config.log_format == LogFormat::Json).then(|| tracing_subscriber::fmt::layer().json());
    let pretty = (config.log_format == LogFormat::Pretty).then(tracing_subscriber::fmt::layer);

    tracing_subscriber::registry()
        .with(env_filter(config))
        .with(json)
        .with(pretty)
        .try_init()
}
