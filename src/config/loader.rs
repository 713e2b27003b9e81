//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::GatekeeperConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<GatekeeperConfig, ConfigError> {
    let config: GatekeeperConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<GatekeeperConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config = parse_config(
            r#"
            [listener]
            bind_address = "127.0.0.1:8080"

            [upstream]
            base_url = "http://127.0.0.1:3000"

            [rate_limit]
            windows = [
                { limit = 60, window_secs = 60 },
                { limit = 1000, window_secs = 3600, bucket_ms = 60000 },
            ]

            [circuit_breaker]
            failure_threshold = 3
            recovery_timeout_ms = 10000

            [retry]
            max_attempts = 4
            backoff = "linear"
            jitter = "full"
            "#,
        )
        .unwrap();
        assert_eq!(config.rate_limit.windows[1].bucket_ms, 60_000);
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.backoff, crate::retry::BackoffStrategy::Linear);
    }

    #[test]
    fn test_validation_errors_are_joined() {
        let err = parse_config("[retry]\nmax_attempts = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        assert_eq!(
            err.to_string(),
            "Validation failed: retry.max_attempts: must be at least 1"
        );
    }

    #[test]
    fn test_sample_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("gatekeeper.toml");
        let config = load_config(&path).unwrap();
        assert_eq!(config.rate_limit.name, "inbound");
        assert_eq!(config.rate_limit.burst_allowance, Some(10));
        assert_eq!(config.circuit_breaker.name, "upstream");
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = load_config(Path::new("/nonexistent/gatekeeper.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
