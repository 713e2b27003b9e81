//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (limits > 0, windows > 0, ratios in range)
//! - Check that delays and windows are mutually consistent
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: config → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use crate::config::schema::{
    CircuitBreakerConfig, GatekeeperConfig, RateLimiterConfig, RetryConfig,
};

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Validate the full gateway configuration.
pub fn validate_config(config: &GatekeeperConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<std::net::SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            "must be a socket address",
        ));
    }
    if config.listener.request_timeout_secs == 0 {
        errors.push(ValidationError::new(
            "listener.request_timeout_secs",
            "must be greater than zero",
        ));
    }
    if url::Url::parse(&config.upstream.base_url).is_err() {
        errors.push(ValidationError::new("upstream.base_url", "must be a valid URL"));
    }
    if config.admission.key_header.is_empty() {
        errors.push(ValidationError::new(
            "admission.key_header",
            "must not be empty",
        ));
    }

    check_rate_limiter("rate_limit", &config.rate_limit, &mut errors);
    check_circuit_breaker("circuit_breaker", &config.circuit_breaker, &mut errors);
    check_retry("retry", &config.retry, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate a rate limiter configuration on its own.
pub fn validate_rate_limiter(config: &RateLimiterConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    check_rate_limiter("rate_limit", config, &mut errors);
    into_result(errors)
}

/// Validate a circuit breaker configuration on its own.
pub fn validate_circuit_breaker(
    config: &CircuitBreakerConfig,
) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    check_circuit_breaker("circuit_breaker", config, &mut errors);
    into_result(errors)
}

/// Validate a retry configuration on its own.
pub fn validate_retry(config: &RetryConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    check_retry("retry", config, &mut errors);
    into_result(errors)
}

fn into_result(errors: Vec<ValidationError>) -> Result<(), Vec<ValidationError>> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_rate_limiter(prefix: &str, config: &RateLimiterConfig, errors: &mut Vec<ValidationError>) {
    if config.name.is_empty() {
        errors.push(ValidationError::new(format!("{prefix}.name"), "must not be empty"));
    }
    if config.windows.is_empty() {
        errors.push(ValidationError::new(
            format!("{prefix}.windows"),
            "at least one window is required",
        ));
    }
    for (i, window) in config.windows.iter().enumerate() {
        let field = format!("{prefix}.windows[{i}]");
        if window.limit == 0 {
            errors.push(ValidationError::new(format!("{field}.limit"), "must be greater than zero"));
        }
        if window.window_secs == 0 {
            errors.push(ValidationError::new(
                format!("{field}.window_secs"),
                "must be greater than zero",
            ));
        }
        if window.bucket_ms == 0 || window.bucket_ms > window.window_secs.saturating_mul(1_000) {
            errors.push(ValidationError::new(
                format!("{field}.bucket_ms"),
                "must be between 1 and the window length",
            ));
        }
    }
    if config.burst_allowance == Some(0) {
        errors.push(ValidationError::new(
            format!("{prefix}.burst_allowance"),
            "must be greater than zero when set",
        ));
    }
    if config.idle_ttl_secs == 0 {
        errors.push(ValidationError::new(
            format!("{prefix}.idle_ttl_secs"),
            "must be greater than zero",
        ));
    }
}

fn check_circuit_breaker(
    prefix: &str,
    config: &CircuitBreakerConfig,
    errors: &mut Vec<ValidationError>,
) {
    if config.name.is_empty() {
        errors.push(ValidationError::new(format!("{prefix}.name"), "must not be empty"));
    }
    match config.failure_rate {
        Some(rate) if !(rate > 0.0 && rate <= 1.0) => {
            errors.push(ValidationError::new(
                format!("{prefix}.failure_rate"),
                "must be within (0.0, 1.0]",
            ));
        }
        Some(_) if config.minimum_calls == 0 => {
            errors.push(ValidationError::new(
                format!("{prefix}.minimum_calls"),
                "must be greater than zero when failure_rate is set",
            ));
        }
        None if config.failure_threshold == 0 => {
            errors.push(ValidationError::new(
                format!("{prefix}.failure_threshold"),
                "must be greater than zero",
            ));
        }
        _ => {}
    }
    if config.evaluation_window_ms == 0 {
        errors.push(ValidationError::new(
            format!("{prefix}.evaluation_window_ms"),
            "must be greater than zero",
        ));
    }
    if config.recovery_timeout_ms == 0 {
        errors.push(ValidationError::new(
            format!("{prefix}.recovery_timeout_ms"),
            "must be greater than zero",
        ));
    }
    if config.success_threshold == 0 {
        errors.push(ValidationError::new(
            format!("{prefix}.success_threshold"),
            "must be greater than zero",
        ));
    }
    if config.half_open_max_calls == 0 {
        errors.push(ValidationError::new(
            format!("{prefix}.half_open_max_calls"),
            "must be greater than zero",
        ));
    }
}

fn check_retry(prefix: &str, config: &RetryConfig, errors: &mut Vec<ValidationError>) {
    if config.max_attempts == 0 {
        errors.push(ValidationError::new(
            format!("{prefix}.max_attempts"),
            "must be at least 1",
        ));
    }
    if !config.backoff_multiplier.is_finite() || config.backoff_multiplier < 1.0 {
        errors.push(ValidationError::new(
            format!("{prefix}.backoff_multiplier"),
            "must be a finite number >= 1.0",
        ));
    }
    if config.max_delay_ms < config.base_delay_ms {
        errors.push(ValidationError::new(
            format!("{prefix}.max_delay_ms"),
            "must not be smaller than base_delay_ms",
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::WindowConfig;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&GatekeeperConfig::default()).is_ok());
    }

    #[test]
    fn test_collects_every_error() {
        let mut config = GatekeeperConfig::default();
        config.rate_limit.windows = vec![WindowConfig {
            limit: 0,
            window_secs: 0,
            bucket_ms: 0,
        }];
        config.retry.backoff_multiplier = 0.5;
        config.circuit_breaker.failure_rate = Some(1.5);

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"rate_limit.windows[0].limit"));
        assert!(fields.contains(&"rate_limit.windows[0].window_secs"));
        assert!(fields.contains(&"rate_limit.windows[0].bucket_ms"));
        assert!(fields.contains(&"retry.backoff_multiplier"));
        assert!(fields.contains(&"circuit_breaker.failure_rate"));
    }

    #[test]
    fn test_retry_delays_must_be_ordered() {
        let config = RetryConfig {
            base_delay_ms: 5_000,
            max_delay_ms: 1_000,
            ..Default::default()
        };
        let errors = validate_retry(&config).unwrap_err();
        assert_eq!(errors[0].to_string(), "retry.max_delay_ms: must not be smaller than base_delay_ms");
    }
}
