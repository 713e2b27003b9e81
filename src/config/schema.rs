//! Configuration schema definitions.
//!
//! This module defines the configuration structure for the gateway and one
//! explicit struct per guard component. All types derive Serde traits for
//! deserialization from config files; every field has a default so minimal
//! configs work.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::{BackoffStrategy, Jitter};

/// Root configuration for the gateway binary.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatekeeperConfig {
    /// Listener configuration (bind address, request limits).
    pub listener: ListenerConfig,

    /// The dependency requests are forwarded to.
    pub upstream: UpstreamConfig,

    /// Inbound admission control.
    pub admission: AdmissionConfig,

    /// Inbound rate limiting policy.
    pub rate_limit: RateLimiterConfig,

    /// Circuit breaker guarding the upstream.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Retry policy for upstream calls.
    pub retry: RetryConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Admin API settings.
    pub admin: AdminConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Total time budget for one inbound request, retries included.
    pub request_timeout_secs: u64,

    /// Largest request body buffered for forwarding.
    pub max_body_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            request_timeout_secs: 30,
            max_body_bytes: 1024 * 1024,
        }
    }
}

/// Upstream dependency configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL requests are forwarded to (e.g., "http://127.0.0.1:3000").
    pub base_url: String,

    /// Retry only idempotent methods (GET, HEAD, PUT, DELETE, OPTIONS, TRACE).
    pub retry_idempotent_only: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3000".to_string(),
            retry_idempotent_only: true,
        }
    }
}

/// Inbound admission control configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Enable admission control.
    pub enabled: bool,

    /// Path prefixes that bypass admission control.
    pub excluded_paths: Vec<String>,

    /// Header identifying the client; falls back to the peer IP.
    pub key_header: String,

    /// Reject inbound requests early while the upstream circuit is open.
    pub shed_on_open_circuit: bool,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            excluded_paths: vec!["/health".to_string(), "/metrics".to_string()],
            key_header: "x-api-key".to_string(),
            shed_on_open_circuit: true,
        }
    }
}

/// One counting window of a rate limiter.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct WindowConfig {
    /// Maximum admitted cost within the window.
    pub limit: u32,

    /// Window length in seconds.
    pub window_secs: u64,

    /// Bucket granularity in milliseconds.
    #[serde(default = "default_bucket_ms")]
    pub bucket_ms: u64,
}

fn default_bucket_ms() -> u64 {
    1_000
}

impl WindowConfig {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window_secs: window.as_secs().max(1),
            bucket_ms: default_bucket_ms(),
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn granularity(&self) -> Duration {
        Duration::from_millis(self.bucket_ms.max(1))
    }
}

/// Sliding-window rate limiter configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Policy name; the registry keeps one limiter per name.
    pub name: String,

    /// Windows enforced together (admission requires all of them).
    pub windows: Vec<WindowConfig>,

    /// Token bucket capacity layered on top of the windows.
    pub burst_allowance: Option<u32>,

    /// Keys idle for this long are evicted.
    pub idle_ttl_secs: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            windows: vec![
                WindowConfig::new(60, Duration::from_secs(60)),
                WindowConfig::new(1_000, Duration::from_secs(3_600)),
            ],
            burst_allowance: None,
            idle_ttl_secs: 7_200,
        }
    }
}

impl RateLimiterConfig {
    /// A single window of `limit` requests per minute.
    pub fn per_minute(limit: u32) -> Self {
        Self {
            windows: vec![WindowConfig::new(limit, Duration::from_secs(60))],
            ..Self::default()
        }
    }

    /// A single window of `limit` requests per hour.
    pub fn per_hour(limit: u32) -> Self {
        Self {
            windows: vec![WindowConfig::new(limit, Duration::from_secs(3_600))],
            ..Self::default()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_window(mut self, limit: u32, window: Duration) -> Self {
        self.windows.push(WindowConfig::new(limit, window));
        self
    }

    pub fn with_burst(mut self, allowance: u32) -> Self {
        self.burst_allowance = Some(allowance);
        self
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    /// Largest cost a single call can ever be admitted with: the smallest
    /// window limit, further capped by the burst allowance.
    pub fn max_cost(&self) -> u32 {
        let windows = self.windows.iter().map(|w| w.limit).min().unwrap_or(0);
        self.burst_allowance.map_or(windows, |burst| windows.min(burst))
    }

    /// Longest configured window.
    pub fn longest_window(&self) -> Duration {
        self.windows
            .iter()
            .map(WindowConfig::window)
            .max()
            .unwrap_or_default()
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Policy name; the registry keeps one breaker per name.
    pub name: String,

    /// Failures within the evaluation window that open the circuit.
    pub failure_threshold: u32,

    /// When set, open on failure ratio (0.0..=1.0) instead of absolute count.
    pub failure_rate: Option<f64>,

    /// Calls required in the window before the failure ratio is considered.
    pub minimum_calls: u32,

    /// Rolling window over which outcomes are counted, in milliseconds.
    pub evaluation_window_ms: u64,

    /// Time spent Open before a probe is allowed, in milliseconds.
    pub recovery_timeout_ms: u64,

    /// Consecutive successful probes needed to close the circuit.
    pub success_threshold: u32,

    /// Concurrent trial calls allowed while HalfOpen.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            failure_threshold: 5,
            failure_rate: None,
            minimum_calls: 10,
            evaluation_window_ms: 60_000,
            recovery_timeout_ms: 30_000,
            success_threshold: 2,
            half_open_max_calls: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn evaluation_window(&self) -> Duration {
        Duration::from_millis(self.evaluation_window_ms)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    /// Bucket width of the rolling evaluation window.
    pub fn bucket_width(&self) -> Duration {
        Duration::from_millis((self.evaluation_window_ms / 10).max(1))
    }

    /// Whether the windowed counts meet the configured failure threshold.
    pub fn trips(&self, successes: u32, failures: u32) -> bool {
        match self.failure_rate {
            Some(rate) => {
                let total = successes.saturating_add(failures);
                total >= self.minimum_calls.max(1)
                    && f64::from(failures) / f64::from(total) >= rate
            }
            None => failures >= self.failure_threshold.max(1),
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Policy name used in logs and metrics.
    pub name: String,

    /// Total attempts, the first call included.
    pub max_attempts: u32,

    /// Delay before the second attempt, in milliseconds.
    pub base_delay_ms: u64,

    /// How delays grow between attempts.
    pub backoff: BackoffStrategy,

    /// Growth factor between attempts under exponential backoff.
    pub backoff_multiplier: f64,

    /// Randomization applied to each delay.
    pub jitter: Jitter,

    /// Upper bound for a single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_attempts: 3,
            base_delay_ms: 1_000,
            backoff: BackoffStrategy::Exponential,
            backoff_multiplier: 2.0,
            jitter: Jitter::Equal,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryConfig {
    /// Transient network failures: many quick attempts.
    pub fn network() -> Self {
        Self {
            name: "network".to_string(),
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            ..Self::default()
        }
    }

    /// Database calls: few attempts, short deterministic delays.
    pub fn database() -> Self {
        Self {
            name: "database".to_string(),
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            jitter: Jitter::None,
            ..Self::default()
        }
    }

    /// Idempotent operations that can be retried for a long time.
    pub fn idempotent() -> Self {
        Self {
            name: "idempotent".to_string(),
            max_attempts: 10,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            ..Self::default()
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn single_attempt() -> Self {
        Self {
            name: "single".to_string(),
            max_attempts: 1,
            jitter: Jitter::None,
            ..Self::default()
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,

    /// Buffered guard events per subscriber before old ones are dropped.
    pub event_capacity: usize,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
            event_capacity: 1_024,
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let config: GatekeeperConfig = toml::from_str(
            r#"
            [rate_limit]
            name = "inbound"
            windows = [{ limit = 60, window_secs = 60 }]
            burst_allowance = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.rate_limit.name, "inbound");
        assert_eq!(config.rate_limit.windows[0].bucket_ms, 1_000);
        assert_eq!(config.rate_limit.burst_allowance, Some(10));
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.jitter, Jitter::Equal);
    }

    #[test]
    fn test_failure_rate_needs_minimum_volume() {
        let config = CircuitBreakerConfig {
            failure_rate: Some(0.5),
            minimum_calls: 4,
            ..Default::default()
        };
        assert!(!config.trips(0, 3));
        assert!(config.trips(2, 2));
        assert!(!config.trips(3, 1));
    }

    #[test]
    fn test_retry_presets() {
        assert_eq!(RetryConfig::network().max_attempts, 5);
        assert_eq!(RetryConfig::database().jitter, Jitter::None);
        assert_eq!(RetryConfig::idempotent().max_delay(), Duration::from_secs(60));
    }

    #[test]
    fn test_rate_limit_constructors() {
        let config = RateLimiterConfig::per_minute(60)
            .with_window(1_000, Duration::from_secs(3_600))
            .with_burst(10)
            .named("api");
        assert_eq!(config.windows.len(), 2);
        assert_eq!(config.longest_window(), Duration::from_secs(3_600));
        assert_eq!(config.name, "api");
    }
}
