//! Backoff strategies with jitter.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::RetryConfig;

/// Randomization applied to a computed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Jitter {
    /// Use the delay as computed.
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// `delay / 2` plus uniform in `[0, delay / 2]`.
    Equal,
}

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// `base_delay` every time.
    Fixed,
    /// `base_delay × attempt`.
    Linear,
    /// `base_delay × multiplier^(attempt - 1)`.
    #[default]
    Exponential,
}

/// Delay after `attempt` under the configured strategy, capped at
/// `max_delay`, before jitter.
///
/// `attempt` is the attempt that just failed, starting at 1.
pub fn calculate_backoff(config: &RetryConfig, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let base_ms = config.base_delay_ms as f64;
    let delay_ms = match config.backoff {
        BackoffStrategy::Fixed => base_ms,
        BackoffStrategy::Linear => base_ms * f64::from(attempt),
        BackoffStrategy::Exponential => {
            let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
            base_ms * config.backoff_multiplier.powi(exponent)
        }
    };
    let max_ms = config.max_delay_ms as f64;
    let capped = if delay_ms.is_finite() {
        delay_ms.min(max_ms)
    } else {
        max_ms
    };

    Duration::from_millis(capped.max(0.0).round() as u64)
}

pub fn apply_jitter(delay: Duration, jitter: Jitter) -> Duration {
    let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    let jittered = match jitter {
        Jitter::None => return delay,
        Jitter::Full => rand::thread_rng().gen_range(0..=ms),
        Jitter::Equal => {
            let half = ms / 2;
            half + rand::thread_rng().gen_range(0..=ms - half)
        }
    };
    Duration::from_millis(jittered)
}

/// Delay to wait after `attempt` failed.
pub fn next_delay(config: &RetryConfig, attempt: u32) -> Duration {
    apply_jitter(calculate_backoff(config, attempt), config.jitter)
}
