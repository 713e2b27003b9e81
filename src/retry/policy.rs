//! Retry policy: configuration plus the caller's retryability predicate.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::retry::backoff::next_delay;

type Predicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// How to retry an operation failing with `E`.
///
/// This layer never decides which errors are retryable; the predicate does.
pub struct RetryPolicy<E> {
    config: RetryConfig,
    retryable: Predicate<E>,
}

impl<E> RetryPolicy<E> {
    pub fn new(config: RetryConfig, retryable: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        Self {
            config,
            retryable: Arc::new(retryable),
        }
    }

    /// Retry every error.
    pub fn always(config: RetryConfig) -> Self {
        Self::new(config, |_| true)
    }

    /// Make exactly one attempt.
    pub fn none() -> Self {
        Self::new(RetryConfig::single_attempt(), |_| false)
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    pub fn is_retryable(&self, error: &E) -> bool {
        (self.retryable)(error)
    }

    /// Delay after `attempt` failed, jitter included.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        next_delay(&self.config, attempt)
    }
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            retryable: Arc::clone(&self.retryable),
        }
    }
}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
