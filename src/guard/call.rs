//! A protected operation: limiter, breaker and retry composed in order.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::circuit_breaker::{CircuitBreaker, Outcome};
use crate::config::{CircuitBreakerConfig, RateLimiterConfig};
use crate::context::CallContext;
use crate::error::GuardError;
use crate::guard::registry::GuardRegistry;
use crate::rate_limit::SlidingWindowRateLimiter;
use crate::retry::{RetryExecutor, RetryPolicy};

type Classifier<E> = Arc<dyn Fn(&E) -> Outcome + Send + Sync>;

/// Guards composed around calls that fail with `E`.
///
/// Every call goes through, in order:
/// 1. the rate limiter (rejects with [`GuardError::RateLimitExceeded`])
/// 2. the circuit breaker, consulted before every attempt
/// 3. the retry loop
///
/// Any of the three may be absent. Cheap to clone.
pub struct GuardedCall<E> {
    name: String,
    limiter: Option<SlidingWindowRateLimiter>,
    breaker: Option<CircuitBreaker>,
    retry: RetryPolicy<E>,
    classify: Classifier<E>,
    cost: u32,
    executor: RetryExecutor,
    registry: GuardRegistry,
}

impl<E: fmt::Display> GuardedCall<E> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rate_limiter(&self) -> Option<&SlidingWindowRateLimiter> {
        self.limiter.as_ref()
    }

    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_ref()
    }

    pub fn retry_policy(&self) -> &RetryPolicy<E> {
        &self.retry
    }

    /// Run `operation` for `key` with no deadline.
    pub async fn call<T, F, Fut>(&self, key: &str, operation: F) -> Result<T, GuardError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_with(key, &CallContext::new(), operation).await
    }

    /// Run `operation` for `key`, honouring the context's cancellation and deadline.
    pub async fn call_with<T, F, Fut>(
        &self,
        key: &str,
        ctx: &CallContext,
        operation: F,
    ) -> Result<T, GuardError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let clock = self.registry.clock();
        let started = clock.now();
        let result = self.run(key, ctx, operation).await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.kind(),
        };
        self.registry.observer().call_finished(
            &self.name,
            outcome,
            clock.now().saturating_duration_since(started),
        );
        result
    }

    async fn run<T, F, Fut>(
        &self,
        key: &str,
        ctx: &CallContext,
        operation: F,
    ) -> Result<T, GuardError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(limiter) = &self.limiter {
            let decision = limiter.try_acquire(key, self.cost).await;
            if !decision.allowed {
                return Err(GuardError::RateLimitExceeded {
                    key: key.to_string(),
                    retry_after: decision.retry_after,
                });
            }
        }

        match &self.breaker {
            Some(breaker) => {
                let classify = &self.classify;
                self.executor
                    .execute_with_breaker(key, &self.retry, ctx, breaker, |e: &E| classify(e), operation)
                    .await
            }
            None => self.executor.execute(key, &self.retry, ctx, operation).await,
        }
    }
}

impl<E> Clone for GuardedCall<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            limiter: self.limiter.clone(),
            breaker: self.breaker.clone(),
            retry: self.retry.clone(),
            classify: Arc::clone(&self.classify),
            cost: self.cost,
            executor: self.executor.clone(),
            registry: self.registry.clone(),
        }
    }
}

impl<E> fmt::Debug for GuardedCall<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardedCall")
            .field("name", &self.name)
            .field("limiter", &self.limiter.as_ref().map(|l| l.name()))
            .field("breaker", &self.breaker.as_ref().map(|b| b.name()))
            .field("retry", &self.retry)
            .field("cost", &self.cost)
            .finish_non_exhaustive()
    }
}

/// Builder for [`GuardedCall`], obtained from [`GuardRegistry::call`].
pub struct GuardedCallBuilder<E> {
    registry: GuardRegistry,
    name: Option<String>,
    limiter: Option<SlidingWindowRateLimiter>,
    breaker: Option<CircuitBreaker>,
    retry: Option<RetryPolicy<E>>,
    classify: Option<Classifier<E>>,
    cost: u32,
}

impl<E> GuardedCallBuilder<E> {
    pub(crate) fn new(registry: GuardRegistry) -> Self {
        Self {
            registry,
            name: None,
            limiter: None,
            breaker: None,
            retry: None,
            classify: None,
            cost: 1,
        }
    }

    /// Name used for the call-duration metric. Defaults to the breaker's,
    /// limiter's or retry policy's name, in that order.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn rate_limit(mut self, config: &RateLimiterConfig) -> Self {
        self.limiter = Some(self.registry.rate_limiter(config));
        self
    }

    pub fn circuit_breaker(mut self, config: &CircuitBreakerConfig) -> Self {
        self.breaker = Some(self.registry.circuit_breaker(config));
        self
    }

    /// Without a retry policy every call makes exactly one attempt.
    pub fn retry(mut self, policy: RetryPolicy<E>) -> Self {
        self.retry = Some(policy);
        self
    }

    /// How errors count toward the breaker.
    ///
    /// By default errors the retry policy would retry are
    /// [`Outcome::RetryableFailure`] and all others [`Outcome::FatalFailure`].
    pub fn classify(mut self, classify: impl Fn(&E) -> Outcome + Send + Sync + 'static) -> Self {
        self.classify = Some(Arc::new(classify));
        self
    }

    /// Rate-limit units consumed per call. Defaults to 1.
    pub fn cost(mut self, cost: u32) -> Self {
        self.cost = cost;
        self
    }
}

impl<E: 'static> GuardedCallBuilder<E> {
    pub fn build(self) -> GuardedCall<E> {
        let retry = self.retry.unwrap_or_else(RetryPolicy::none);
        let classify = self.classify.unwrap_or_else(|| {
            let policy = retry.clone();
            Arc::new(move |e: &E| {
                if policy.is_retryable(e) {
                    Outcome::RetryableFailure
                } else {
                    Outcome::FatalFailure
                }
            })
        });
        let name = self
            .name
            .or_else(|| self.breaker.as_ref().map(|b| b.name().to_string()))
            .or_else(|| self.limiter.as_ref().map(|l| l.name().to_string()))
            .unwrap_or_else(|| retry.name().to_string());

        GuardedCall {
            name,
            limiter: self.limiter,
            breaker: self.breaker,
            retry,
            classify,
            cost: self.cost,
            executor: self.registry.retry_executor(),
            registry: self.registry,
        }
    }
}
