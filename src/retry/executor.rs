//! Retry loop.
//!
//! # Data Flow
//! ```text
//! loop:
//!     cancelled / past deadline?      → Cancelled
//!     breaker.acquire(key)            → CircuitOpen (no attempt consumed)
//!     attempt += 1, run operation     (raced against cancellation + deadline)
//!     record outcome on the permit
//!     Ok                              → return value
//!     not retryable                   → Operation(error)
//!     attempts exhausted              → RetryExhausted { attempts, last_error }
//!     delay would pass the deadline   → Cancelled
//!     sleep(delay) via Clock          (raced against cancellation)
//! ```
//!
//! No lock is held while the operation runs or while sleeping.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::circuit_breaker::{CircuitBreaker, Outcome};
use crate::clock::Clock;
use crate::context::CallContext;
use crate::error::GuardError;
use crate::observability::Observer;
use crate::retry::policy::RetryPolicy;

/// Runs operations under a [`RetryPolicy`], optionally through a breaker.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    clock: Arc<dyn Clock>,
    observer: Observer,
}

impl RetryExecutor {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_observer(clock, Observer::default())
    }

    pub fn with_observer(clock: Arc<dyn Clock>, observer: Observer) -> Self {
        Self { clock, observer }
    }

    /// Retry `operation` per `policy`.
    pub async fn execute<T, E, F, Fut>(
        &self,
        key: &str,
        policy: &RetryPolicy<E>,
        ctx: &CallContext,
        operation: F,
    ) -> Result<T, GuardError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.run(key, policy, ctx, None::<(&CircuitBreaker, &fn(&E) -> Outcome)>, operation)
            .await
    }

    /// Retry `operation` per `policy`, consulting `breaker` before every attempt.
    ///
    /// An open circuit ends the loop at once with [`GuardError::CircuitOpen`],
    /// whether on the first attempt or mid-sequence.
    pub async fn execute_with_breaker<T, E, F, Fut, C>(
        &self,
        key: &str,
        policy: &RetryPolicy<E>,
        ctx: &CallContext,
        breaker: &CircuitBreaker,
        classify: C,
        operation: F,
    ) -> Result<T, GuardError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> Outcome,
        E: fmt::Display,
    {
        self.run(key, policy, ctx, Some((breaker, &classify)), operation)
            .await
    }

    async fn run<T, E, F, Fut, C>(
        &self,
        key: &str,
        policy: &RetryPolicy<E>,
        ctx: &CallContext,
        breaker: Option<(&CircuitBreaker, &C)>,
        mut operation: F,
    ) -> Result<T, GuardError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> Outcome,
        E: fmt::Display,
    {
        let mut attempt = 0u32;

        loop {
            if ctx.is_done(self.clock.now()) {
                return Err(GuardError::Cancelled);
            }

            let permit = match breaker {
                Some((breaker, _)) => Some(breaker.acquire(key).await?),
                None => None,
            };
            attempt += 1;

            // Dropping an unrecorded permit on cancellation frees its trial slot.
            let result = tokio::select! {
                biased;
                result = operation() => result,
                _ = ctx.cancelled() => {
                    tracing::debug!(policy = policy.name(), key = %key, attempt, "Call cancelled in flight");
                    return Err(GuardError::Cancelled);
                }
                _ = self.deadline(ctx) => {
                    tracing::debug!(policy = policy.name(), key = %key, attempt, "Deadline passed in flight");
                    return Err(GuardError::Cancelled);
                }
            };

            let error = match result {
                Ok(value) => {
                    if let Some(permit) = permit {
                        permit.record(Outcome::Success).await;
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if let (Some(permit), Some((_, classify))) = (permit, breaker) {
                permit.record(classify(&error)).await;
            }

            if !policy.is_retryable(&error) {
                tracing::debug!(policy = policy.name(), key = %key, attempt, error = %error, "Error is not retryable");
                return Err(GuardError::Operation(error));
            }

            if attempt >= policy.max_attempts() {
                self.observer
                    .retry_exhausted(policy.name(), key, attempt, &error);
                return Err(GuardError::RetryExhausted {
                    attempts: attempt,
                    last_error: error,
                });
            }

            let delay = policy.delay_for(attempt);
            if ctx
                .deadline()
                .is_some_and(|deadline| self.clock.now() + delay > deadline)
            {
                tracing::debug!(policy = policy.name(), key = %key, attempt, delay = ?delay, "Next retry would pass the deadline");
                return Err(GuardError::Cancelled);
            }

            self.observer
                .retry_scheduled(policy.name(), key, attempt, delay);
            tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(GuardError::Cancelled),
                _ = self.clock.sleep(delay) => {}
            }
        }
    }

    /// Resolves when the context's deadline passes; never without one.
    async fn deadline(&self, ctx: &CallContext) {
        match ctx.deadline() {
            Some(deadline) => self.clock.sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}
