//! Library-level composition tests: limiter, breaker and retry together.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gatekeeper::circuit_breaker::{CircuitState, Outcome};
use gatekeeper::clock::ManualClock;
use gatekeeper::config::{CircuitBreakerConfig, RateLimiterConfig, RetryConfig};
use gatekeeper::observability::GuardEvent;
use gatekeeper::retry::{Jitter, RetryPolicy};
use gatekeeper::{CallContext, GuardError, GuardRegistry};
use tokio_util::sync::CancellationToken;

#[derive(Debug, PartialEq, thiserror::Error)]
enum BackendError {
    #[error("connection refused")]
    Refused,
    #[error("not found")]
    NotFound,
}

fn setup() -> (Arc<ManualClock>, GuardRegistry) {
    let clock = Arc::new(ManualClock::new());
    let registry = GuardRegistry::new(clock.clone());
    (clock, registry)
}

fn no_retry() -> RetryPolicy<BackendError> {
    RetryPolicy::none()
}

#[tokio::test]
async fn test_sixty_first_request_is_rejected_until_window_passes() {
    let (clock, registry) = setup();
    let mut events = registry.subscribe();
    let limits = RateLimiterConfig::per_minute(60);
    let circuit = CircuitBreakerConfig::default();

    for i in 0..60 {
        clock.advance(Duration::from_millis(500));
        let result = registry
            .guarded_call("client", move || async move { Ok::<_, BackendError>(i) }, &limits, &circuit, &no_retry())
            .await;
        assert_eq!(result.unwrap(), i);
    }

    let rejected = registry
        .guarded_call("client", || async { Ok::<_, BackendError>(()) }, &limits, &circuit, &no_retry())
        .await;
    match rejected {
        Err(GuardError::RateLimitExceeded { retry_after, .. }) => assert!(retry_after > Duration::ZERO),
        other => panic!("expected RateLimitExceeded, got {other:?}"),
    }
    assert!(matches!(events.try_recv(), Ok(GuardEvent::RateLimited { current_count: 60, .. })));

    clock.advance(Duration::from_secs(60));
    let admitted = registry
        .guarded_call("client", || async { Ok::<_, BackendError>(()) }, &limits, &circuit, &no_retry())
        .await;
    assert!(admitted.is_ok());
}

#[tokio::test]
async fn test_circuit_lifecycle_through_guarded_calls() {
    let (clock, registry) = setup();
    let limits = RateLimiterConfig::per_minute(1_000);
    let circuit = CircuitBreakerConfig {
        failure_threshold: 5,
        success_threshold: 1,
        recovery_timeout_ms: 30_000,
        ..Default::default()
    };
    let calls = AtomicU32::new(0);
    let calls = &calls;

    for _ in 0..5 {
        let _ = registry
            .guarded_call(
                "db",
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(BackendError::Refused)
                },
                &limits,
                &circuit,
                &no_retry(),
            )
            .await;
    }
    let breaker = registry.circuit_breaker(&circuit);
    assert_eq!(breaker.state("db").await, CircuitState::Open);

    // Still open one millisecond before the recovery timeout.
    clock.advance(Duration::from_millis(29_999));
    let blocked = registry
        .guarded_call(
            "db",
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BackendError>(())
            },
            &limits,
            &circuit,
            &no_retry(),
        )
        .await;
    assert!(matches!(blocked, Err(GuardError::CircuitOpen(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    clock.advance(Duration::from_millis(1));
    let probe = registry
        .guarded_call("db", || async { Ok::<_, BackendError>(()) }, &limits, &circuit, &no_retry())
        .await;
    assert!(probe.is_ok());

    let snapshot = breaker.snapshot("db").await.unwrap();
    assert_eq!(snapshot.state, CircuitState::Closed);
    assert_eq!(snapshot.failure_count, 0);
}

#[tokio::test]
async fn test_exhausted_retries_keep_last_error() {
    let (clock, registry) = setup();
    let retry = RetryPolicy::new(
        RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            jitter: Jitter::None,
            ..Default::default()
        },
        |e| *e == BackendError::Refused,
    );
    let call = registry
        .call()
        .circuit_breaker(&CircuitBreakerConfig::default())
        .retry(retry)
        .build();

    let result: Result<(), _> = call.call("db", || async { Err(BackendError::Refused) }).await;
    let error = result.unwrap_err();
    assert!(matches!(error, GuardError::RetryExhausted { attempts: 3, .. }));
    assert_eq!(error.into_operation_error(), Some(BackendError::Refused));
    assert_eq!(clock.sleeps(), vec![Duration::from_secs(1), Duration::from_secs(2)]);
}

#[tokio::test]
async fn test_breaker_opening_mid_retry_stops_attempts() {
    let (_, registry) = setup();
    let call = registry
        .call()
        .circuit_breaker(&CircuitBreakerConfig {
            failure_threshold: 2,
            ..Default::default()
        })
        .retry(RetryPolicy::always(RetryConfig {
            max_attempts: 10,
            base_delay_ms: 10,
            jitter: Jitter::None,
            ..Default::default()
        }))
        .build();
    let calls = AtomicU32::new(0);
    let calls = &calls;

    let result: Result<(), _> = call
        .call("db", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(BackendError::Refused)
        })
        .await;
    assert!(matches!(result, Err(GuardError::CircuitOpen(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_excluded_errors_do_not_trip() {
    let (_, registry) = setup();
    let call = registry
        .call()
        .circuit_breaker(&CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        })
        .classify(|e: &BackendError| match e {
            BackendError::NotFound => Outcome::Ignored,
            BackendError::Refused => Outcome::RetryableFailure,
        })
        .build();

    for _ in 0..10 {
        let result: Result<(), _> = call.call("users", || async { Err(BackendError::NotFound) }).await;
        assert!(matches!(result, Err(GuardError::Operation(BackendError::NotFound))));
    }
    assert_eq!(call.circuit_breaker().unwrap().state("users").await, CircuitState::Closed);
}

#[tokio::test]
async fn test_cancellation_abandons_retries() {
    let (clock, registry) = setup();
    let call = registry
        .call()
        .retry(RetryPolicy::always(RetryConfig {
            max_attempts: 5,
            jitter: Jitter::None,
            ..Default::default()
        }))
        .build();
    let token = CancellationToken::new();
    let ctx = CallContext::new().with_cancellation(token.clone());
    let calls = AtomicU32::new(0);
    let calls = &calls;

    let result: Result<(), _> = call
        .call_with("db", &ctx, move || {
            let token = token.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 1 {
                    token.cancel();
                }
                Err(BackendError::Refused)
            }
        })
        .await;

    assert!(matches!(result, Err(GuardError::Cancelled)));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(clock.sleeps().len(), 1);
}

#[tokio::test]
async fn test_keys_are_independent() {
    let (_, registry) = setup();
    let limits = RateLimiterConfig::per_minute(1);
    let circuit = CircuitBreakerConfig::default();

    for key in ["a", "b", "c"] {
        let result = registry
            .guarded_call(key, || async { Ok::<_, BackendError>(()) }, &limits, &circuit, &no_retry())
            .await;
        assert!(result.is_ok());
    }
    let again = registry
        .guarded_call("a", || async { Ok::<_, BackendError>(()) }, &limits, &circuit, &no_retry())
        .await;
    assert!(again.unwrap_err().is_fail_fast());
}

#[tokio::test]
async fn test_concurrent_calls_share_one_budget() {
    let (_, registry) = setup();
    let limits = RateLimiterConfig::per_minute(25);
    let circuit = CircuitBreakerConfig::default();

    let calls = (0..100).map(|_| {
        let registry = registry.clone();
        let limits = limits.clone();
        let circuit = circuit.clone();
        async move {
            registry
                .guarded_call("shared", || async { Ok::<_, BackendError>(()) }, &limits, &circuit, &no_retry())
                .await
        }
    });
    let results = futures_util::future::join_all(calls).await;

    let admitted = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(admitted, 25);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, GuardError::RateLimitExceeded { .. })));
}
