//! Inbound admission control middleware.
//!
//! Runs in front of the forwarding handler. Every request not on an excluded
//! path is charged against the inbound rate limiter under its client key;
//! while the upstream circuit is open, requests are shed before any work is
//! done.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::circuit_breaker::CircuitBreaker;
use crate::clock::Clock;
use crate::config::AdmissionConfig;
use crate::rate_limit::SlidingWindowRateLimiter;

pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

/// The upstream dependency whose circuit gates admission.
#[derive(Debug, Clone)]
pub struct UpstreamGate {
    pub breaker: CircuitBreaker,
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct AdmissionState {
    pub config: Arc<AdmissionConfig>,
    pub limiter: SlidingWindowRateLimiter,
    pub upstream: Option<UpstreamGate>,
    pub clock: Arc<dyn Clock>,
}

pub async fn admission_middleware(
    State(state): State<AdmissionState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !state.config.enabled || is_excluded(&state.config, request.uri().path()) {
        return next.run(request).await;
    }

    let key = client_key(&state.config, &request);
    let decision = state.limiter.try_acquire(&key, 1).await;
    if !decision.allowed {
        return rejection(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            decision.retry_after,
            Some(decision.remaining),
        );
    }

    if state.config.shed_on_open_circuit {
        if let Some(gate) = &state.upstream {
            if let Err(open) = gate.breaker.check(&gate.key).await {
                tracing::debug!(key = %key, upstream = %gate.key, "Shedding request, upstream circuit open");
                return rejection(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "circuit_open",
                    open.retry_after(state.clock.now()),
                    None,
                );
            }
        }
    }

    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    response
}

fn is_excluded(config: &AdmissionConfig, path: &str) -> bool {
    config
        .excluded_paths
        .iter()
        .any(|prefix| path.starts_with(prefix.as_str()))
}

/// Client identity: the configured key header if present, else the peer IP.
fn client_key(config: &AdmissionConfig, request: &Request<Body>) -> String {
    if let Some(value) = header_str(request.headers(), &config.key_header) {
        return value.to_string();
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

/// `Retry-After` in whole seconds, never less than one.
pub fn retry_after_header(retry_after: Duration) -> HeaderValue {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    HeaderValue::from(secs.max(1))
}

/// Fail-fast response with `Retry-After`.
pub fn rejection(
    status: StatusCode,
    error: &'static str,
    retry_after: Duration,
    remaining: Option<u32>,
) -> Response {
    let retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX);
    let mut response = (
        status,
        Json(json!({ "error": error, "retry_after_ms": retry_after_ms })),
    )
        .into_response();
    let headers = response.headers_mut();
    headers.insert(header::RETRY_AFTER, retry_after_header(retry_after));
    if let Some(remaining) = remaining {
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(remaining));
    }
    response
}
