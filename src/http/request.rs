//! Request identification.
//!
//! # Responsibilities
//! - Generate a UUID v4 request ID for requests that arrive without one
//! - Expose the header name shared by the layers and the forwarder
//!
//! # Design Decisions
//! - Request ID added as early as possible for tracing
//! - An incoming `x-request-id` is kept, so IDs survive chained gateways

use axum::http::{HeaderValue, Request};
use tower_http::request_id::{MakeRequestId, RequestId};
use uuid::Uuid;

/// Header carrying the request ID.
pub const X_REQUEST_ID: &str = "x-request-id";

/// Generates UUID v4 request IDs for `SetRequestIdLayer`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MakeRequestUuidV4;

impl MakeRequestId for MakeRequestUuidV4 {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&Uuid::new_v4().to_string())
            .ok()
            .map(RequestId::new)
    }
}

/// The request ID attached to `request`, or `"unknown"`.
pub fn request_id<B>(request: &Request<B>) -> String {
    request
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string()
}
