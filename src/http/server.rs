//! Gateway server.
//!
//! # Responsibilities
//! - Create the Axum router and wire up middleware (tracing, timeout, request ID)
//! - Apply inbound admission control (rate limit, upstream circuit shedding)
//! - Forward requests to the upstream through an outbound guarded call
//!   (circuit breaker + retry)
//! - Map guard errors to HTTP responses
//! - Serve until the shutdown signal fires

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, request::Parts, HeaderName, HeaderValue, Request, StatusCode, Uri},
    middleware,
    response::{IntoResponse, Response},
    routing::{any, get},
    Router,
};
use hyper::body::Incoming;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::{
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::admin::setup_admin_router;
use crate::circuit_breaker::Outcome;
use crate::clock::Timestamp;
use crate::config::GatekeeperConfig;
use crate::context::CallContext;
use crate::error::GuardError;
use crate::guard::{GuardRegistry, GuardedCall};
use crate::http::admission::{admission_middleware, rejection, AdmissionState, UpstreamGate};
use crate::http::request::{request_id, MakeRequestUuidV4, X_REQUEST_ID};
use crate::retry::RetryPolicy;

/// Headers that describe the inbound connection, not the request.
static HOP_BY_HOP: [HeaderName; 7] = [
    header::HOST,
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::TE,
    header::TRAILER,
    header::PROXY_AUTHORIZATION,
];

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid upstream url '{url}': {reason}")]
    InvalidUpstream { url: String, reason: String },
}

/// Failure of one forwarded attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream transport error: {0}")]
    Transport(String),

    #[error("upstream responded with {0}")]
    Status(StatusCode),

    #[error("request could not be forwarded: {0}")]
    InvalidRequest(String),
}

impl UpstreamError {
    /// Statuses that mean the upstream (or something in front of it) is struggling.
    pub fn is_retryable_status(status: StatusCode) -> bool {
        matches!(
            status,
            StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
        )
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status(status) => Self::is_retryable_status(*status),
            Self::InvalidRequest(_) => false,
        }
    }

    /// Requests we could not even build say nothing about upstream health.
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::InvalidRequest(_) => Outcome::Ignored,
            _ => Outcome::RetryableFailure,
        }
    }
}

/// Where requests are forwarded to.
#[derive(Debug, Clone)]
pub struct Upstream {
    authority: String,
    base_path: String,
}

impl Upstream {
    pub fn parse(base_url: &str) -> Result<Self, ServerError> {
        let invalid = |reason: String| ServerError::InvalidUpstream {
            url: base_url.to_string(),
            reason,
        };

        let url = url::Url::parse(base_url).map_err(|e| invalid(e.to_string()))?;
        if url.scheme() != "http" {
            return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
        }
        let host = url
            .host_str()
            .ok_or_else(|| invalid("missing host".to_string()))?;
        let authority = match url.port_or_known_default() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        Ok(Self {
            authority,
            base_path: url.path().trim_end_matches('/').to_string(),
        })
    }

    /// Circuit breaker key for this upstream.
    pub fn key(&self) -> &str {
        &self.authority
    }

    pub fn uri_for(&self, uri: &Uri) -> Result<Uri, UpstreamError> {
        let path_and_query = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        Uri::builder()
            .scheme("http")
            .authority(self.authority.as_str())
            .path_and_query(format!("{}{}", self.base_path, path_and_query))
            .build()
            .map_err(|e| UpstreamError::InvalidRequest(e.to_string()))
    }
}

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatekeeperConfig>,
    pub registry: GuardRegistry,
    pub client: Client<HttpConnector, Body>,
    pub upstream: Arc<Upstream>,
    /// Outbound call for requests that may be retried.
    pub retrying: GuardedCall<UpstreamError>,
    /// Outbound call making a single attempt.
    pub single: GuardedCall<UpstreamError>,
}

/// HTTP gateway guarding one upstream.
pub struct GatewayServer {
    router: Router,
    config: Arc<GatekeeperConfig>,
    registry: GuardRegistry,
}

impl GatewayServer {
    pub fn new(config: GatekeeperConfig, registry: GuardRegistry) -> Result<Self, ServerError> {
        let config = Arc::new(config);
        let upstream = Arc::new(Upstream::parse(&config.upstream.base_url)?);

        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        let outbound = |policy: RetryPolicy<UpstreamError>| {
            registry
                .call()
                .name("upstream")
                .circuit_breaker(&config.circuit_breaker)
                .retry(policy)
                .classify(UpstreamError::outcome)
                .build()
        };
        let retrying = outbound(RetryPolicy::new(config.retry.clone(), UpstreamError::is_retryable));
        let single = outbound(RetryPolicy::none());

        let admission = AdmissionState {
            config: Arc::new(config.admission.clone()),
            limiter: registry.rate_limiter(&config.rate_limit),
            upstream: Some(UpstreamGate {
                breaker: registry.circuit_breaker(&config.circuit_breaker),
                key: upstream.key().to_string(),
            }),
            clock: registry.clock().clone(),
        };

        let state = AppState {
            config: config.clone(),
            registry: registry.clone(),
            client,
            upstream,
            retrying,
            single,
        };

        let router = Self::build_router(&config, state, admission);
        Ok(Self {
            router,
            config,
            registry,
        })
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(config: &GatekeeperConfig, state: AppState, admission: AdmissionState) -> Router {
        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route("/", any(forward_handler))
            .route("/{*path}", any(forward_handler))
            .with_state(state.clone())
            .layer(middleware::from_fn_with_state(admission, admission_middleware));

        if config.admin.enabled {
            router = router.merge(setup_admin_router(state));
        }

        router
            .layer(TimeoutLayer::new(Duration::from_secs(config.listener.request_timeout_secs)))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuidV4))
    }

    pub fn config(&self) -> &GatekeeperConfig {
        &self.config
    }

    pub fn registry(&self) -> &GuardRegistry {
        &self.registry
    }

    /// Serve on `listener` until `shutdown` fires.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            upstream = %self.config.upstream.base_url,
            "Gateway starting"
        );

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Shutdown signal received");
            })
            .await?;

        tracing::info!("Gateway stopped");
        Ok(())
    }
}

async fn health_handler() -> &'static str {
    "OK"
}

/// Forward one request to the upstream through the outbound guarded call.
async fn forward_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let request_id = request_id(&request);
    let (parts, body) = request.into_parts();

    tracing::debug!(
        request_id = %request_id,
        method = %parts.method,
        path = %parts.uri.path(),
        "Forwarding request"
    );

    let body = match axum::body::to_bytes(body, state.config.listener.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(request_id = %request_id, error = %e, "Request body rejected");
            return (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response();
        }
    };
    let uri = match state.upstream.uri_for(&parts.uri) {
        Ok(uri) => uri,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let retry = parts.method.is_idempotent() || !state.config.upstream.retry_idempotent_only;
    let call = if retry { &state.retrying } else { &state.single };

    let clock = state.registry.clock();
    let timeout = Duration::from_secs(state.config.listener.request_timeout_secs);
    let ctx = CallContext::new().with_timeout(clock.as_ref(), timeout);

    let result = call
        .call_with(state.upstream.key(), &ctx, || {
            let request = upstream_request(&parts, &uri, &body, &request_id);
            let client = state.client.clone();
            async move { send(&client, request?).await }
        })
        .await;

    match result {
        Ok(response) => {
            let (parts, body) = response.into_parts();
            Response::from_parts(parts, Body::new(body))
        }
        Err(error) => {
            tracing::warn!(request_id = %request_id, error = %error, "Upstream call failed");
            error_response(&error, clock.now())
        }
    }
}

async fn send(
    client: &Client<HttpConnector, Body>,
    request: Request<Body>,
) -> Result<hyper::Response<Incoming>, UpstreamError> {
    let response = client
        .request(request)
        .await
        .map_err(|e| UpstreamError::Transport(e.to_string()))?;
    let status = response.status();
    if UpstreamError::is_retryable_status(status) {
        return Err(UpstreamError::Status(status));
    }
    Ok(response)
}

/// Build one attempt's request; called again for every retry.
fn upstream_request(
    parts: &Parts,
    uri: &Uri,
    body: &Bytes,
    request_id: &str,
) -> Result<Request<Body>, UpstreamError> {
    let mut builder = Request::builder().method(parts.method.clone()).uri(uri.clone());

    if let Some(headers) = builder.headers_mut() {
        for (name, value) in parts.headers.iter() {
            if !HOP_BY_HOP.contains(name) {
                headers.append(name.clone(), value.clone());
            }
        }
        if let Ok(value) = HeaderValue::from_str(request_id) {
            headers.insert(X_REQUEST_ID, value);
        }
    }

    builder
        .body(Body::from(body.clone()))
        .map_err(|e| UpstreamError::InvalidRequest(e.to_string()))
}

/// Map a guard error to the response sent to the client.
fn error_response(error: &GuardError<UpstreamError>, now: Timestamp) -> Response {
    match error {
        GuardError::RateLimitExceeded { retry_after, .. } => rejection(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            *retry_after,
            None,
        ),
        GuardError::CircuitOpen(open) => rejection(
            StatusCode::SERVICE_UNAVAILABLE,
            "circuit_open",
            open.retry_after(now),
            None,
        ),
        GuardError::Cancelled => {
            (StatusCode::GATEWAY_TIMEOUT, "Upstream deadline exceeded").into_response()
        }
        GuardError::RetryExhausted { last_error, .. } | GuardError::Operation(last_error) => {
            match last_error {
                UpstreamError::Status(status) => {
                    (*status, "Upstream request failed").into_response()
                }
                UpstreamError::Transport(_) => {
                    (StatusCode::BAD_GATEWAY, "Upstream request failed").into_response()
                }
                UpstreamError::InvalidRequest(reason) => {
                    (StatusCode::BAD_REQUEST, reason.clone()).into_response()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitOpenError, CircuitOpenReason};

    #[test]
    fn test_upstream_parse() {
        let upstream = Upstream::parse("http://127.0.0.1:3000/api/").unwrap();
        assert_eq!(upstream.key(), "127.0.0.1:3000");

        let uri: Uri = "/users?id=7".parse().unwrap();
        assert_eq!(
            upstream.uri_for(&uri).unwrap().to_string(),
            "http://127.0.0.1:3000/api/users?id=7"
        );

        let default_port = Upstream::parse("http://backend.internal").unwrap();
        assert_eq!(default_port.key(), "backend.internal:80");

        assert!(Upstream::parse("https://secure.example").is_err());
        assert!(Upstream::parse("not a url").is_err());
    }

    #[test]
    fn test_upstream_error_classification() {
        assert!(UpstreamError::Transport("refused".into()).is_retryable());
        assert!(UpstreamError::Status(StatusCode::SERVICE_UNAVAILABLE).is_retryable());
        assert!(!UpstreamError::Status(StatusCode::INTERNAL_SERVER_ERROR).is_retryable());
        assert!(!UpstreamError::InvalidRequest("bad".into()).is_retryable());
        assert_eq!(UpstreamError::InvalidRequest("bad".into()).outcome(), Outcome::Ignored);
    }

    #[test]
    fn test_error_mapping() {
        let now = Timestamp::from_millis(1_000);
        let open = GuardError::CircuitOpen(CircuitOpenError {
            key: "127.0.0.1:3000".into(),
            next_probe_time: Timestamp::from_millis(11_000),
            failure_count: 5,
            reason: CircuitOpenReason::Open,
        });
        let response = error_response(&open, now);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "10");

        let exhausted = GuardError::RetryExhausted {
            attempts: 3,
            last_error: UpstreamError::Status(StatusCode::BAD_GATEWAY),
        };
        assert_eq!(error_response(&exhausted, now).status(), StatusCode::BAD_GATEWAY);

        let transport = GuardError::Operation(UpstreamError::Transport("reset".into()));
        assert_eq!(error_response(&transport, now).status(), StatusCode::BAD_GATEWAY);

        let cancelled: GuardError<UpstreamError> = GuardError::Cancelled;
        assert_eq!(error_response(&cancelled, now).status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_hop_by_hop_headers_are_dropped() {
        let (parts, _) = Request::builder()
            .uri("/x")
            .header(header::HOST, "gateway")
            .header(header::CONNECTION, "keep-alive")
            .header("x-api-key", "alice")
            .body(())
            .unwrap()
            .into_parts();
        let uri: Uri = "http://127.0.0.1:3000/x".parse().unwrap();
        let request = upstream_request(&parts, &uri, &Bytes::new(), "req-1").unwrap();
        assert!(request.headers().get(header::HOST).is_none());
        assert!(request.headers().get(header::CONNECTION).is_none());
        assert_eq!(request.headers()["x-api-key"], "alice");
        assert_eq!(request.headers()[X_REQUEST_ID], "req-1");
    }
}
