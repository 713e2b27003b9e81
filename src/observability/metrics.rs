//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gatekeeper_rate_limit_admitted_total` (counter): admitted calls by policy
//! - `gatekeeper_rate_limit_rejections_total` (counter): rejected calls by policy
//! - `gatekeeper_circuit_transitions_total` (counter): transitions by policy, target state
//! - `gatekeeper_circuit_rejections_total` (counter): fail-fast rejections by policy
//! - `gatekeeper_retry_attempts_total` (counter): retries scheduled by policy
//! - `gatekeeper_retry_exhausted_total` (counter): exhausted retry budgets by policy
//! - `gatekeeper_store_errors_total` (counter): shared-store failures by component
//! - `gatekeeper_call_duration_seconds` (histogram): guarded call latency by policy, outcome
//!
//! # Design Decisions
//! - Guards report through the [`MetricsSink`] trait, never the facade directly
//! - [`FacadeSink`] forwards to the `metrics` crate; the Prometheus exporter
//!   is installed once by the binary
//! - Labels are low-cardinality: policy names and outcomes, never keys

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, histogram, Label};
use metrics_exporter_prometheus::PrometheusBuilder;

pub const RATE_LIMIT_ADMITTED: &str = "gatekeeper_rate_limit_admitted_total";
pub const RATE_LIMIT_REJECTIONS: &str = "gatekeeper_rate_limit_rejections_total";
pub const CIRCUIT_TRANSITIONS: &str = "gatekeeper_circuit_transitions_total";
pub const CIRCUIT_REJECTIONS: &str = "gatekeeper_circuit_rejections_total";
pub const RETRY_ATTEMPTS: &str = "gatekeeper_retry_attempts_total";
pub const RETRY_EXHAUSTED: &str = "gatekeeper_retry_exhausted_total";
pub const STORE_ERRORS: &str = "gatekeeper_store_errors_total";
pub const CALL_DURATION: &str = "gatekeeper_call_duration_seconds";

/// Tags attached to a metric sample.
pub type Tags<'a> = &'a [(&'static str, &'a str)];

/// Destination for guard metrics.
pub trait MetricsSink: Send + Sync + std::fmt::Debug {
    fn record_count(&self, name: &'static str, tags: Tags<'_>);

    fn record_duration(&self, name: &'static str, value: Duration, tags: Tags<'_>);
}

/// Forwards to the global `metrics` recorder.
#[derive(Debug, Default, Clone, Copy)]
pub struct FacadeSink;

fn labels(tags: Tags<'_>) -> Vec<Label> {
    tags.iter()
        .map(|(k, v)| Label::new(*k, v.to_string()))
        .collect()
}

impl MetricsSink for FacadeSink {
    fn record_count(&self, name: &'static str, tags: Tags<'_>) {
        counter!(name, labels(tags)).increment(1);
    }

    fn record_duration(&self, name: &'static str, value: Duration, tags: Tags<'_>) {
        histogram!(name, labels(tags)).record(value.as_secs_f64());
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn record_count(&self, _name: &'static str, _tags: Tags<'_>) {}

    fn record_duration(&self, _name: &'static str, _value: Duration, _tags: Tags<'_>) {}
}

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), metrics_exporter_prometheus::BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!(address = %addr, "Prometheus metrics exporter listening");
    Ok(())
}
