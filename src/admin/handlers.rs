use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;

use crate::circuit_breaker::{CircuitSnapshot, CircuitState};
use crate::http::server::AppState;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub upstream: String,
    pub open_circuits: usize,
}

pub async fn get_status(State(state): State<AppState>) -> Json<SystemStatus> {
    let open_circuits = state
        .registry
        .breakers()
        .iter()
        .flat_map(|breaker| breaker.snapshots())
        .filter(|snapshot| snapshot.state != CircuitState::Closed)
        .count();

    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: if open_circuits == 0 { "operational" } else { "degraded" },
        upstream: state.config.upstream.base_url.clone(),
        open_circuits,
    })
}

pub async fn get_circuits(State(state): State<AppState>) -> Json<Vec<CircuitSnapshot>> {
    let snapshots = state
        .registry
        .breakers()
        .iter()
        .flat_map(|breaker| breaker.snapshots())
        .collect();
    Json(snapshots)
}

pub async fn reset_circuit(
    State(state): State<AppState>,
    Path((policy, key)): Path<(String, String)>,
) -> StatusCode {
    let breakers = state.registry.find_breakers(&policy);
    if breakers.is_empty() {
        return StatusCode::NOT_FOUND;
    }
    for breaker in &breakers {
        breaker.reset(&key).await;
    }
    tracing::info!(policy = %policy, key = %key, "Circuit reset via admin API");
    StatusCode::NO_CONTENT
}
