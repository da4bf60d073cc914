use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// Overall service status.
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    /// Units known to the current catalog.
    pub units: usize,
    /// Units that can be called right now.
    pub callable_units: usize,
    /// Executions in flight.
    pub running_executions: usize,
}

/// GET /health -- returns service status and catalog counts.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let catalog = state.scanner.catalog();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        units: catalog.len(),
        callable_units: catalog.callable().count(),
        running_executions: state.supervisor.running().len(),
    })
}

/// Mount health check routes (intended for root-level, NOT under `/api/v1`).
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
