//! Handlers for in-flight executions.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use scriptgate_core::scripting::supervisor::RunningExecution;
use uuid::Uuid;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

/// GET /executions/running
pub async fn list_running(
    State(state): State<AppState>,
) -> Json<DataResponse<Vec<RunningExecution>>> {
    Json(DataResponse {
        data: state.supervisor.running(),
    })
}

/// POST /executions/{id}/terminate
///
/// The caller waiting on the execution receives a `terminated` failure.
pub async fn terminate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    state.supervisor.terminate(id)?;
    Ok(StatusCode::ACCEPTED)
}
