//! Route definitions for in-flight executions.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::executions;
use crate::state::AppState;

/// Routes mounted at `/executions`.
///
/// ```text
/// GET    /running                         -> list_running
/// POST   /{id}/terminate                  -> terminate
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/running", get(executions::list_running))
        .route("/{id}/terminate", post(executions::terminate))
}
