//! Route definitions for the dependency cache.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::dependencies;
use crate::state::AppState;

/// Routes mounted at `/dependencies`.
///
/// ```text
/// GET    /cache                           -> list_cache
/// POST   /cache/cleanup                   -> cleanup_cache
/// POST   /install                         -> install_batch
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/cache", get(dependencies::list_cache))
        .route("/cache/cleanup", post(dependencies::cleanup_cache))
        .route("/install", post(dependencies::install_batch))
}
