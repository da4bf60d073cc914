pub mod admin;
pub mod dependencies;
pub mod executions;
pub mod health;
pub mod units;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /units                                   catalog snapshot
/// /units/{id}                              one unit
/// /units/{id}/schema                       parameter schema
/// /units/{id}/run                          call (POST)
/// /units/{id}/environment                  execution environment
/// /units/{id}/dependencies                 declaration + cache entry
/// /units/{id}/dependencies/install         install, re-run pipeline (POST)
///
/// /executions/running                      in-flight executions
/// /executions/{id}/terminate               terminate (POST)
///
/// /admin/scan                              on-demand scan (POST)
///
/// /dependencies/cache                      cache entries
/// /dependencies/cache/cleanup              age-based cleanup (POST)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/units", units::router())
        .nest("/executions", executions::router())
        .nest("/admin", admin::router())
        .nest("/dependencies", dependencies::router())
}
