//! Route definitions for the unit catalog and call endpoint.

use axum::routing::{get, post, put};
use axum::Router;

use crate::handlers::units;
use crate::state::AppState;

/// Routes mounted at `/units`.
///
/// ```text
/// GET    /                                -> list_units
/// GET    /{id}                            -> get_unit
/// GET    /{id}/schema                     -> get_schema
/// POST   /{id}/run                        -> run_unit
/// GET    /{id}/environment                -> get_environment
/// GET    /{id}/dependencies               -> get_dependencies
/// POST   /{id}/dependencies/install       -> install_dependencies
/// PUT    /{id}/notify                     -> set_notify
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(units::list_units))
        .route("/{id}", get(units::get_unit))
        .route("/{id}/schema", get(units::get_schema))
        .route("/{id}/run", post(units::run_unit))
        .route("/{id}/environment", get(units::get_environment))
        .route("/{id}/dependencies", get(units::get_dependencies))
        .route(
            "/{id}/dependencies/install",
            post(units::install_dependencies),
        )
        .route("/{id}/notify", put(units::set_notify))
}
