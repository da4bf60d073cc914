use axum::routing::post;
use axum::Router;

use crate::handlers::admin;
use crate::state::AppState;

/// Routes mounted at `/admin`.
///
/// ```text
/// POST   /scan                            -> scan
/// ```
pub fn router() -> Router<AppState> {
    Router::new().route("/scan", post(admin::scan))
}
