//! Administrative handlers.

use axum::extract::State;
use axum::Json;
use scriptgate_core::scripting::scanner::ScanReport;

use crate::response::DataResponse;
use crate::state::AppState;

/// POST /admin/scan
///
/// Runs one scan cycle now. Waits for an in-progress cycle first.
pub async fn scan(State(state): State<AppState>) -> Json<DataResponse<ScanReport>> {
    let report = state.scanner.scan().await;
    Json(DataResponse { data: report })
}
