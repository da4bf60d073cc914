//! Handlers for the shared dependency cache.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::Json;
use futures::StreamExt;
use scriptgate_core::scripting::cache::{CacheEntryStatus, CleanupReport};
use scriptgate_core::scripting::unit::UnitDescriptor;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

const SECS_PER_DAY: u64 = 86_400;

/// Request body for `POST /dependencies/cache/cleanup`.
#[derive(Debug, Default, Deserialize)]
pub struct CleanupRequest {
    /// Retention threshold; the configured retention when absent.
    pub max_age_days: Option<u64>,
}

/// Request body for `POST /dependencies/install`.
#[derive(Debug, Deserialize)]
pub struct BatchInstallRequest {
    pub unit_ids: Vec<String>,
    #[serde(default)]
    pub force_reinstall: bool,
}

/// Result for one unit of a batch install, in request order.
#[derive(Debug, Serialize)]
pub struct BatchInstallItem {
    pub unit_id: String,
    /// The unit after its pipeline re-ran. Install failures show up in its state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<UnitDescriptor>,
    /// Why the unit could not be retried at all (unknown id).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// GET /dependencies/cache
pub async fn list_cache(State(state): State<AppState>) -> Json<DataResponse<Vec<CacheEntryStatus>>> {
    Json(DataResponse {
        data: state.cache.entries().await,
    })
}

/// POST /dependencies/cache/cleanup
///
/// Entries referenced by any known unit are never removed.
pub async fn cleanup_cache(
    State(state): State<AppState>,
    Json(input): Json<CleanupRequest>,
) -> Json<DataResponse<CleanupReport>> {
    let max_age = input
        .max_age_days
        .map(|days| Duration::from_secs(days.saturating_mul(SECS_PER_DAY)))
        .unwrap_or(state.engine.cache_retention);
    let report = state.cache.cleanup(max_age, state.scanner.as_ref()).await;
    tracing::info!(
        removed = report.removed.len(),
        reclaimed_bytes = report.reclaimed_bytes,
        "Dependency cache cleanup finished"
    );
    Json(DataResponse { data: report })
}

/// POST /dependencies/install
///
/// Retries the listed units concurrently, at most `max_concurrent_installs`
/// at a time; results keep request order.
pub async fn install_batch(
    State(state): State<AppState>,
    Json(input): Json<BatchInstallRequest>,
) -> AppResult<Json<DataResponse<Vec<BatchInstallItem>>>> {
    let mut unit_ids: Vec<String> = Vec::with_capacity(input.unit_ids.len());
    for id in input.unit_ids {
        if !unit_ids.contains(&id) {
            unit_ids.push(id);
        }
    }
    if unit_ids.is_empty() {
        return Err(AppError::BadRequest("unit_ids must not be empty".to_string()));
    }

    let force = input.force_reinstall;
    let results: Vec<BatchInstallItem> = futures::stream::iter(unit_ids)
        .map(|unit_id| {
            let scanner = Arc::clone(&state.scanner);
            async move {
                let (descriptor, error) = match scanner.retry(&unit_id, force).await {
                    Ok(descriptor) => (Some(descriptor), None),
                    Err(e) => (None, Some(e.to_string())),
                };
                BatchInstallItem {
                    unit_id,
                    descriptor,
                    error,
                }
            }
        })
        .buffered(state.engine.max_concurrent_installs)
        .collect()
        .await;

    tracing::info!(
        units = results.len(),
        rejected = results.iter().filter(|r| r.error.is_some()).count(),
        force_reinstall = input.force_reinstall,
        "Batch dependency install finished"
    );
    Ok(Json(DataResponse { data: results }))
}
