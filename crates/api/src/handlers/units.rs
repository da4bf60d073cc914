//! Handlers for the unit catalog and the call endpoint.
//!
//! Unit ids are path-derived (`tools/report.py`), so clients percent-encode
//! them into a single path segment.

use std::time::Duration;

use axum::extract::{Path, State};
use axum::Json;
use scriptgate_core::error::CoreError;
use scriptgate_core::scripting::cache::CacheEntryStatus;
use scriptgate_core::scripting::deps::DependencyDeclaration;
use scriptgate_core::scripting::environment::ExecutionEnvironment;
use scriptgate_core::scripting::result::ExecutionResult;
use scriptgate_core::scripting::scanner::CatalogEntry;
use scriptgate_core::scripting::schema::ParameterSchema;
use scriptgate_core::scripting::unit::UnitDescriptor;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Request body for `POST /units/{id}/run`.
#[derive(Debug, Default, Deserialize)]
pub struct RunRequest {
    /// Parameter values keyed by parameter name.
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Per-call deadline; clamped to the configured maximum.
    pub timeout_secs: Option<u64>,
}

/// Request body for `POST /units/{id}/dependencies/install`.
#[derive(Debug, Deserialize)]
pub struct InstallRequest {
    #[serde(default)]
    pub force_reinstall: bool,
}

/// Request body for `PUT /units/{id}/notify`.
#[derive(Debug, Deserialize)]
pub struct NotifyRequest {
    pub enabled: bool,
}

/// A unit's notification setting.
#[derive(Debug, Serialize)]
pub struct NotifySetting {
    pub unit_id: String,
    pub enabled: bool,
}

/// A catalog entry as listed by the management surface.
#[derive(Debug, Serialize)]
pub struct UnitView {
    #[serde(flatten)]
    pub entry: CatalogEntry,
    pub callable: bool,
    /// Whether finished runs are sent to the webhook.
    pub notify: bool,
}

impl UnitView {
    fn new(state: &AppState, entry: &CatalogEntry) -> Self {
        Self {
            callable: entry.is_callable(),
            notify: state.notify.is_enabled(&entry.descriptor.id),
            entry: entry.clone(),
        }
    }
}

/// A unit's dependency declaration and the cache entry it resolves to.
#[derive(Debug, Serialize)]
pub struct UnitDependencies {
    pub unit_id: String,
    pub declaration: DependencyDeclaration,
    pub cache: Option<CacheEntryStatus>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /units
pub async fn list_units(State(state): State<AppState>) -> Json<DataResponse<Vec<UnitView>>> {
    let catalog = state.scanner.catalog();
    let units = catalog.iter().map(|entry| UnitView::new(&state, entry)).collect();
    Json(DataResponse { data: units })
}

/// GET /units/{id}
pub async fn get_unit(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<DataResponse<UnitView>>> {
    let entry = find(&state, &id)?;
    Ok(Json(DataResponse {
        data: UnitView::new(&state, &entry),
    }))
}

/// GET /units/{id}/schema
pub async fn get_schema(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<DataResponse<ParameterSchema>>> {
    let entry = find(&state, &id)?;
    let schema = entry.schema.clone().ok_or_else(|| {
        AppError::Core(CoreError::Conflict(format!(
            "Unit '{id}' has no schema (state: {})",
            entry.descriptor.state.as_str()
        )))
    })?;
    Ok(Json(DataResponse { data: schema }))
}

/// GET /units/{id}/environment
pub async fn get_environment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<DataResponse<ExecutionEnvironment>>> {
    let entry = find(&state, &id)?;
    let env = entry.environment.clone().ok_or_else(|| {
        AppError::Core(CoreError::Conflict(format!(
            "Unit '{id}' has no environment (state: {})",
            entry.descriptor.state.as_str()
        )))
    })?;
    Ok(Json(DataResponse { data: env }))
}

/// POST /units/{id}/run
///
/// Per-unit failures are `200` with a `failure`/`timeout` result; only a
/// host that cannot spawn processes answers `503`.
pub async fn run_unit(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<RunRequest>,
) -> AppResult<Json<DataResponse<ExecutionResult>>> {
    if input.timeout_secs == Some(0) {
        return Err(AppError::BadRequest("timeout_secs must be positive".to_string()));
    }
    let timeout = input.timeout_secs.map(Duration::from_secs);
    let result = state.orchestrator.run(&id, input.params, timeout).await?;
    Ok(Json(DataResponse { data: result }))
}

/// GET /units/{id}/dependencies
pub async fn get_dependencies(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<DataResponse<UnitDependencies>>> {
    let entry = find(&state, &id)?;
    let cache = entry
        .descriptor
        .dependency_digest
        .as_deref()
        .and_then(|digest| state.cache.get(digest))
        .map(|cache_entry| cache_entry.status());
    Ok(Json(DataResponse {
        data: UnitDependencies {
            unit_id: id,
            declaration: entry.declaration.clone(),
            cache,
        },
    }))
}

/// POST /units/{id}/dependencies/install
///
/// Installs the unit's dependency set (again, with `force_reinstall`) and
/// re-runs its pipeline. Install failures land in the returned descriptor.
pub async fn install_dependencies(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<InstallRequest>,
) -> AppResult<Json<DataResponse<UnitDescriptor>>> {
    let descriptor = state.scanner.retry(&id, input.force_reinstall).await?;
    Ok(Json(DataResponse { data: descriptor }))
}

/// PUT /units/{id}/notify
pub async fn set_notify(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<NotifyRequest>,
) -> AppResult<Json<DataResponse<NotifySetting>>> {
    find(&state, &id)?;
    state.notify.set(&id, input.enabled).await?;
    Ok(Json(DataResponse {
        data: NotifySetting {
            unit_id: id,
            enabled: input.enabled,
        },
    }))
}

fn find(state: &AppState, id: &str) -> AppResult<std::sync::Arc<CatalogEntry>> {
    state.scanner.catalog().get(id).cloned().ok_or_else(|| {
        AppError::Core(CoreError::NotFound {
            entity: "Unit",
            id: id.to_string(),
        })
    })
}
