//! Call path for script executions.
//!
//! Coordinates catalog lookup, supervised execution and run-event
//! publication. Held in [`AppState`](crate::state::AppState) as an
//! `Arc<RunOrchestrator>`.

use std::sync::Arc;
use std::time::Duration;

use scriptgate_core::config::EngineConfig;
use scriptgate_core::error::CoreError;
use scriptgate_core::scripting::result::{ExecutionRequest, ExecutionResult, FailureKind};
use scriptgate_core::scripting::scanner::{CatalogEntry, UnitScanner};
use scriptgate_core::scripting::supervisor::ExecutionSupervisor;
use scriptgate_events::{EventBus, RunEvent};
use serde_json::{Map, Value};

use crate::error::{AppError, AppResult};

/// Runs callable units on behalf of API callers.
///
/// Manages the call lifecycle:
/// 1. Look the unit up in the current catalog snapshot.
/// 2. Refuse units that are not callable.
/// 3. Clamp the caller's deadline and hand off to the supervisor.
/// 4. Fold spawn failures back into unit state through the scanner.
/// 5. Publish one run event per result.
pub struct RunOrchestrator {
    config: Arc<EngineConfig>,
    scanner: Arc<UnitScanner>,
    supervisor: Arc<ExecutionSupervisor>,
    event_bus: Arc<EventBus>,
}

impl RunOrchestrator {
    pub fn new(
        config: Arc<EngineConfig>,
        scanner: Arc<UnitScanner>,
        supervisor: Arc<ExecutionSupervisor>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            scanner,
            supervisor,
            event_bus,
        }
    }

    /// Run `unit_id` with `parameters`.
    ///
    /// Per-unit outcomes (validation, exit status, output contract, timeout)
    /// come back as `Ok`; only lookup failures and host exhaustion are `Err`.
    pub async fn run(
        &self,
        unit_id: &str,
        parameters: Map<String, Value>,
        timeout: Option<Duration>,
    ) -> AppResult<ExecutionResult> {
        let entry = self.callable(unit_id)?;
        let (Some(schema), Some(env)) = (&entry.schema, &entry.environment) else {
            return Err(not_ready(&entry));
        };

        let deadline = self.config.effective_deadline(timeout);
        let request = ExecutionRequest::new(unit_id, parameters, deadline);
        let result = self
            .supervisor
            .execute(&request, &entry.descriptor, schema, env)
            .await?;

        if let ExecutionResult::Failure {
            kind: FailureKind::SpawnFailed,
            message,
            ..
        } = &result
        {
            self.scanner.report_failure(unit_id, message);
        }

        tracing::debug!(
            unit_id,
            outcome = result.outcome(),
            "Publishing run event"
        );
        self.event_bus.publish(RunEvent::new(unit_id, &result));
        Ok(result)
    }

    /// Current catalog entry for `unit_id`, if it can be called.
    pub fn callable(&self, unit_id: &str) -> AppResult<Arc<CatalogEntry>> {
        let catalog = self.scanner.catalog();
        let entry = catalog.get(unit_id).cloned().ok_or_else(|| {
            AppError::Core(CoreError::NotFound {
                entity: "Unit",
                id: unit_id.to_string(),
            })
        })?;
        if !entry.is_callable() {
            return Err(not_ready(&entry));
        }
        Ok(entry)
    }
}

fn not_ready(entry: &CatalogEntry) -> AppError {
    let detail = entry
        .error
        .as_ref()
        .map(|e| format!(": {e}"))
        .unwrap_or_default();
    AppError::Core(CoreError::Conflict(format!(
        "Unit '{}' is {}{detail}",
        entry.descriptor.id,
        entry.descriptor.state.as_str()
    )))
}
