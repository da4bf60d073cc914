use std::sync::Arc;

use scriptgate_core::config::EngineConfig;
use scriptgate_core::scripting::cache::DependencyCache;
use scriptgate_core::scripting::scanner::UnitScanner;
use scriptgate_core::scripting::supervisor::ExecutionSupervisor;
use scriptgate_events::{EventBus, NotifySubscriptions};

use crate::config::ServerConfig;
use crate::scripting::orchestrator::RunOrchestrator;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc`).
#[derive(Clone)]
pub struct AppState {
    /// Server configuration (bind address, CORS, request timeout).
    pub config: Arc<ServerConfig>,
    /// Resolved engine configuration.
    pub engine: Arc<EngineConfig>,
    /// Unit scanner; owner of unit state and the published catalog.
    pub scanner: Arc<UnitScanner>,
    /// Content-addressed dependency cache.
    pub cache: Arc<DependencyCache>,
    /// Subprocess supervisor (running list, termination).
    pub supervisor: Arc<ExecutionSupervisor>,
    /// Call path: catalog lookup, execution, run events.
    pub orchestrator: Arc<RunOrchestrator>,
    /// Event bus carrying one run event per call.
    pub event_bus: Arc<EventBus>,
    /// Units whose runs are sent to the webhook.
    pub notify: Arc<NotifySubscriptions>,
}

impl AppState {
    /// Wire the engine components together.
    pub fn new(
        config: ServerConfig,
        engine: Arc<EngineConfig>,
        cache: Arc<DependencyCache>,
        event_bus: Arc<EventBus>,
        notify: Arc<NotifySubscriptions>,
    ) -> Self {
        let scanner = Arc::new(UnitScanner::new(Arc::clone(&engine), Arc::clone(&cache)));
        let supervisor = Arc::new(ExecutionSupervisor::new(Arc::clone(&engine)));
        let orchestrator = Arc::new(RunOrchestrator::new(
            Arc::clone(&engine),
            Arc::clone(&scanner),
            Arc::clone(&supervisor),
            Arc::clone(&event_bus),
        ));
        Self {
            config: Arc::new(config),
            engine,
            scanner,
            cache,
            supervisor,
            orchestrator,
            event_bus,
            notify,
        }
    }
}
