use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use scriptgate_core::config::EngineConfig;
use scriptgate_core::scripting::cache::DependencyCache;
use scriptgate_core::scripting::installer::SystemInstaller;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scriptgate_api::background;
use scriptgate_api::config::ServerConfig;
use scriptgate_api::router::build_app_router;
use scriptgate_api::state::AppState;

/// Opt-in set for run notifications, under the work dir.
const NOTIFY_FILE: &str = "notify_units.json";

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "scriptgate_api=debug,scriptgate_core=info,scriptgate_events=info,tower_http=debug".into()
    });
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    // --- Configuration ---
    let config = ServerConfig::from_env();
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    let engine = Arc::new(EngineConfig::from_env().expect("Invalid engine configuration"));
    tracing::info!(
        units_dir = %engine.units_dir.display(),
        work_dir = %engine.work_dir.display(),
        "Loaded engine configuration"
    );

    // --- Dependency cache ---
    let installer = Arc::new(SystemInstaller::new(Arc::clone(&engine)));
    let cache = Arc::new(
        DependencyCache::open(&engine, installer)
            .await
            .expect("Failed to open dependency cache"),
    );

    // --- Event bus ---
    let event_bus = Arc::new(scriptgate_events::EventBus::default());
    let notify = Arc::new(
        scriptgate_events::NotifySubscriptions::open(engine.work_dir.join(NOTIFY_FILE))
            .await
            .expect("Failed to load notification settings"),
    );
    tracing::info!(units = notify.enabled().len(), "Loaded notification settings");

    // --- App state ---
    let state = AppState::new(
        config.clone(),
        Arc::clone(&engine),
        cache,
        Arc::clone(&event_bus),
        Arc::clone(&notify),
    );

    let initial = state.scanner.scan().await;
    tracing::info!(
        units = state.scanner.catalog().len(),
        added = initial.added.len(),
        "Initial scan complete"
    );

    // --- Notifier ---
    let notifier_handle = match &engine.notify_url {
        Some(url) => match scriptgate_events::WebhookDelivery::new(url.clone()) {
            Ok(delivery) => Some(tokio::spawn(scriptgate_events::RunNotifier::run(
                delivery,
                notify,
                event_bus.subscribe(),
            ))),
            Err(e) => {
                tracing::error!(error = %e, "Failed to build webhook client, notifications disabled");
                None
            }
        },
        None => None,
    };

    // --- Background jobs ---
    let cancel = CancellationToken::new();
    let scan_handle = tokio::spawn(background::scan_loop::run(
        Arc::clone(&state.scanner),
        engine.scan_interval,
        cancel.clone(),
    ));
    let retention_handle = tokio::spawn(background::cache_retention::run(
        Arc::clone(&engine),
        Arc::clone(&state.cache),
        Arc::clone(&state.scanner),
        cancel.clone(),
    ));
    tracing::info!("Background jobs started (scan loop, cache retention)");

    // --- Router ---
    let supervisor = Arc::clone(&state.supervisor);
    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&supervisor)))
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");
    let drain = Duration::from_secs(config.shutdown_timeout_secs);

    cancel.cancel();
    let _ = tokio::time::timeout(drain, scan_handle).await;
    let _ = tokio::time::timeout(drain, retention_handle).await;
    tracing::info!("Background jobs stopped");

    // Dropping the last sender closes the bus and ends the notifier.
    drop(event_bus);
    if let Some(handle) = notifier_handle {
        let _ = tokio::time::timeout(drain, handle).await;
        tracing::info!("Run notifier shut down");
    }

    tracing::info!("Graceful shutdown complete");
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix). In-flight executions
/// are terminated as soon as the signal arrives so open call requests
/// complete and the server can drain.
async fn shutdown_signal(supervisor: Arc<scriptgate_core::scripting::supervisor::ExecutionSupervisor>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }

    supervisor.shutdown();
}
