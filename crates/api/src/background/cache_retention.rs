//! Periodic cleanup of the dependency cache.
//!
//! Evicts entries that have not been used within `cache_retention` and that
//! no known unit references. Runs on a fixed interval using
//! `tokio::time::interval`.

use std::sync::Arc;

use scriptgate_core::config::EngineConfig;
use scriptgate_core::scripting::cache::DependencyCache;
use scriptgate_core::scripting::scanner::UnitScanner;
use tokio_util::sync::CancellationToken;

/// Run the cache retention loop until `cancel` is triggered.
pub async fn run(
    config: Arc<EngineConfig>,
    cache: Arc<DependencyCache>,
    scanner: Arc<UnitScanner>,
    cancel: CancellationToken,
) {
    tracing::info!(
        retention_secs = config.cache_retention.as_secs(),
        interval_secs = config.cache_cleanup_interval.as_secs(),
        "Cache retention job started"
    );

    let mut interval = tokio::time::interval(config.cache_cleanup_interval);
    // The first tick completes immediately; skip it so startup is not a sweep.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Cache retention job stopping");
                break;
            }
            _ = interval.tick() => {
                let report = cache.cleanup(config.cache_retention, scanner.as_ref()).await;
                if report.removed.is_empty() {
                    tracing::debug!("Cache retention: nothing to evict");
                } else {
                    tracing::info!(
                        removed = report.removed.len(),
                        reclaimed_bytes = report.reclaimed_bytes,
                        "Cache retention: evicted unused entries"
                    );
                }
            }
        }
    }
}
