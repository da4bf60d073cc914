//! Hot-reload scan loop.
//!
//! Re-scans the unit tree every `scan_interval` so added, edited and
//! deleted scripts are picked up without a restart.

use std::sync::Arc;
use std::time::Duration;

use scriptgate_core::scripting::scanner::UnitScanner;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Run the scan loop until `cancel` is triggered.
///
/// The first tick fires immediately.
pub async fn run(scanner: Arc<UnitScanner>, interval: Duration, cancel: CancellationToken) {
    tracing::info!(interval_secs = interval.as_secs(), "Scan loop started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Scan loop stopping");
                break;
            }
            _ = ticker.tick() => {
                let report = scanner.scan().await;
                if report.is_empty() {
                    tracing::debug!(units = scanner.catalog().len(), "Scan loop: no changes");
                }
            }
        }
    }
}
