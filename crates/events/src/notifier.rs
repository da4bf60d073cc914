//! Run notifier.
//!
//! [`RunNotifier`] subscribes to the [`EventBus`](crate::bus::EventBus) and
//! forwards finished executions of opted-in units to the webhook. It runs
//! as a long-lived background task; delivery failures are logged and never
//! reach the caller that produced the result.

use std::sync::Arc;

use scriptgate_core::scripting::result::{ExecutionResult, FailureKind};
use tokio::sync::broadcast;

use crate::bus::RunEvent;
use crate::delivery::webhook::{Notification, WebhookDelivery};
use crate::subscriptions::NotifySubscriptions;

/// Longest payload excerpt included in a notification body.
const BODY_LIMIT: usize = 1000;

/// Background service that posts run notifications.
pub struct RunNotifier;

impl RunNotifier {
    /// Run the notification loop until the bus is dropped.
    pub async fn run(
        delivery: WebhookDelivery,
        subscriptions: Arc<NotifySubscriptions>,
        mut receiver: broadcast::Receiver<RunEvent>,
    ) {
        tracing::info!(url = delivery.url(), "Run notifier started");
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    if !Self::wants(&subscriptions, &event) {
                        continue;
                    }
                    let notification = Self::render(&event);
                    if let Err(e) = delivery.deliver(&notification).await {
                        tracing::error!(
                            error = %e,
                            unit_id = %event.record.unit_id,
                            "Failed to deliver run notification"
                        );
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Run notifier lagged, some notifications were dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("Event bus closed, run notifier shutting down");
                    break;
                }
            }
        }
    }

    /// Only opted-in units notify, and rejected requests never do.
    pub fn wants(subscriptions: &NotifySubscriptions, event: &RunEvent) -> bool {
        event.result.failure_kind() != Some(FailureKind::ValidationError)
            && subscriptions.is_enabled(&event.record.unit_id)
    }

    /// Build the notification for one event.
    pub fn render(event: &RunEvent) -> Notification {
        let unit_id = &event.record.unit_id;
        match &event.result {
            ExecutionResult::Success {
                payload,
                elapsed_ms,
            } => Notification::new(
                format!("Script succeeded: {unit_id}"),
                format!("{} ({elapsed_ms} ms)", truncate(&payload.to_string())),
            ),
            ExecutionResult::Failure { kind, message, .. } => Notification::new(
                format!("Script failed: {unit_id}"),
                format!("{}: {}", kind.as_str(), truncate(message)),
            ),
            ExecutionResult::Timeout { elapsed_ms, .. } => Notification::new(
                format!("Script timed out: {unit_id}"),
                format!("Deadline exceeded after {elapsed_ms} ms"),
            ),
        }
    }
}

fn truncate(text: &str) -> String {
    if text.len() <= BODY_LIMIT {
        return text.to_string();
    }
    let mut end = BODY_LIMIT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
