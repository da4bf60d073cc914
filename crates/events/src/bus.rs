//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] fans out one [`RunEvent`] per finished execution to any
//! number of subscribers (notifier, run-history sinks). Publishing never
//! blocks and never fails the caller.

use chrono::{DateTime, Utc};
use scriptgate_core::scripting::result::{ExecutionResult, RunRecord};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// RunEvent
// ---------------------------------------------------------------------------

/// A finished execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    /// Flattened record for storage.
    pub record: RunRecord,

    /// Read-only copy of the result returned to the caller.
    pub result: ExecutionResult,

    /// When the event was published (UTC).
    pub timestamp: DateTime<Utc>,
}

impl RunEvent {
    pub fn new(unit_id: &str, result: &ExecutionResult) -> Self {
        Self {
            record: RunRecord::from_result(unit_id, result),
            result: result.clone(),
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// # Usage
///
/// ```rust
/// use scriptgate_core::scripting::result::ExecutionResult;
/// use scriptgate_events::bus::{EventBus, RunEvent};
///
/// let bus = EventBus::default();
/// let mut rx = bus.subscribe();
///
/// let result = ExecutionResult::Timeout { elapsed_ms: 10, partial_output: String::new() };
/// bus.publish(RunEvent::new("slow.sh", &result));
/// ```
pub struct EventBus {
    sender: broadcast::Sender<RunEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed messages are dropped
    /// and slow receivers will observe a `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: RunEvent) {
        // Zero receivers is fine.
        let _ = self.sender.send(event);
    }

    /// Subscribe to all events published on this bus.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use scriptgate_core::scripting::result::FailureKind;

    use super::*;

    #[tokio::test]
    async fn publish_and_receive() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let result = ExecutionResult::Success {
            payload: serde_json::json!({"msg": "Hello Alice"}),
            elapsed_ms: 12,
        };
        bus.publish(RunEvent::new("hello.sh", &result));

        let e1 = rx1.recv().await.expect("subscriber 1 should receive");
        let e2 = rx2.recv().await.expect("subscriber 2 should receive");
        assert_eq!(e1.record.unit_id, "hello.sh");
        assert_eq!(e1.record.outcome, "success");
        assert_eq!(e2.result, result);
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.publish(RunEvent::new(
            "orphan.sh",
            &ExecutionResult::failure(FailureKind::SpawnFailed, "gone"),
        ));
    }
}
