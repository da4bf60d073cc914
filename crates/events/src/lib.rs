//! Script gateway event bus and notification infrastructure.
//!
//! - [`EventBus`]: in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`, carrying one [`RunEvent`] per execution.
//! - [`delivery`]: external delivery channels (webhook).
//! - [`RunNotifier`]: background subscriber that posts run notifications.
//! - [`NotifySubscriptions`]: per-unit notification opt-in.

pub mod bus;
pub mod delivery;
pub mod notifier;
pub mod subscriptions;

pub use bus::{EventBus, RunEvent};
pub use delivery::webhook::{Notification, WebhookDelivery, WebhookError};
pub use notifier::RunNotifier;
pub use subscriptions::{NotifySubscriptions, SubscriptionError};
