//! Webhook delivery with exponential-backoff retry.
//!
//! [`WebhookDelivery`] POSTs a JSON [`Notification`] to an external URL.
//! Failed attempts are retried with exponential backoff (1 s, 2 s, 4 s)
//! before giving up.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry delays (exponential backoff: 1s, 2s, 4s).
const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

/// HTTP request timeout for a single delivery attempt.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Group tag attached to every notification.
pub const NOTIFICATION_GROUP: &str = "ScriptGateway";

/// Body posted to the webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub group: String,
}

impl Notification {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            group: NOTIFICATION_GROUP.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Error type for webhook delivery failures.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The underlying HTTP request failed (network, DNS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The remote server returned a non-2xx status code.
    #[error("Webhook returned HTTP {0}")]
    HttpStatus(u16),
}

// ---------------------------------------------------------------------------
// WebhookDelivery
// ---------------------------------------------------------------------------

/// Delivers notifications to one webhook endpoint.
pub struct WebhookDelivery {
    client: reqwest::Client,
    url: String,
    retry_delays: Vec<Duration>,
}

impl WebhookDelivery {
    /// Create a delivery service for `url` with a pre-configured HTTP client.
    pub fn new(url: impl Into<String>) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.into(),
            retry_delays: RETRY_DELAYS.to_vec(),
        })
    }

    /// Override the backoff schedule.
    pub fn with_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.retry_delays = delays;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Deliver a notification with retry.
    ///
    /// Returns `Ok(())` on the first successful attempt, or the first error
    /// once every retry is exhausted.
    pub async fn deliver(&self, notification: &Notification) -> Result<(), WebhookError> {
        let mut first_err: Option<WebhookError> = None;

        for (attempt, delay) in self.retry_delays.iter().enumerate() {
            match self.try_send(notification).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        url = %self.url,
                        error = %e,
                        "Webhook delivery attempt failed, retrying"
                    );
                    first_err.get_or_insert(e);
                    tokio::time::sleep(*delay).await;
                }
            }
        }

        // Final attempt after the last backoff.
        match self.try_send(notification).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!(url = %self.url, error = %e, "Webhook delivery failed after all retries");
                Err(first_err.unwrap_or(e))
            }
        }
    }

    /// Execute a single POST request and check the response status.
    async fn try_send(&self, notification: &Notification) -> Result<(), WebhookError> {
        let response = self.client.post(&self.url).json(notification).send().await?;
        if !response.status().is_success() {
            return Err(WebhookError::HttpStatus(response.status().as_u16()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Router;
    use tokio::net::TcpListener;

    use super::*;

    #[derive(Clone, Default)]
    struct Endpoint {
        statuses: Arc<Mutex<VecDeque<u16>>>,
        bodies: Arc<Mutex<Vec<String>>>,
    }

    async fn record(State(endpoint): State<Endpoint>, body: String) -> StatusCode {
        endpoint.bodies.lock().expect("lock").push(body);
        let status = endpoint.statuses.lock().expect("lock").pop_front().unwrap_or(200);
        StatusCode::from_u16(status).expect("valid status")
    }

    /// Webhook endpoint answering with `statuses` in order (then 200),
    /// recording every request body.
    pub(crate) async fn spawn_endpoint(statuses: Vec<u16>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let endpoint = Endpoint {
            statuses: Arc::new(Mutex::new(statuses.into())),
            ..Endpoint::default()
        };
        let bodies = Arc::clone(&endpoint.bodies);

        let app = Router::new()
            .route("/hook", post(record))
            .fallback(|| async { StatusCode::NOT_FOUND })
            .with_state(endpoint);
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        (format!("http://{addr}/hook"), bodies)
    }

    #[test]
    fn notification_carries_group() {
        let n = Notification::new("Script failed: a.sh", "boom");
        let json = serde_json::to_value(&n).expect("json");
        assert_eq!(json["group"], "ScriptGateway");
        assert_eq!(json["title"], "Script failed: a.sh");
    }

    #[test]
    fn webhook_error_display_http_status() {
        let err = WebhookError::HttpStatus(502);
        assert_eq!(err.to_string(), "Webhook returned HTTP 502");
    }

    #[tokio::test]
    async fn delivers_json_body() {
        let (url, bodies) = spawn_endpoint(vec![]).await;
        let delivery = WebhookDelivery::new(url).expect("client");
        delivery
            .deliver(&Notification::new("t", "b"))
            .await
            .expect("deliver");

        let bodies = bodies.lock().expect("lock");
        let sent: Notification = serde_json::from_str(&bodies[0]).expect("json body");
        assert_eq!(sent, Notification::new("t", "b"));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let (url, bodies) = spawn_endpoint(vec![500, 503]).await;
        let delivery = WebhookDelivery::new(url)
            .expect("client")
            .with_retry_delays(vec![Duration::from_millis(10); 3]);
        delivery
            .deliver(&Notification::new("t", "b"))
            .await
            .expect("third attempt succeeds");
        assert_eq!(bodies.lock().expect("lock").len(), 3);
    }

    #[tokio::test]
    async fn gives_up_with_first_error() {
        let (url, bodies) = spawn_endpoint(vec![500, 500, 500]).await;
        let delivery = WebhookDelivery::new(url)
            .expect("client")
            .with_retry_delays(vec![Duration::from_millis(10); 2]);
        let err = delivery
            .deliver(&Notification::new("t", "b"))
            .await
            .expect_err("all attempts fail");
        assert!(matches!(err, WebhookError::HttpStatus(500)));
        assert_eq!(bodies.lock().expect("lock").len(), 3);
    }
}
