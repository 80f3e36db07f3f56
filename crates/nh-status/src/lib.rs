//! Status sink: persists terminal outcomes and notifies client webhooks.
//!
//! The store update gates the ack: a failed write leaves the message on
//! the bus for redelivery. The webhook POST is best-effort and may repeat;
//! clients dedupe on `notification_id`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use sha2::Sha256;
use tracing::{debug, error, info, warn};

use nh_bus::{BusConsumer, ReceivedMessage};
use nh_common::{StatusMessage, WebhookCallback};
use nh_store::NotificationStore;

/// Webhook signature header.
pub const SIGNATURE_HEADER: &str = "X-NOTIFYHUB-SIGNATURE";
/// Webhook timestamp header.
pub const TIMESTAMP_HEADER: &str = "X-NOTIFYHUB-TIMESTAMP";

type HmacSha256 = Hmac<Sha256>;

/// Generate an HMAC-SHA256 signature for a webhook payload.
///
/// The signature payload is `timestamp + body`; the result is lowercase
/// hex. Clients verify by recomputing over the same concatenation.
pub fn sign_webhook(payload: &str, signing_secret: &str) -> (String, String) {
    let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
    let signature_payload = format!("{}{}", timestamp, payload);

    let mut mac = HmacSha256::new_from_slice(signing_secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(signature_payload.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());

    (signature, timestamp)
}

/// Configuration for the webhook client.
#[derive(Debug, Clone)]
pub struct WebhookClientConfig {
    pub timeout: Duration,
    /// When set, callbacks carry signature headers.
    pub signing_secret: Option<String>,
}

impl Default for WebhookClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            signing_secret: None,
        }
    }
}

/// Fire-and-forget webhook caller.
pub struct WebhookClient {
    client: Client,
    signing_secret: Option<String>,
}

impl WebhookClient {
    pub fn new(config: WebhookClientConfig) -> Self {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            signing_secret: config.signing_secret,
        }
    }

    /// POST the callback. Errors are reported, never retried; the terminal
    /// row in the store is the durable record.
    pub async fn post_callback(&self, url: &str, callback: &WebhookCallback) -> bool {
        let body = match serde_json::to_string(callback) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "Failed to serialize webhook callback");
                return false;
            }
        };

        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json");

        if let Some(secret) = &self.signing_secret {
            let (signature, timestamp) = sign_webhook(&body, secret);
            request = request
                .header(SIGNATURE_HEADER, signature)
                .header(TIMESTAMP_HEADER, timestamp);
        }

        match request.body(body).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(
                    notification_id = %callback.notification_id,
                    url = %url,
                    "Webhook delivered"
                );
                true
            }
            Ok(response) => {
                warn!(
                    notification_id = %callback.notification_id,
                    url = %url,
                    status_code = response.status().as_u16(),
                    "Webhook returned non-success"
                );
                false
            }
            Err(e) => {
                warn!(
                    notification_id = %callback.notification_id,
                    url = %url,
                    error = %e,
                    "Webhook request failed"
                );
                false
            }
        }
    }
}

/// Consumes the status topic into the durable store and the webhooks.
pub struct StatusSink {
    consumer: Arc<dyn BusConsumer>,
    notifications: Arc<dyn NotificationStore>,
    webhook: WebhookClient,
    poll_batch: u32,
    idle_delay: Duration,
}

impl StatusSink {
    pub fn new(
        consumer: Arc<dyn BusConsumer>,
        notifications: Arc<dyn NotificationStore>,
        webhook: WebhookClient,
    ) -> Self {
        Self {
            consumer,
            notifications,
            webhook,
            poll_batch: 50,
            idle_delay: Duration::from_millis(200),
        }
    }

    /// Run the consume loop until cancelled.
    pub async fn run(&self) {
        info!("Starting status sink");
        loop {
            match self.process_available().await {
                Ok(0) => tokio::time::sleep(self.idle_delay).await,
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "Status sink poll failed");
                    tokio::time::sleep(self.idle_delay).await;
                }
            }
        }
    }

    /// Poll once and handle every returned message.
    pub async fn process_available(&self) -> nh_bus::Result<usize> {
        let messages = self.consumer.poll(self.poll_batch).await?;
        let count = messages.len();

        for message in messages {
            if self.handle_message(&message).await {
                if let Err(e) = self.consumer.ack(&message.receipt_handle).await {
                    warn!(error = %e, "Status ack failed; update is idempotent on redelivery");
                }
            }
        }

        Ok(count)
    }

    /// Returns whether the message should be acked.
    pub async fn handle_message(&self, message: &ReceivedMessage) -> bool {
        let status: StatusMessage = match serde_json::from_str(&message.body) {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "Unparseable status message dropped");
                return true;
            }
        };

        // Store first: a failed write must block the commit
        match self
            .notifications
            .set_terminal(
                &status.notification_id,
                status.status,
                status.message.as_deref(),
                status.retry_count,
            )
            .await
        {
            Ok(true) => {
                metrics::counter!("status.persisted_total").increment(1);
                debug!(
                    notification_id = %status.notification_id,
                    status = %status.status,
                    "Terminal status persisted"
                );
            }
            Ok(false) => {
                // Unknown notification: nothing to update but the callback
                // still carries everything the client needs
                warn!(
                    notification_id = %status.notification_id,
                    "Status for unknown notification"
                );
            }
            Err(e) => {
                error!(
                    notification_id = %status.notification_id,
                    error = %e,
                    "Store update failed; leaving status for redelivery"
                );
                return false;
            }
        }

        // Webhook second: best-effort, at-least-once
        let callback = WebhookCallback::from_status(&status);
        let delivered = self.webhook.post_callback(&status.webhook_url, &callback).await;
        if delivered {
            metrics::counter!("status.webhooks_delivered_total").increment(1);
        } else {
            metrics::counter!("status.webhooks_failed_total").increment(1);
        }

        true
    }
}
