//! Ingest service: turns delivery requests into notification rows and
//! outbox rows, one transaction per `(request, channel)` pair.
//!
//! A multi-channel request is N independent per-channel notifications;
//! there is no cross-channel atomicity. Duplicate `(request_id, channel)`
//! pairs are enumerated so the HTTP collaborator can distinguish an
//! all-duplicate conflict from a partial acceptance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use nh_common::{
    channel_topic, DelayedMessage, Notification, NotificationPayload, NotificationStatus,
    OutboxRow, DELAYED_TOPIC,
};
use nh_store::{NotificationStore, StoreError};

#[derive(Error, Debug)]
pub enum IngestError {
    /// Every `(request_id, channel)` pair was already active.
    #[error("All {} notification(s) are duplicates", .0.len())]
    AllDuplicates(Vec<DuplicateKey>),

    #[error("Batch of {effective} effective notifications exceeds ceiling {ceiling}")]
    BatchTooLarge { effective: usize, ceiling: usize },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IngestError {
    fn all_duplicates_count(&self) -> usize {
        match self {
            IngestError::AllDuplicates(keys) => keys.len(),
            _ => 0,
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;

/// Provider selection: one id for every channel, or one per channel slot
/// aligned with the request's channel array.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProviderSelector {
    Single(String),
    PerChannel(Vec<Option<String>>),
}

impl ProviderSelector {
    fn for_channel_index(&self, index: usize) -> Option<String> {
        match self {
            ProviderSelector::Single(id) => Some(id.clone()),
            ProviderSelector::PerChannel(ids) => ids.get(index).cloned().flatten(),
        }
    }
}

/// Single delivery request, as handed over by the HTTP collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub request_id: Uuid,
    pub client_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    pub channel: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderSelector>,
    pub recipient: serde_json::Value,
    pub content: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    pub webhook_url: String,
}

/// One recipient row in a batch request. Channel-shaped recipient fields
/// sit flattened next to the fixed keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecipient {
    pub request_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<HashMap<String, String>>,
    #[serde(flatten)]
    pub recipient: serde_json::Map<String, serde_json::Value>,
}

/// Batch delivery request: one content for many recipients across channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchNotificationRequest {
    pub client_id: Uuid,
    pub channel: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderSelector>,
    pub content: serde_json::Value,
    pub recipients: Vec<BatchRecipient>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    pub webhook_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DuplicateKey {
    pub request_id: Uuid,
    pub channel: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptedNotification {
    pub notification_id: String,
    pub request_id: Uuid,
    pub channel: String,
}

/// Outcome of an accepted (possibly partially duplicate) submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub accepted: Vec<AcceptedNotification>,
    pub duplicates: Vec<DuplicateKey>,
}

/// Ingest configuration.
#[derive(Debug, Clone)]
pub struct IngestServiceConfig {
    /// Ceiling on `|recipients| x |channels|` for batch submissions.
    pub max_batch_effective: usize,
}

impl Default for IngestServiceConfig {
    fn default() -> Self {
        Self {
            max_batch_effective: 1000,
        }
    }
}

pub struct IngestService {
    store: Arc<dyn NotificationStore>,
    config: IngestServiceConfig,
}

impl IngestService {
    pub fn new(store: Arc<dyn NotificationStore>, config: IngestServiceConfig) -> Self {
        Self { store, config }
    }

    /// Submit a single request: one notification + outbox row per channel,
    /// each pair in its own transaction.
    pub async fn submit(&self, request: &NotificationRequest) -> Result<IngestOutcome> {
        if request.channel.is_empty() {
            return Err(IngestError::InvalidRequest(
                "channel list must not be empty".to_string(),
            ));
        }
        if request.webhook_url.is_empty() {
            return Err(IngestError::InvalidRequest(
                "webhook_url is required".to_string(),
            ));
        }

        let mut outcome = IngestOutcome::default();

        for (index, channel) in request.channel.iter().enumerate() {
            let provider = request
                .provider
                .as_ref()
                .and_then(|p| p.for_channel_index(index));

            let notification = build_notification(request, channel, provider);
            let outbox = build_outbox_row(&notification)?;

            match self.store.insert_with_outbox(&notification, &outbox).await {
                Ok(()) => {
                    metrics::counter!("ingest.accepted_total").increment(1);
                    debug!(
                        notification_id = %notification.id,
                        request_id = %request.request_id,
                        channel = %channel,
                        scheduled = notification.scheduled_at.is_some(),
                        "Notification ingested"
                    );
                    outcome.accepted.push(AcceptedNotification {
                        notification_id: notification.id,
                        request_id: request.request_id,
                        channel: channel.clone(),
                    });
                }
                Err(e) if e.is_duplicate() => {
                    metrics::counter!("ingest.duplicates_total").increment(1);
                    warn!(
                        request_id = %request.request_id,
                        channel = %channel,
                        "Duplicate submission rejected"
                    );
                    outcome.duplicates.push(DuplicateKey {
                        request_id: request.request_id,
                        channel: channel.clone(),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        if outcome.accepted.is_empty() && !outcome.duplicates.is_empty() {
            return Err(IngestError::AllDuplicates(outcome.duplicates));
        }
        Ok(outcome)
    }

    /// Submit a batch: the effective count `|recipients| x |channels|` is
    /// checked against the ceiling before anything is written.
    pub async fn submit_batch(&self, batch: &BatchNotificationRequest) -> Result<IngestOutcome> {
        let effective = batch.recipients.len() * batch.channel.len();
        if effective > self.config.max_batch_effective {
            return Err(IngestError::BatchTooLarge {
                effective,
                ceiling: self.config.max_batch_effective,
            });
        }
        if batch.channel.is_empty() {
            return Err(IngestError::InvalidRequest(
                "channel list must not be empty".to_string(),
            ));
        }

        let mut outcome = IngestOutcome::default();

        for recipient in &batch.recipients {
            let request = NotificationRequest {
                request_id: recipient.request_id,
                client_id: batch.client_id,
                client_name: None,
                channel: batch.channel.clone(),
                provider: batch.provider.clone(),
                recipient: serde_json::Value::Object(recipient.recipient.clone()),
                content: batch.content.clone(),
                variables: recipient.variables.clone(),
                scheduled_at: batch.scheduled_at,
                webhook_url: batch.webhook_url.clone(),
            };

            match self.submit(&request).await {
                Ok(mut partial) => {
                    outcome.accepted.append(&mut partial.accepted);
                    outcome.duplicates.append(&mut partial.duplicates);
                }
                Err(e @ IngestError::AllDuplicates(_)) => {
                    let count = e.all_duplicates_count();
                    if let IngestError::AllDuplicates(mut keys) = e {
                        outcome.duplicates.append(&mut keys);
                    }
                    debug!(
                        request_id = %recipient.request_id,
                        count = count,
                        "Batch recipient entirely duplicate"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            accepted = outcome.accepted.len(),
            duplicates = outcome.duplicates.len(),
            "Batch ingested"
        );

        if outcome.accepted.is_empty() && !outcome.duplicates.is_empty() {
            return Err(IngestError::AllDuplicates(outcome.duplicates));
        }
        Ok(outcome)
    }
}

fn build_notification(
    request: &NotificationRequest,
    channel: &str,
    provider: Option<String>,
) -> Notification {
    let now = Utc::now();
    Notification {
        id: Uuid::new_v4().to_string(),
        request_id: request.request_id,
        client_id: request.client_id,
        channel: channel.to_string(),
        provider,
        recipient: request.recipient.clone(),
        content: request.content.clone(),
        variables: request.variables.clone(),
        webhook_url: request.webhook_url.clone(),
        status: NotificationStatus::Pending,
        scheduled_at: request.scheduled_at,
        retry_count: 0,
        error_message: None,
        created_at: now,
        updated_at: now,
    }
}

/// Build the outbox row for a notification. Future-dated notifications go
/// through the delayed topic wrapped in a scheduled envelope; everything
/// else goes straight to its channel topic.
pub fn build_outbox_row(notification: &Notification) -> Result<OutboxRow> {
    let payload = NotificationPayload::from_notification(notification);
    let target_topic = channel_topic(&notification.channel);

    let (topic, body) = match notification.scheduled_at {
        Some(scheduled_at) if scheduled_at > Utc::now() => {
            let delayed = DelayedMessage {
                notification_id: notification.id.clone(),
                request_id: notification.request_id,
                client_id: notification.client_id,
                scheduled_at,
                target_topic,
                payload,
                poller_retries: 0,
                created_at: Utc::now(),
            };
            (
                DELAYED_TOPIC.to_string(),
                serde_json::to_string(&delayed).map_err(StoreError::from)?,
            )
        }
        _ => (
            target_topic,
            serde_json::to_string(&payload).map_err(StoreError::from)?,
        ),
    };

    Ok(OutboxRow::new(notification.id.clone(), topic, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nh_store::sqlite::SqliteStore;
    use nh_store::OutboxStore;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn service() -> (IngestService, Arc<SqliteStore>) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = Arc::new(SqliteStore::new(pool));
        store.init_schema().await.unwrap();
        (
            IngestService::new(store.clone(), IngestServiceConfig::default()),
            store,
        )
    }

    fn request(channels: &[&str]) -> NotificationRequest {
        NotificationRequest {
            request_id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            client_name: None,
            channel: channels.iter().map(|s| s.to_string()).collect(),
            provider: None,
            recipient: serde_json::json!({"email": "a@x", "phone": "+1555"}),
            content: serde_json::json!({
                "email": {"subject": "s", "message": "m"},
                "whatsapp": {"message": "m"}
            }),
            variables: None,
            scheduled_at: None,
            webhook_url: "http://w/1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_multi_channel_creates_independent_notifications() {
        let (service, store) = service().await;
        let outcome = service.submit(&request(&["email", "whatsapp"])).await.unwrap();

        assert_eq!(outcome.accepted.len(), 2);
        assert!(outcome.duplicates.is_empty());
        assert_eq!(store.count_pending().await.unwrap(), 2);

        let channels: Vec<&str> = outcome.accepted.iter().map(|a| a.channel.as_str()).collect();
        assert!(channels.contains(&"email"));
        assert!(channels.contains(&"whatsapp"));
    }

    #[tokio::test]
    async fn test_resubmit_is_all_duplicates() {
        let (service, _) = service().await;
        let req = request(&["email"]);

        service.submit(&req).await.unwrap();
        let err = service.submit(&req).await.unwrap_err();

        match err {
            IngestError::AllDuplicates(keys) => {
                assert_eq!(keys.len(), 1);
                assert_eq!(keys[0].channel, "email");
                assert_eq!(keys[0].request_id, req.request_id);
            }
            other => panic!("expected AllDuplicates, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_partial_duplicate_is_partial_success() {
        let (service, _) = service().await;
        let mut req = request(&["email"]);

        service.submit(&req).await.unwrap();

        // Same request id, now over both channels: email duplicates,
        // whatsapp is new
        req.channel = vec!["email".to_string(), "whatsapp".to_string()];
        let outcome = service.submit(&req).await.unwrap();

        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.accepted[0].channel, "whatsapp");
        assert_eq!(outcome.duplicates.len(), 1);
        assert_eq!(outcome.duplicates[0].channel, "email");
    }

    #[tokio::test]
    async fn test_scheduled_request_targets_delayed_topic() {
        let (service, store) = service().await;
        let mut req = request(&["email"]);
        req.scheduled_at = Some(Utc::now() + chrono::Duration::hours(1));

        service.submit(&req).await.unwrap();

        let rows = store.claim_pending("w1", 10, 30_000).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].topic, DELAYED_TOPIC);

        let delayed: DelayedMessage = serde_json::from_str(&rows[0].payload).unwrap();
        assert_eq!(delayed.target_topic, "email_notification");
        assert_eq!(delayed.poller_retries, 0);
    }

    #[tokio::test]
    async fn test_immediate_request_targets_channel_topic() {
        let (service, store) = service().await;
        service.submit(&request(&["email"])).await.unwrap();

        let rows = store.claim_pending("w1", 10, 30_000).await.unwrap();
        assert_eq!(rows[0].topic, "email_notification");

        let payload: NotificationPayload = serde_json::from_str(&rows[0].payload).unwrap();
        assert_eq!(payload.channel, "email");
    }

    #[tokio::test]
    async fn test_per_channel_provider_selection() {
        let (service, store) = service().await;
        let mut req = request(&["email", "whatsapp"]);
        req.provider = Some(ProviderSelector::PerChannel(vec![
            Some("http-email".to_string()),
            None,
        ]));

        let outcome = service.submit(&req).await.unwrap();

        let email_id = &outcome
            .accepted
            .iter()
            .find(|a| a.channel == "email")
            .unwrap()
            .notification_id;
        let whatsapp_id = &outcome
            .accepted
            .iter()
            .find(|a| a.channel == "whatsapp")
            .unwrap()
            .notification_id;

        use nh_store::NotificationStore;
        let email = store.get(email_id).await.unwrap().unwrap();
        assert_eq!(email.provider.as_deref(), Some("http-email"));
        let whatsapp = store.get(whatsapp_id).await.unwrap().unwrap();
        assert!(whatsapp.provider.is_none());
    }

    #[tokio::test]
    async fn test_batch_ceiling_enforced() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = Arc::new(SqliteStore::new(pool));
        store.init_schema().await.unwrap();
        let service = IngestService::new(
            store,
            IngestServiceConfig {
                max_batch_effective: 3,
            },
        );

        let recipients: Vec<BatchRecipient> = (0..2)
            .map(|i| BatchRecipient {
                request_id: Uuid::new_v4(),
                user_id: Some(format!("u-{}", i)),
                variables: None,
                recipient: serde_json::from_value(
                    serde_json::json!({"email": format!("u{}@x", i)}),
                )
                .unwrap(),
            })
            .collect();

        let batch = BatchNotificationRequest {
            client_id: Uuid::new_v4(),
            channel: vec!["email".to_string(), "whatsapp".to_string()],
            provider: None,
            content: serde_json::json!({"email": {"subject": "s", "message": "m"}}),
            recipients,
            scheduled_at: None,
            webhook_url: "http://w/1".to_string(),
        };

        // 2 recipients x 2 channels = 4 > 3
        let err = service.submit_batch(&batch).await.unwrap_err();
        assert!(matches!(
            err,
            IngestError::BatchTooLarge { effective: 4, ceiling: 3 }
        ));
    }

    #[tokio::test]
    async fn test_batch_creates_per_recipient_notifications() {
        let (service, store) = service().await;

        let recipients: Vec<BatchRecipient> = (0..3)
            .map(|i| BatchRecipient {
                request_id: Uuid::new_v4(),
                user_id: None,
                variables: Some(
                    [("name".to_string(), format!("user{}", i))].into_iter().collect(),
                ),
                recipient: serde_json::from_value(
                    serde_json::json!({"email": format!("u{}@x", i)}),
                )
                .unwrap(),
            })
            .collect();

        let batch = BatchNotificationRequest {
            client_id: Uuid::new_v4(),
            channel: vec!["email".to_string()],
            provider: None,
            content: serde_json::json!({"email": {"subject": "s", "message": "Hi {{name}}"}}),
            recipients,
            scheduled_at: None,
            webhook_url: "http://w/1".to_string(),
        };

        let outcome = service.submit_batch(&batch).await.unwrap();
        assert_eq!(outcome.accepted.len(), 3);
        assert_eq!(store.count_pending().await.unwrap(), 3);
    }
}
