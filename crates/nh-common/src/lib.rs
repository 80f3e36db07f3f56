use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub mod logging;

// ============================================================================
// Topics
// ============================================================================

/// Topic carrying scheduled-delivery envelopes until their due time.
pub const DELAYED_TOPIC: &str = "delayed_notification";

/// Topic carrying terminal status messages back to the status sink.
pub const STATUS_TOPIC: &str = "notification_status";

/// Per-channel delivery topic, e.g. `email_notification`.
pub fn channel_topic(channel: &str) -> String {
    format!("{}_notification", channel)
}

/// Consumer identifier for a channel's dispatch workers.
pub fn processor_group(channel: &str) -> String {
    format!("{}-processor-group", channel)
}

// ============================================================================
// Notification
// ============================================================================

/// Notification lifecycle status.
///
/// Stored as an integer code in SQLite and as the same code in BSON so both
/// backends index and compare it identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Processing,
    Delivered,
    Failed,
}

impl NotificationStatus {
    pub fn code(&self) -> i32 {
        match self {
            NotificationStatus::Pending => 0,
            NotificationStatus::Processing => 1,
            NotificationStatus::Delivered => 2,
            NotificationStatus::Failed => 3,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            1 => NotificationStatus::Processing,
            2 => NotificationStatus::Delivered,
            3 => NotificationStatus::Failed,
            _ => NotificationStatus::Pending,
        }
    }

    /// Statuses that occupy the `(request_id, channel)` uniqueness slot.
    /// A `failed` row never blocks a fresh attempt.
    pub fn blocks_resubmit(&self) -> bool {
        !matches!(self, NotificationStatus::Failed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NotificationStatus::Delivered | NotificationStatus::Failed
        )
    }
}

impl Default for NotificationStatus {
    fn default() -> Self {
        NotificationStatus::Pending
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationStatus::Pending => write!(f, "pending"),
            NotificationStatus::Processing => write!(f, "processing"),
            NotificationStatus::Delivered => write!(f, "delivered"),
            NotificationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A single per-channel notification as persisted in the durable store.
///
/// `recipient` and `content` are opaque channel-shaped JSON; providers
/// validate them into typed shapes just before send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// Store-assigned notification identifier (NID).
    pub id: String,
    /// Client-supplied request identifier (RID).
    pub request_id: Uuid,
    /// Client identifier (CID).
    pub client_id: Uuid,
    pub channel: String,
    /// Explicitly requested provider id, if any.
    pub provider: Option<String>,
    pub recipient: serde_json::Value,
    pub content: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<HashMap<String, String>>,
    pub webhook_url: String,
    pub status: NotificationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Outbox
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Published,
}

impl OutboxStatus {
    pub fn code(&self) -> i32 {
        match self {
            OutboxStatus::Pending => 0,
            OutboxStatus::Published => 1,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            1 => OutboxStatus::Published,
            _ => OutboxStatus::Pending,
        }
    }
}

/// A pending publication, created in the same transaction as its
/// notification and drained to the bus by the outbox dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRow {
    pub id: String,
    pub notification_id: String,
    pub topic: String,
    /// Serialized bus payload; opaque to the dispatcher.
    pub payload: String,
    pub status: OutboxStatus,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxRow {
    pub fn new(notification_id: String, topic: String, payload: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            notification_id,
            topic,
            payload,
            status: OutboxStatus::Pending,
            claimed_by: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Terminal outcome of a delivery attempt, as carried on the status topic
/// and in status-outbox rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Delivered,
    Failed,
}

impl TerminalStatus {
    pub fn as_notification_status(&self) -> NotificationStatus {
        match self {
            TerminalStatus::Delivered => NotificationStatus::Delivered,
            TerminalStatus::Failed => NotificationStatus::Failed,
        }
    }
}

impl std::fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminalStatus::Delivered => write!(f, "delivered"),
            TerminalStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Status-outbox row, written only by the recovery reconciler so a heal and
/// its status publication cannot be separated by a crash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusOutboxRow {
    pub id: String,
    pub notification_id: String,
    pub status: TerminalStatus,
    pub message: Option<String>,
    pub processed: bool,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl StatusOutboxRow {
    pub fn new(notification_id: String, status: TerminalStatus, message: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            notification_id,
            status,
            message,
            processed: false,
            claimed_by: None,
            claimed_at: None,
            created_at: Utc::now(),
        }
    }
}

// ============================================================================
// Alerts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    /// Provider send succeeded but the durable terminal state was lost.
    GhostDelivery,
    /// A notification sat in `processing` far past the lock TTL.
    StuckProcessing,
    /// Pending notifications older than the outbox pipeline should take.
    OrphanedPending,
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertType::GhostDelivery => write!(f, "ghost_delivery"),
            AlertType::StuckProcessing => write!(f, "stuck_processing"),
            AlertType::OrphanedPending => write!(f, "orphaned_pending"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertSeverity::Warning => write!(f, "warning"),
            AlertSeverity::Error => write!(f, "error"),
            AlertSeverity::Critical => write!(f, "critical"),
        }
    }
}

/// Operator-visible alert raised by the recovery reconciler.
/// At most one unresolved alert exists per `(notification_id, alert_type)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub notification_id: Option<String>,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub metadata: serde_json::Value,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        notification_id: Option<String>,
        alert_type: AlertType,
        severity: AlertSeverity,
        message: String,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            notification_id,
            alert_type,
            severity,
            message,
            metadata,
            resolved: false,
            resolved_at: None,
            created_at: Utc::now(),
        }
    }
}

// ============================================================================
// Bus message shapes
// ============================================================================

/// Payload carried on a `<channel>_notification` topic, keyed by NID.
/// This is the provider-facing shape the dispatch consumer validates and
/// hands to `send`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub notification_id: String,
    pub request_id: Uuid,
    pub client_id: Uuid,
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub recipient: serde_json::Value,
    pub content: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<HashMap<String, String>>,
    pub webhook_url: String,
    #[serde(default)]
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
}

impl NotificationPayload {
    pub fn from_notification(n: &Notification) -> Self {
        Self {
            notification_id: n.id.clone(),
            request_id: n.request_id,
            client_id: n.client_id,
            channel: n.channel.clone(),
            provider: n.provider.clone(),
            recipient: n.recipient.clone(),
            content: n.content.clone(),
            variables: n.variables.clone(),
            webhook_url: n.webhook_url.clone(),
            retry_count: n.retry_count,
            created_at: n.created_at,
        }
    }
}

/// Envelope on the `delayed_notification` topic and in the scheduled queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayedMessage {
    pub notification_id: String,
    pub request_id: Uuid,
    pub client_id: Uuid,
    pub scheduled_at: DateTime<Utc>,
    /// Channel topic the payload is published onto when due.
    pub target_topic: String,
    pub payload: NotificationPayload,
    /// Times the due-entry poller failed to publish this entry.
    #[serde(default)]
    pub poller_retries: u32,
    pub created_at: DateTime<Utc>,
}

/// Terminal status message on the `notification_status` topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusMessage {
    pub notification_id: String,
    pub request_id: Uuid,
    pub client_id: Uuid,
    pub channel: String,
    pub status: TerminalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub retry_count: i32,
    pub webhook_url: String,
    pub created_at: DateTime<Utc>,
}

/// Body POSTed to the client webhook. At-least-once; clients dedupe on
/// `notification_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookCallback {
    pub request_id: Uuid,
    pub client_id: Uuid,
    pub notification_id: String,
    pub status: TerminalStatus,
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl WebhookCallback {
    pub fn from_status(status: &StatusMessage) -> Self {
        Self {
            request_id: status.request_id,
            client_id: status.client_id,
            notification_id: status.notification_id.clone(),
            status: status.status,
            channel: status.channel.clone(),
            message: status.message.clone(),
            occurred_at: Utc::now(),
        }
    }
}

// ============================================================================
// Delivery results
// ============================================================================

/// Error codes the core itself produces. Providers use their own codes.
pub const ERR_NO_PROVIDER: &str = "NO_PROVIDER";
pub const ERR_ALL_PROVIDERS_FAILED: &str = "ALL_PROVIDERS_FAILED";
pub const ERR_VALIDATION: &str = "VALIDATION";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

/// Outcome of one provider send attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DeliveryError>,
}

impl DeliveryResult {
    pub fn delivered(message_id: impl Into<String>) -> Self {
        Self {
            success: true,
            message_id: Some(message_id.into()),
            error: None,
        }
    }

    pub fn failure(code: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            success: false,
            message_id: None,
            error: Some(DeliveryError {
                code: code.into(),
                message: message.into(),
                retryable,
            }),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.error.as_ref().map(|e| e.retryable).unwrap_or(false)
    }

    pub fn error_message(&self) -> String {
        self.error
            .as_ref()
            .map(|e| format!("{}: {}", e.code, e.message))
            .unwrap_or_else(|| "unknown error".to_string())
    }
}

/// Exponential backoff for the nth retry: `2^(n+1) * base_delay_ms`.
pub fn retry_backoff_ms(retry_count: i32, base_delay_ms: u64) -> u64 {
    let exp = (retry_count + 1).clamp(1, 20) as u32;
    base_delay_ms.saturating_mul(1u64 << exp)
}
