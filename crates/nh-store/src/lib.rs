//! Durable store repositories.
//!
//! The durable store owns notifications, outbox rows, status-outbox rows,
//! and alerts. Writes that touch a notification and one of its outbox rows
//! happen in a single transaction in every backend (ingest, recovery
//! reset, ghost heal).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nh_common::{Alert, AlertType, Notification, OutboxRow, StatusOutboxRow, TerminalStatus};
use thiserror::Error;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "mongo")]
pub mod mongo;

#[derive(Error, Debug)]
pub enum StoreError {
    /// U1 violation: an active row already exists for `(request_id, channel)`.
    #[error("Duplicate notification for request {request_id} on channel {channel}")]
    Duplicate {
        request_id: String,
        channel: String,
    },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl StoreError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreError::Duplicate { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Notification persistence.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Insert a notification and its first outbox row in one transaction.
    /// Fails with `StoreError::Duplicate` when an active row already holds
    /// the `(request_id, channel)` slot.
    async fn insert_with_outbox(
        &self,
        notification: &Notification,
        outbox: &OutboxRow,
    ) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Notification>>;

    /// Terminal update from the status sink. Returns false when the
    /// notification does not exist.
    async fn set_terminal(
        &self,
        id: &str,
        status: TerminalStatus,
        error_message: Option<&str>,
        retry_count: i32,
    ) -> Result<bool>;

    /// Notifications stuck in `processing` with `updated_at` older than the
    /// cutoff. Reconciler input.
    async fn find_stuck_processing(
        &self,
        updated_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Notification>>;

    /// Count of `pending` notifications created before the cutoff.
    async fn count_stale_pending(&self, created_before: DateTime<Utc>) -> Result<u64>;

    /// Reset a notification to `pending` and insert a fresh outbox row in
    /// one transaction. `new_content` replaces the stored content when set
    /// (operator-initiated retries may append a warning to the body).
    async fn reset_to_pending_with_outbox(
        &self,
        id: &str,
        new_content: Option<&serde_json::Value>,
        outbox: &OutboxRow,
    ) -> Result<()>;

    /// Ghost-delivery heal: mark the notification `delivered` and record a
    /// status-outbox row in one transaction, so the status publication
    /// survives a reconciler crash.
    async fn heal_delivered(&self, id: &str, status_outbox: &StatusOutboxRow) -> Result<()>;

    /// Liveness probe; the reconciler skips its run when this fails.
    async fn healthy(&self) -> bool;
}

/// Outbox persistence used by the dispatcher.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Atomically claim up to `limit` dispatchable rows: `pending` and
    /// either never claimed or claimed longer than `lease_ms` ago.
    async fn claim_pending(
        &self,
        worker_id: &str,
        limit: u32,
        lease_ms: u64,
    ) -> Result<Vec<OutboxRow>>;

    /// In one transaction: mark outbox rows published and move the named
    /// notifications to `processing`. Scheduled-delivery rows pass an
    /// empty notification list so those stay `pending`.
    async fn mark_published(
        &self,
        row_ids: &[String],
        notification_ids_to_processing: &[String],
    ) -> Result<()>;

    /// Delete `published` rows older than the cutoff. Returns the count.
    async fn delete_published_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Pending row count (diagnostics).
    async fn count_pending(&self) -> Result<u64>;
}

/// Status-outbox persistence, written by the reconciler and drained by the
/// status-outbox drainer.
#[async_trait]
pub trait StatusOutboxStore: Send + Sync {
    /// Claim unprocessed rows under the same lease discipline as the
    /// outbox dispatcher.
    async fn claim_unprocessed(
        &self,
        worker_id: &str,
        limit: u32,
        lease_ms: u64,
    ) -> Result<Vec<StatusOutboxRow>>;

    async fn mark_processed(&self, row_ids: &[String]) -> Result<()>;
}

/// Alert persistence with `(notification_id, alert_type)` dedup.
#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Raise an alert unless an unresolved one already exists for the same
    /// `(notification_id, alert_type)` pair. On an existing alert, severity
    /// and metadata are refreshed when the new severity is higher. Returns
    /// true when a new alert row was created.
    async fn raise_once(&self, alert: &Alert) -> Result<bool>;

    async fn get_alert(&self, alert_id: &str) -> Result<Option<Alert>>;

    async fn resolve(&self, alert_id: &str) -> Result<bool>;

    async fn unresolved(&self, limit: u32) -> Result<Vec<Alert>>;

    /// Unresolved alert for a specific `(notification_id, alert_type)`.
    async fn find_open(
        &self,
        notification_id: Option<&str>,
        alert_type: AlertType,
    ) -> Result<Option<Alert>>;
}

/// Epoch-ms helpers shared by both backends.
pub(crate) fn to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}
