//! Recovery reconciler: detects divergence between the durable store and
//! the coordination store, auto-heals what it safely can, and raises
//! operator alerts for the rest.
//!
//! - A `processing` notification whose idempotency record says `delivered`
//!   is a ghost delivery: the send happened but the terminal write was
//!   lost. The reconciler marks it delivered and records a status-outbox
//!   row in the same transaction; the drainer then republishes the status
//!   so the webhook still fires.
//! - A `processing` notification whose record is `failed` or gone was
//!   never sent (or failed without a terminal write): reset to `pending`
//!   with a fresh outbox row, again in one transaction.
//! - A record still `processing` far past its lease earns a
//!   `stuck_processing` alert, escalating with age.
//! - Stale `pending` counts past the configured thresholds raise one
//!   `orphaned_pending` alert carrying the count.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use nh_bus::{BusPublisher, TopicMessage};
use nh_common::{
    channel_topic, Alert, AlertSeverity, AlertType, Notification, NotificationPayload, OutboxRow,
    StatusMessage, StatusOutboxRow, TerminalStatus, STATUS_TOPIC,
};
use nh_coord::{CoordHealth, IdempotencyState, IdempotencyStore};
use nh_store::{AlertStore, NotificationStore, StatusOutboxStore, StoreError};

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Coordination error: {0}")]
    Coordination(#[from] nh_coord::CoordError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Alert {0} has no notification to retry")]
    NotRetryable(String),
}

pub type Result<T> = std::result::Result<T, RecoveryError>;

/// Configuration for the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub interval: Duration,
    pub batch_size: u32,
    /// The processing-lock TTL; a notification is stuck once it has been
    /// `processing` for twice this.
    pub processing_ttl: Duration,
    /// Age after which a pending notification counts as orphaned.
    pub orphan_threshold: Duration,
    /// Orphan count that raises a warning alert.
    pub orphan_alert_threshold: u64,
    /// Orphan count that escalates the alert to critical.
    pub orphan_critical_threshold: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_size: 100,
            processing_ttl: Duration::from_secs(60),
            orphan_threshold: Duration::from_secs(300),
            orphan_alert_threshold: 10,
            orphan_critical_threshold: 100,
        }
    }
}

/// Outcome counts of one reconciler pass, for logging and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub ghosts_healed: usize,
    pub orphans_reset: usize,
    pub stuck_alerts: usize,
    pub orphan_count: u64,
}

pub struct Reconciler {
    notifications: Arc<dyn NotificationStore>,
    alerts: Arc<dyn AlertStore>,
    idempotency: Arc<dyn IdempotencyStore>,
    coord_health: Arc<dyn CoordHealth>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        notifications: Arc<dyn NotificationStore>,
        alerts: Arc<dyn AlertStore>,
        idempotency: Arc<dyn IdempotencyStore>,
        coord_health: Arc<dyn CoordHealth>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            notifications,
            alerts,
            idempotency,
            coord_health,
            config,
        }
    }

    /// Run the reconcile loop until cancelled.
    pub async fn run(&self) {
        info!(
            interval_ms = %self.config.interval.as_millis(),
            batch_size = self.config.batch_size,
            "Starting recovery reconciler"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            match self.reconcile_once().await {
                Ok(Some(report)) => {
                    if report.ghosts_healed + report.orphans_reset + report.stuck_alerts > 0 {
                        info!(
                            ghosts_healed = report.ghosts_healed,
                            orphans_reset = report.orphans_reset,
                            stuck_alerts = report.stuck_alerts,
                            orphan_count = report.orphan_count,
                            "Reconciler pass complete"
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => error!(error = %e, "Reconciler pass failed"),
            }
        }
    }

    /// One reconciler pass. Returns None when skipped for unhealthy
    /// backends.
    pub async fn reconcile_once(&self) -> Result<Option<ReconcileReport>> {
        if !self.notifications.healthy().await {
            warn!("Durable store unhealthy; skipping reconciler pass");
            return Ok(None);
        }
        if !self.coord_health.ping().await {
            warn!("Coordination store unhealthy; skipping reconciler pass");
            return Ok(None);
        }

        let mut report = ReconcileReport::default();
        self.stuck_processing_pass(&mut report).await?;
        self.orphan_pass(&mut report).await?;
        Ok(Some(report))
    }

    async fn stuck_processing_pass(&self, report: &mut ReconcileReport) -> Result<()> {
        let threshold = chrono::Duration::from_std(self.config.processing_ttl * 2)
            .unwrap_or_else(|_| chrono::Duration::seconds(120));
        let cutoff = Utc::now() - threshold;

        let stuck = self
            .notifications
            .find_stuck_processing(cutoff, self.config.batch_size)
            .await?;

        for notification in stuck {
            match self.idempotency.get(&notification.id).await? {
                Some(IdempotencyState::Delivered) => {
                    self.heal_ghost(&notification).await?;
                    report.ghosts_healed += 1;
                }
                Some(IdempotencyState::Failed) | None => {
                    self.reset_orphaned_processing(&notification).await?;
                    report.orphans_reset += 1;
                }
                Some(IdempotencyState::Processing) => {
                    // A live lock this old means the sender is wedged, not
                    // merely slow
                    if notification.updated_at < Utc::now() - (threshold * 2) {
                        self.raise_stuck_alert(&notification, cutoff).await?;
                        report.stuck_alerts += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Send happened, terminal write was lost: finish the job durably and
    /// queue the status for republication.
    async fn heal_ghost(&self, notification: &Notification) -> Result<()> {
        let status_row = StatusOutboxRow::new(
            notification.id.clone(),
            TerminalStatus::Delivered,
            None,
        );
        self.notifications
            .heal_delivered(&notification.id, &status_row)
            .await?;

        metrics::counter!("recovery.ghosts_healed_total").increment(1);
        warn!(
            notification_id = %notification.id,
            channel = %notification.channel,
            "Ghost delivery healed"
        );

        let alert = Alert::new(
            Some(notification.id.clone()),
            AlertType::GhostDelivery,
            AlertSeverity::Warning,
            format!(
                "provider send succeeded but terminal state was lost for {}",
                notification.id
            ),
            serde_json::json!({ "channel": notification.channel }),
        );
        self.alerts.raise_once(&alert).await?;
        Ok(())
    }

    /// The send never concluded: put the notification back at the start of
    /// the pipeline.
    async fn reset_orphaned_processing(&self, notification: &Notification) -> Result<()> {
        let outbox = direct_outbox_row(notification)?;
        self.notifications
            .reset_to_pending_with_outbox(&notification.id, None, &outbox)
            .await?;

        metrics::counter!("recovery.resets_total").increment(1);
        info!(
            notification_id = %notification.id,
            "Stuck processing notification reset to pending"
        );
        Ok(())
    }

    async fn raise_stuck_alert(
        &self,
        notification: &Notification,
        cutoff: DateTime<Utc>,
    ) -> Result<()> {
        let age_ms = (Utc::now() - notification.updated_at).num_milliseconds();
        let threshold_ms = (Utc::now() - cutoff).num_milliseconds().max(1);
        let severity = if age_ms > threshold_ms * 4 {
            AlertSeverity::Critical
        } else if age_ms > threshold_ms * 2 {
            AlertSeverity::Error
        } else {
            AlertSeverity::Warning
        };

        let alert = Alert::new(
            Some(notification.id.clone()),
            AlertType::StuckProcessing,
            severity,
            format!(
                "notification {} has been processing for {}s",
                notification.id,
                age_ms / 1000
            ),
            serde_json::json!({
                "channel": notification.channel,
                "age_ms": age_ms,
            }),
        );
        self.alerts.raise_once(&alert).await?;
        metrics::counter!("recovery.stuck_alerts_total").increment(1);
        Ok(())
    }

    async fn orphan_pass(&self, report: &mut ReconcileReport) -> Result<()> {
        let threshold = chrono::Duration::from_std(self.config.orphan_threshold)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let count = self
            .notifications
            .count_stale_pending(Utc::now() - threshold)
            .await?;
        report.orphan_count = count;
        metrics::gauge!("recovery.orphaned_pending").set(count as f64);

        if count < self.config.orphan_alert_threshold {
            return Ok(());
        }

        let severity = if count >= self.config.orphan_critical_threshold {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        };

        let alert = Alert::new(
            None,
            AlertType::OrphanedPending,
            severity,
            format!("{} notifications pending past the outbox pipeline window", count),
            serde_json::json!({ "count": count }),
        );
        self.alerts.raise_once(&alert).await?;
        warn!(count = count, severity = %severity, "Orphaned pending notifications");
        Ok(())
    }

    /// Operator-initiated retry from an alert: reset the notification to
    /// pending with a fresh outbox row, optionally appending a warning to
    /// the message body, and resolve the alert.
    pub async fn retry_from_alert(
        &self,
        alert_id: &str,
        warning_note: Option<&str>,
    ) -> Result<()> {
        let alert = self
            .alerts
            .get_alert(alert_id)
            .await?
            .ok_or_else(|| RecoveryError::Store(StoreError::NotFound(alert_id.to_string())))?;
        let notification_id = alert
            .notification_id
            .as_ref()
            .ok_or_else(|| RecoveryError::NotRetryable(alert_id.to_string()))?;

        let notification = self
            .notifications
            .get(notification_id)
            .await?
            .ok_or_else(|| {
                RecoveryError::Store(StoreError::NotFound(notification_id.to_string()))
            })?;

        let new_content = warning_note
            .map(|note| append_warning(&notification.content, &notification.channel, note));

        let mut retry = notification.clone();
        if let Some(content) = &new_content {
            retry.content = content.clone();
        }
        let outbox = direct_outbox_row(&retry)?;

        self.notifications
            .reset_to_pending_with_outbox(notification_id, new_content.as_ref(), &outbox)
            .await?;
        self.alerts.resolve(alert_id).await?;

        info!(
            notification_id = %notification_id,
            alert_id = %alert_id,
            "Operator retry queued"
        );
        Ok(())
    }
}

/// Fresh outbox row targeting the notification's channel topic directly.
/// Recovery resets never go back through the delayed topic; any original
/// schedule has long passed by the time the reconciler acts.
fn direct_outbox_row(notification: &Notification) -> Result<OutboxRow> {
    let payload = NotificationPayload::from_notification(notification);
    Ok(OutboxRow::new(
        notification.id.clone(),
        channel_topic(&notification.channel),
        serde_json::to_string(&payload)?,
    ))
}

/// Append a warning line into the channel's message slot when it exists,
/// otherwise into the top-level message.
fn append_warning(content: &serde_json::Value, channel: &str, note: &str) -> serde_json::Value {
    let mut content = content.clone();

    if let Some(slot) = content
        .get_mut(channel)
        .and_then(|slot| slot.as_object_mut())
    {
        let message = slot
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or_default();
        let appended = if message.is_empty() {
            note.to_string()
        } else {
            format!("{}\n{}", message, note)
        };
        slot.insert("message".to_string(), serde_json::Value::String(appended));
        return content;
    }

    if let Some(map) = content.as_object_mut() {
        let message = map
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or_default();
        let appended = if message.is_empty() {
            note.to_string()
        } else {
            format!("{}\n{}", message, note)
        };
        map.insert("message".to_string(), serde_json::Value::String(appended));
    }
    content
}

// ============================================================================
// Status-outbox drainer
// ============================================================================

/// Configuration for the status-outbox drainer.
#[derive(Debug, Clone)]
pub struct DrainerConfig {
    pub interval: Duration,
    pub batch_size: u32,
    pub claim_timeout_ms: u64,
    pub worker_id: String,
}

impl Default for DrainerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            batch_size: 100,
            claim_timeout_ms: 30_000,
            worker_id: format!("drainer-{}", std::process::id()),
        }
    }
}

/// Publishes status-outbox rows (written by ghost heals) to the status
/// topic so the sink fires the webhook.
pub struct StatusOutboxDrainer {
    status_outbox: Arc<dyn StatusOutboxStore>,
    notifications: Arc<dyn NotificationStore>,
    publisher: Arc<dyn BusPublisher>,
    config: DrainerConfig,
}

impl StatusOutboxDrainer {
    pub fn new(
        status_outbox: Arc<dyn StatusOutboxStore>,
        notifications: Arc<dyn NotificationStore>,
        publisher: Arc<dyn BusPublisher>,
        config: DrainerConfig,
    ) -> Self {
        Self {
            status_outbox,
            notifications,
            publisher,
            config,
        }
    }

    /// Run the drain loop until cancelled.
    pub async fn run(&self) {
        info!(
            interval_ms = %self.config.interval.as_millis(),
            "Starting status-outbox drainer"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if let Err(e) = self.drain_once().await {
                error!(error = %e, "Status-outbox drain failed");
            }
        }
    }

    /// Claim and publish one batch of unprocessed rows.
    pub async fn drain_once(&self) -> Result<usize> {
        let rows = self
            .status_outbox
            .claim_unprocessed(
                &self.config.worker_id,
                self.config.batch_size,
                self.config.claim_timeout_ms,
            )
            .await?;

        if rows.is_empty() {
            return Ok(0);
        }

        let mut published_ids = Vec::new();
        for row in rows {
            let Some(notification) = self.notifications.get(&row.notification_id).await? else {
                warn!(
                    notification_id = %row.notification_id,
                    "Status-outbox row for missing notification; marking processed"
                );
                published_ids.push(row.id);
                continue;
            };

            let status = StatusMessage {
                notification_id: notification.id.clone(),
                request_id: notification.request_id,
                client_id: notification.client_id,
                channel: notification.channel.clone(),
                status: row.status,
                message: row.message.clone(),
                retry_count: notification.retry_count,
                webhook_url: notification.webhook_url.clone(),
                created_at: Utc::now(),
            };

            match self
                .publisher
                .publish(TopicMessage::new(
                    STATUS_TOPIC,
                    notification.id.clone(),
                    serde_json::to_string(&status)?,
                ))
                .await
            {
                Ok(_) => {
                    debug!(
                        notification_id = %notification.id,
                        status = %row.status,
                        "Status-outbox row published"
                    );
                    published_ids.push(row.id);
                }
                Err(e) => {
                    // Claim lease arbitrates the retry
                    warn!(
                        notification_id = %notification.id,
                        error = %e,
                        "Status-outbox publish failed; row stays claimed"
                    );
                }
            }
        }

        let count = published_ids.len();
        self.status_outbox.mark_processed(&published_ids).await?;
        metrics::counter!("recovery.status_drained_total").increment(count as u64);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nh_bus::MemoryBus;
    use nh_common::NotificationStatus;
    use nh_coord::{MemoryCoord, MemoryCoordConfig, RateLimits};
    use nh_store::sqlite::SqliteStore;
    use nh_store::OutboxStore;
    use sqlx::sqlite::SqlitePoolOptions;
    use uuid::Uuid;

    async fn store() -> Arc<SqliteStore> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = Arc::new(SqliteStore::new(pool));
        store.init_schema().await.unwrap();
        store
    }

    fn coord() -> MemoryCoord {
        MemoryCoord::new(
            MemoryCoordConfig {
                worker_id: "w1".to_string(),
                ..Default::default()
            },
            RateLimits::new(100, 10.0),
        )
    }

    /// Insert a notification and push it to `processing` via the normal
    /// dispatcher path.
    async fn processing_notification(store: &SqliteStore) -> Notification {
        let now = Utc::now();
        let n = Notification {
            id: Uuid::new_v4().to_string(),
            request_id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            channel: "email".to_string(),
            provider: None,
            recipient: serde_json::json!({"email": "a@x"}),
            content: serde_json::json!({"email": {"subject": "s", "message": "m"}}),
            variables: None,
            webhook_url: "http://w/1".to_string(),
            status: NotificationStatus::Pending,
            scheduled_at: None,
            retry_count: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        let row = OutboxRow::new(n.id.clone(), channel_topic("email"), "{}".to_string());
        store.insert_with_outbox(&n, &row).await.unwrap();

        let claimed = store.claim_pending("w1", 10, 30_000).await.unwrap();
        store
            .mark_published(&[claimed[0].id.clone()], &[n.id.clone()])
            .await
            .unwrap();
        n
    }

    fn reconciler(
        store: Arc<SqliteStore>,
        coord: MemoryCoord,
        config: ReconcilerConfig,
    ) -> Reconciler {
        Reconciler::new(
            store.clone(),
            store,
            Arc::new(coord.clone()),
            Arc::new(coord),
            config,
        )
    }

    fn aggressive_config() -> ReconcilerConfig {
        ReconcilerConfig {
            processing_ttl: Duration::ZERO,
            orphan_threshold: Duration::ZERO,
            orphan_alert_threshold: 1,
            orphan_critical_threshold: 3,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_ghost_delivery_healed_once() {
        let store = store().await;
        let coord = coord();
        let n = processing_notification(&store).await;

        // The send succeeded but the consumer never wrote the terminal row
        coord.set_delivered(&n.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let reconciler = reconciler(store.clone(), coord, aggressive_config());
        let report = reconciler.reconcile_once().await.unwrap().unwrap();
        assert_eq!(report.ghosts_healed, 1);

        let fetched = store.get(&n.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, NotificationStatus::Delivered);

        // Exactly one warning alert
        let alerts = store.unresolved(10).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::GhostDelivery);
        assert_eq!(alerts[0].severity, AlertSeverity::Warning);

        // Second pass: nothing further to heal, no extra alert
        let report = reconciler.reconcile_once().await.unwrap().unwrap();
        assert_eq!(report.ghosts_healed, 0);
        assert_eq!(store.unresolved(10).await.unwrap().len(), 1);

        // The heal queued exactly one status-outbox row
        let rows = store.claim_unprocessed("d1", 10, 30_000).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, TerminalStatus::Delivered);
    }

    #[tokio::test]
    async fn test_stuck_without_record_resets_with_outbox_row() {
        let store = store().await;
        let coord = coord();
        let n = processing_notification(&store).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        // No idempotency record at all: the send never started
        let reconciler = reconciler(store.clone(), coord, aggressive_config());
        let report = reconciler.reconcile_once().await.unwrap().unwrap();
        assert_eq!(report.orphans_reset, 1);

        let fetched = store.get(&n.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, NotificationStatus::Pending);
        // A fresh outbox row awaits the dispatcher
        assert_eq!(store.count_pending().await.unwrap(), 1);

        // Idempotent: the reset notification is pending, not processing
        let report = reconciler.reconcile_once().await.unwrap().unwrap();
        assert_eq!(report.orphans_reset, 0);
        assert_eq!(store.count_pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_live_processing_lock_raises_stuck_alert_once() {
        let store = store().await;
        let coord = coord();
        let n = processing_notification(&store).await;

        coord.try_acquire(&n.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let reconciler = reconciler(store.clone(), coord, aggressive_config());
        let report = reconciler.reconcile_once().await.unwrap().unwrap();
        assert_eq!(report.stuck_alerts, 1);

        let alerts = store.unresolved(10).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::StuckProcessing);

        // P8: a second run adds no second alert
        reconciler.reconcile_once().await.unwrap();
        assert_eq!(store.unresolved(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_orphan_pass_escalates_severity() {
        let store = store().await;
        let coord = coord();

        // One stale pending row: warning
        let now = Utc::now();
        for i in 0..1 {
            let n = Notification {
                id: format!("orphan-{}", i),
                request_id: Uuid::new_v4(),
                client_id: Uuid::new_v4(),
                channel: "email".to_string(),
                provider: None,
                recipient: serde_json::json!({"email": "a@x"}),
                content: serde_json::json!({"message": "m"}),
                variables: None,
                webhook_url: "http://w/1".to_string(),
                status: NotificationStatus::Pending,
                scheduled_at: None,
                retry_count: 0,
                error_message: None,
                created_at: now,
                updated_at: now,
            };
            let row = OutboxRow::new(n.id.clone(), channel_topic("email"), "{}".to_string());
            store.insert_with_outbox(&n, &row).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let reconciler = reconciler(store.clone(), coord, aggressive_config());
        let report = reconciler.reconcile_once().await.unwrap().unwrap();
        assert_eq!(report.orphan_count, 1);

        let open = store
            .find_open(None, AlertType::OrphanedPending)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(open.severity, AlertSeverity::Warning);

        // Grow past the critical threshold: the open alert escalates
        for i in 1..4 {
            let n = Notification {
                id: format!("orphan-{}", i),
                request_id: Uuid::new_v4(),
                client_id: Uuid::new_v4(),
                channel: "email".to_string(),
                provider: None,
                recipient: serde_json::json!({"email": "a@x"}),
                content: serde_json::json!({"message": "m"}),
                variables: None,
                webhook_url: "http://w/1".to_string(),
                status: NotificationStatus::Pending,
                scheduled_at: None,
                retry_count: 0,
                error_message: None,
                created_at: now,
                updated_at: now,
            };
            let row = OutboxRow::new(n.id.clone(), channel_topic("email"), "{}".to_string());
            store.insert_with_outbox(&n, &row).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        reconciler.reconcile_once().await.unwrap();
        let open = store
            .find_open(None, AlertType::OrphanedPending)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(open.severity, AlertSeverity::Critical);
        assert_eq!(open.metadata["count"], 4);
    }

    #[tokio::test]
    async fn test_drainer_publishes_healed_status() {
        let store = store().await;
        let coord = coord();
        let bus = MemoryBus::new();
        let n = processing_notification(&store).await;

        coord.set_delivered(&n.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let reconciler = reconciler(store.clone(), coord, aggressive_config());
        reconciler.reconcile_once().await.unwrap();

        let drainer = StatusOutboxDrainer::new(
            store.clone(),
            store.clone(),
            Arc::new(bus.clone()),
            DrainerConfig {
                worker_id: "d1".to_string(),
                ..Default::default()
            },
        );
        let drained = drainer.drain_once().await.unwrap();
        assert_eq!(drained, 1);

        let statuses = bus.drain(STATUS_TOPIC);
        assert_eq!(statuses.len(), 1);
        let status: StatusMessage = serde_json::from_str(&statuses[0]).unwrap();
        assert_eq!(status.notification_id, n.id);
        assert_eq!(status.status, TerminalStatus::Delivered);
        assert_eq!(status.webhook_url, "http://w/1");

        // Nothing left on a second drain
        assert_eq!(drainer.drain_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retry_from_alert_appends_warning_channel_shaped() {
        let store = store().await;
        let coord = coord();
        let n = processing_notification(&store).await;

        coord.try_acquire(&n.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let reconciler = reconciler(store.clone(), coord, aggressive_config());
        reconciler.reconcile_once().await.unwrap();

        let alert = store
            .find_open(Some(&n.id), AlertType::StuckProcessing)
            .await
            .unwrap()
            .unwrap();

        reconciler
            .retry_from_alert(&alert.id, Some("[delayed: retried by operator]"))
            .await
            .unwrap();

        let fetched = store.get(&n.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, NotificationStatus::Pending);
        let message = fetched.content["email"]["message"].as_str().unwrap();
        assert!(message.contains("m\n[delayed: retried by operator]"));

        // The alert is resolved and a fresh outbox row exists
        let resolved = store.get_alert(&alert.id).await.unwrap().unwrap();
        assert!(resolved.resolved);
        assert!(store
            .find_open(Some(&n.id), AlertType::StuckProcessing)
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.count_pending().await.unwrap(), 1);
    }

    #[test]
    fn test_append_warning_flat_content() {
        let content = serde_json::json!({"message": "hello"});
        let out = append_warning(&content, "email", "note");
        assert_eq!(out["message"], "hello\nnote");

        // No message slot at all: one is created
        let content = serde_json::json!({"subject": "s"});
        let out = append_warning(&content, "email", "note");
        assert_eq!(out["message"], "note");
    }
}
