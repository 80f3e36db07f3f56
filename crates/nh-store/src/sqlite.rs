//! SQLite store backend.
//!
//! Backs embedded deployments and the test suite. The U1 ingest invariant
//! is enforced by a partial unique index over the active statuses, and the
//! notification/outbox pairings run inside sqlx transactions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info};

use crate::{from_millis, to_millis, Result, StoreError};
use crate::{AlertStore, NotificationStore, OutboxStore, StatusOutboxStore};
use nh_common::{
    Alert, AlertSeverity, AlertType, Notification, NotificationStatus, OutboxRow, OutboxStatus,
    StatusOutboxRow, TerminalStatus,
};

/// SQLite implementation of every store repository.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS notifications (
                id TEXT PRIMARY KEY,
                request_id TEXT NOT NULL,
                client_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                provider TEXT,
                recipient TEXT NOT NULL,
                content TEXT NOT NULL,
                variables TEXT,
                webhook_url TEXT NOT NULL,
                status INTEGER NOT NULL DEFAULT 0,
                scheduled_at INTEGER,
                retry_count INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        // U1: one active row per (request_id, channel); failed rows exempt
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_notifications_active_request
            ON notifications (request_id, channel)
            WHERE status IN (0, 1, 2)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_notifications_status_updated
            ON notifications (status, updated_at)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_notifications_status_created
            ON notifications (status, created_at)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox (
                id TEXT PRIMARY KEY,
                notification_id TEXT NOT NULL,
                topic TEXT NOT NULL,
                payload TEXT NOT NULL,
                status INTEGER NOT NULL DEFAULT 0,
                claimed_by TEXT,
                claimed_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_outbox_status_created
            ON outbox (status, created_at)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS status_outbox (
                id TEXT PRIMARY KEY,
                notification_id TEXT NOT NULL,
                status TEXT NOT NULL,
                message TEXT,
                processed INTEGER NOT NULL DEFAULT 0,
                claimed_by TEXT,
                claimed_at INTEGER,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
                id TEXT PRIMARY KEY,
                notification_id TEXT,
                alert_type TEXT NOT NULL,
                severity TEXT NOT NULL,
                message TEXT NOT NULL,
                metadata TEXT NOT NULL,
                resolved INTEGER NOT NULL DEFAULT 0,
                resolved_at INTEGER,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        // A1: one unresolved alert per (notification_id, alert_type)
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_alerts_open
            ON alerts (COALESCE(notification_id, ''), alert_type)
            WHERE resolved = 0
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_alerts_resolved_created
            ON alerts (resolved, created_at)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        info!("SQLite store schema initialized");
        Ok(())
    }

    fn parse_notification(row: &sqlx::sqlite::SqliteRow) -> Result<Notification> {
        let recipient: String = row.get("recipient");
        let content: String = row.get("content");
        let variables: Option<String> = row.get("variables");
        let request_id: String = row.get("request_id");
        let client_id: String = row.get("client_id");

        Ok(Notification {
            id: row.get("id"),
            request_id: request_id
                .parse()
                .map_err(|e| StoreError::Database(format!("bad request_id: {}", e)))?,
            client_id: client_id
                .parse()
                .map_err(|e| StoreError::Database(format!("bad client_id: {}", e)))?,
            channel: row.get("channel"),
            provider: row.get("provider"),
            recipient: serde_json::from_str(&recipient)?,
            content: serde_json::from_str(&content)?,
            variables: variables.map(|v| serde_json::from_str(&v)).transpose()?,
            webhook_url: row.get("webhook_url"),
            status: NotificationStatus::from_code(row.get("status")),
            scheduled_at: row
                .get::<Option<i64>, _>("scheduled_at")
                .map(from_millis),
            retry_count: row.get("retry_count"),
            error_message: row.get("error_message"),
            created_at: from_millis(row.get("created_at")),
            updated_at: from_millis(row.get("updated_at")),
        })
    }

    fn parse_outbox_row(row: &sqlx::sqlite::SqliteRow) -> OutboxRow {
        OutboxRow {
            id: row.get("id"),
            notification_id: row.get("notification_id"),
            topic: row.get("topic"),
            payload: row.get("payload"),
            status: OutboxStatus::from_code(row.get("status")),
            claimed_by: row.get("claimed_by"),
            claimed_at: row.get::<Option<i64>, _>("claimed_at").map(from_millis),
            created_at: from_millis(row.get("created_at")),
            updated_at: from_millis(row.get("updated_at")),
        }
    }

    fn parse_status_outbox_row(row: &sqlx::sqlite::SqliteRow) -> StatusOutboxRow {
        let status: String = row.get("status");
        StatusOutboxRow {
            id: row.get("id"),
            notification_id: row.get("notification_id"),
            status: if status == "delivered" {
                TerminalStatus::Delivered
            } else {
                TerminalStatus::Failed
            },
            message: row.get("message"),
            processed: row.get::<i64, _>("processed") != 0,
            claimed_by: row.get("claimed_by"),
            claimed_at: row.get::<Option<i64>, _>("claimed_at").map(from_millis),
            created_at: from_millis(row.get("created_at")),
        }
    }

    fn parse_alert(row: &sqlx::sqlite::SqliteRow) -> Result<Alert> {
        let alert_type: String = row.get("alert_type");
        let severity: String = row.get("severity");
        let metadata: String = row.get("metadata");

        Ok(Alert {
            id: row.get("id"),
            notification_id: row.get("notification_id"),
            alert_type: parse_alert_type(&alert_type)?,
            severity: parse_severity(&severity)?,
            message: row.get("message"),
            metadata: serde_json::from_str(&metadata)?,
            resolved: row.get::<i64, _>("resolved") != 0,
            resolved_at: row.get::<Option<i64>, _>("resolved_at").map(from_millis),
            created_at: from_millis(row.get("created_at")),
        })
    }

    async fn insert_outbox_tx(
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        outbox: &OutboxRow,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox (id, notification_id, topic, payload, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&outbox.id)
        .bind(&outbox.notification_id)
        .bind(&outbox.topic)
        .bind(&outbox.payload)
        .bind(outbox.status.code())
        .bind(to_millis(outbox.created_at))
        .bind(to_millis(outbox.updated_at))
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Database(db)
            if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation)
    )
}

fn parse_alert_type(s: &str) -> Result<AlertType> {
    match s {
        "ghost_delivery" => Ok(AlertType::GhostDelivery),
        "stuck_processing" => Ok(AlertType::StuckProcessing),
        "orphaned_pending" => Ok(AlertType::OrphanedPending),
        other => Err(StoreError::Database(format!("unknown alert type: {}", other))),
    }
}

fn parse_severity(s: &str) -> Result<AlertSeverity> {
    match s {
        "warning" => Ok(AlertSeverity::Warning),
        "error" => Ok(AlertSeverity::Error),
        "critical" => Ok(AlertSeverity::Critical),
        other => Err(StoreError::Database(format!("unknown severity: {}", other))),
    }
}

#[async_trait]
impl NotificationStore for SqliteStore {
    async fn insert_with_outbox(
        &self,
        notification: &Notification,
        outbox: &OutboxRow,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let insert = sqlx::query(
            r#"
            INSERT INTO notifications
                (id, request_id, client_id, channel, provider, recipient, content,
                 variables, webhook_url, status, scheduled_at, retry_count,
                 error_message, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&notification.id)
        .bind(notification.request_id.to_string())
        .bind(notification.client_id.to_string())
        .bind(&notification.channel)
        .bind(&notification.provider)
        .bind(serde_json::to_string(&notification.recipient)?)
        .bind(serde_json::to_string(&notification.content)?)
        .bind(
            notification
                .variables
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(&notification.webhook_url)
        .bind(notification.status.code())
        .bind(notification.scheduled_at.map(to_millis))
        .bind(notification.retry_count)
        .bind(&notification.error_message)
        .bind(to_millis(notification.created_at))
        .bind(to_millis(notification.updated_at))
        .execute(&mut *tx)
        .await;

        if let Err(e) = insert {
            if is_unique_violation(&e) {
                return Err(StoreError::Duplicate {
                    request_id: notification.request_id.to_string(),
                    channel: notification.channel.clone(),
                });
            }
            return Err(db_err(e));
        }

        Self::insert_outbox_tx(&mut tx, outbox).await?;
        tx.commit().await.map_err(db_err)?;

        debug!(
            notification_id = %notification.id,
            channel = %notification.channel,
            "Notification and outbox row created"
        );
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Notification>> {
        let row = sqlx::query("SELECT * FROM notifications WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.map(|r| Self::parse_notification(&r)).transpose()
    }

    async fn set_terminal(
        &self,
        id: &str,
        status: TerminalStatus,
        error_message: Option<&str>,
        retry_count: i32,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = ?, error_message = ?, retry_count = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_notification_status().code())
        .bind(error_message)
        .bind(retry_count)
        .bind(to_millis(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_stuck_processing(
        &self,
        updated_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Notification>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM notifications
            WHERE status = ? AND updated_at < ?
            ORDER BY updated_at
            LIMIT ?
            "#,
        )
        .bind(NotificationStatus::Processing.code())
        .bind(to_millis(updated_before))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(Self::parse_notification).collect()
    }

    async fn count_stale_pending(&self, created_before: DateTime<Utc>) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) as count FROM notifications WHERE status = ? AND created_at < ?",
        )
        .bind(NotificationStatus::Pending.code())
        .bind(to_millis(created_before))
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.get::<i64, _>("count") as u64)
    }

    async fn reset_to_pending_with_outbox(
        &self,
        id: &str,
        new_content: Option<&serde_json::Value>,
        outbox: &OutboxRow,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let now = to_millis(Utc::now());

        let result = if let Some(content) = new_content {
            sqlx::query(
                r#"
                UPDATE notifications
                SET status = ?, content = ?, error_message = NULL, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(NotificationStatus::Pending.code())
            .bind(serde_json::to_string(content)?)
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await
        } else {
            sqlx::query(
                r#"
                UPDATE notifications
                SET status = ?, error_message = NULL, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(NotificationStatus::Pending.code())
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await
        };

        if result.map_err(db_err)?.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }

        Self::insert_outbox_tx(&mut tx, outbox).await?;
        tx.commit().await.map_err(db_err)?;

        info!(notification_id = %id, "Notification reset to pending with fresh outbox row");
        Ok(())
    }

    async fn heal_delivered(&self, id: &str, status_outbox: &StatusOutboxRow) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let result = sqlx::query(
            "UPDATE notifications SET status = ?, updated_at = ? WHERE id = ?",
        )
        .bind(NotificationStatus::Delivered.code())
        .bind(to_millis(Utc::now()))
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }

        sqlx::query(
            r#"
            INSERT INTO status_outbox (id, notification_id, status, message, processed, created_at)
            VALUES (?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(&status_outbox.id)
        .bind(&status_outbox.notification_id)
        .bind(status_outbox.status.to_string())
        .bind(&status_outbox.message)
        .bind(to_millis(status_outbox.created_at))
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn healthy(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }
}

#[async_trait]
impl OutboxStore for SqliteStore {
    async fn claim_pending(
        &self,
        worker_id: &str,
        limit: u32,
        lease_ms: u64,
    ) -> Result<Vec<OutboxRow>> {
        let now = Utc::now();
        let lease_cutoff = to_millis(now) - lease_ms as i64;

        let rows = sqlx::query(
            r#"
            UPDATE outbox
            SET claimed_by = ?, claimed_at = ?, updated_at = ?
            WHERE id IN (
                SELECT id FROM outbox
                WHERE status = 0 AND (claimed_at IS NULL OR claimed_at < ?)
                ORDER BY created_at
                LIMIT ?
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(to_millis(now))
        .bind(to_millis(now))
        .bind(lease_cutoff)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.iter().map(Self::parse_outbox_row).collect())
    }

    async fn mark_published(
        &self,
        row_ids: &[String],
        notification_ids_to_processing: &[String],
    ) -> Result<()> {
        if row_ids.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let now = to_millis(Utc::now());

        for row_id in row_ids {
            sqlx::query("UPDATE outbox SET status = ?, updated_at = ? WHERE id = ?")
                .bind(OutboxStatus::Published.code())
                .bind(now)
                .bind(row_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        for notification_id in notification_ids_to_processing {
            sqlx::query(
                "UPDATE notifications SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
            )
            .bind(NotificationStatus::Processing.code())
            .bind(now)
            .bind(notification_id)
            .bind(NotificationStatus::Pending.code())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn delete_published_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM outbox WHERE status = ? AND updated_at < ?")
            .bind(OutboxStatus::Published.code())
            .bind(to_millis(cutoff))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn count_pending(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM outbox WHERE status = 0")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.get::<i64, _>("count") as u64)
    }
}

#[async_trait]
impl StatusOutboxStore for SqliteStore {
    async fn claim_unprocessed(
        &self,
        worker_id: &str,
        limit: u32,
        lease_ms: u64,
    ) -> Result<Vec<StatusOutboxRow>> {
        let now = Utc::now();
        let lease_cutoff = to_millis(now) - lease_ms as i64;

        let rows = sqlx::query(
            r#"
            UPDATE status_outbox
            SET claimed_by = ?, claimed_at = ?
            WHERE id IN (
                SELECT id FROM status_outbox
                WHERE processed = 0 AND (claimed_at IS NULL OR claimed_at < ?)
                ORDER BY created_at
                LIMIT ?
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(to_millis(now))
        .bind(lease_cutoff)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.iter().map(Self::parse_status_outbox_row).collect())
    }

    async fn mark_processed(&self, row_ids: &[String]) -> Result<()> {
        for row_id in row_ids {
            sqlx::query("UPDATE status_outbox SET processed = 1 WHERE id = ?")
                .bind(row_id)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }
}

#[async_trait]
impl AlertStore for SqliteStore {
    async fn raise_once(&self, alert: &Alert) -> Result<bool> {
        // The partial unique index arbitrates races between reconcilers
        let insert = sqlx::query(
            r#"
            INSERT INTO alerts
                (id, notification_id, alert_type, severity, message, metadata,
                 resolved, resolved_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, 0, NULL, ?)
            "#,
        )
        .bind(&alert.id)
        .bind(&alert.notification_id)
        .bind(alert.alert_type.to_string())
        .bind(alert.severity.to_string())
        .bind(&alert.message)
        .bind(serde_json::to_string(&alert.metadata)?)
        .bind(to_millis(alert.created_at))
        .execute(&self.pool)
        .await;

        match insert {
            Ok(_) => Ok(true),
            Err(e) if is_unique_violation(&e) => {
                // Escalate in place when the situation worsened
                sqlx::query(
                    r#"
                    UPDATE alerts
                    SET severity = ?, message = ?, metadata = ?
                    WHERE COALESCE(notification_id, '') = COALESCE(?, '')
                      AND alert_type = ?
                      AND resolved = 0
                      AND CASE severity
                            WHEN 'warning' THEN 0
                            WHEN 'error' THEN 1
                            ELSE 2
                          END < ?
                    "#,
                )
                .bind(alert.severity.to_string())
                .bind(&alert.message)
                .bind(serde_json::to_string(&alert.metadata)?)
                .bind(&alert.notification_id)
                .bind(alert.alert_type.to_string())
                .bind(severity_rank(alert.severity))
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
                Ok(false)
            }
            Err(e) => Err(db_err(e)),
        }
    }

    async fn get_alert(&self, alert_id: &str) -> Result<Option<Alert>> {
        let row = sqlx::query("SELECT * FROM alerts WHERE id = ?")
            .bind(alert_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| Self::parse_alert(&r)).transpose()
    }

    async fn resolve(&self, alert_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE alerts SET resolved = 1, resolved_at = ? WHERE id = ? AND resolved = 0",
        )
        .bind(to_millis(Utc::now()))
        .bind(alert_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn unresolved(&self, limit: u32) -> Result<Vec<Alert>> {
        let rows = sqlx::query(
            "SELECT * FROM alerts WHERE resolved = 0 ORDER BY created_at DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(Self::parse_alert).collect()
    }

    async fn find_open(
        &self,
        notification_id: Option<&str>,
        alert_type: AlertType,
    ) -> Result<Option<Alert>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM alerts
            WHERE COALESCE(notification_id, '') = COALESCE(?, '')
              AND alert_type = ? AND resolved = 0
            "#,
        )
        .bind(notification_id)
        .bind(alert_type.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| Self::parse_alert(&r)).transpose()
    }
}

fn severity_rank(severity: AlertSeverity) -> i32 {
    match severity {
        AlertSeverity::Warning => 0,
        AlertSeverity::Error => 1,
        AlertSeverity::Critical => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use uuid::Uuid;

    async fn create_test_store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteStore::new(pool);
        store.init_schema().await.unwrap();
        store
    }

    fn notification(request_id: Uuid, channel: &str) -> Notification {
        let now = Utc::now();
        Notification {
            id: Uuid::new_v4().to_string(),
            request_id,
            client_id: Uuid::new_v4(),
            channel: channel.to_string(),
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
        }
    }

    fn outbox_for(n: &Notification) -> OutboxRow {
        OutboxRow::new(
            n.id.clone(),
            format!("{}_notification", n.channel),
            "{}".to_string(),
        )
    }

    #[tokio::test]
    async fn test_insert_creates_notification_and_outbox() {
        let store = create_test_store().await;
        let n = notification(Uuid::new_v4(), "email");
        let o = outbox_for(&n);

        store.insert_with_outbox(&n, &o).await.unwrap();

        let fetched = store.get(&n.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, NotificationStatus::Pending);
        assert_eq!(fetched.request_id, n.request_id);
        assert_eq!(store.count_pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_active_request_rejected() {
        let store = create_test_store().await;
        let request_id = Uuid::new_v4();

        let first = notification(request_id, "email");
        store
            .insert_with_outbox(&first, &outbox_for(&first))
            .await
            .unwrap();

        // Same (request_id, channel) while the first is pending
        let second = notification(request_id, "email");
        let err = store
            .insert_with_outbox(&second, &outbox_for(&second))
            .await
            .unwrap_err();
        assert!(err.is_duplicate());

        // A different channel under the same request id is fine
        let other_channel = notification(request_id, "whatsapp");
        store
            .insert_with_outbox(&other_channel, &outbox_for(&other_channel))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_row_does_not_block_resubmit() {
        let store = create_test_store().await;
        let request_id = Uuid::new_v4();

        let first = notification(request_id, "email");
        store
            .insert_with_outbox(&first, &outbox_for(&first))
            .await
            .unwrap();
        store
            .set_terminal(&first.id, TerminalStatus::Failed, Some("boom"), 3)
            .await
            .unwrap();

        let second = notification(request_id, "email");
        store
            .insert_with_outbox(&second, &outbox_for(&second))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_insert_leaves_no_orphan_outbox_row() {
        let store = create_test_store().await;
        let request_id = Uuid::new_v4();

        let first = notification(request_id, "email");
        store
            .insert_with_outbox(&first, &outbox_for(&first))
            .await
            .unwrap();

        let second = notification(request_id, "email");
        let _ = store
            .insert_with_outbox(&second, &outbox_for(&second))
            .await;

        // The rejected transaction must not have written its outbox row
        assert_eq!(store.count_pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_claim_respects_lease() {
        let store = create_test_store().await;
        let n = notification(Uuid::new_v4(), "email");
        store.insert_with_outbox(&n, &outbox_for(&n)).await.unwrap();

        let claimed = store.claim_pending("w1", 10, 30_000).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].claimed_by.as_deref(), Some("w1"));

        // Fresh claim is not reclaimable within the lease
        let reclaimed = store.claim_pending("w2", 10, 30_000).await.unwrap();
        assert!(reclaimed.is_empty());

        // A zero lease makes it reclaimable as soon as the clock moves
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let reclaimed = store.claim_pending("w2", 10, 0).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].claimed_by.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn test_mark_published_moves_notification_to_processing() {
        let store = create_test_store().await;
        let n = notification(Uuid::new_v4(), "email");
        let o = outbox_for(&n);
        store.insert_with_outbox(&n, &o).await.unwrap();

        let claimed = store.claim_pending("w1", 10, 30_000).await.unwrap();
        store
            .mark_published(
                &[claimed[0].id.clone()],
                &[claimed[0].notification_id.clone()],
            )
            .await
            .unwrap();

        let fetched = store.get(&n.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, NotificationStatus::Processing);
        assert_eq!(store.count_pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mark_published_skips_notification_for_scheduled() {
        let store = create_test_store().await;
        let n = notification(Uuid::new_v4(), "email");
        let o = OutboxRow::new(n.id.clone(), "delayed_notification".to_string(), "{}".into());
        store.insert_with_outbox(&n, &o).await.unwrap();

        let claimed = store.claim_pending("w1", 10, 30_000).await.unwrap();
        // Scheduled rows pass no notification ids
        store
            .mark_published(&[claimed[0].id.clone()], &[])
            .await
            .unwrap();

        let fetched = store.get(&n.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, NotificationStatus::Pending);
    }

    #[tokio::test]
    async fn test_retention_deletes_only_published() {
        let store = create_test_store().await;
        let n = notification(Uuid::new_v4(), "email");
        store.insert_with_outbox(&n, &outbox_for(&n)).await.unwrap();

        let claimed = store.claim_pending("w1", 10, 30_000).await.unwrap();
        store
            .mark_published(&[claimed[0].id.clone()], &[n.id.clone()])
            .await
            .unwrap();

        // Future cutoff removes the published row
        let deleted = store
            .delete_published_before(Utc::now() + chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
    }

    #[tokio::test]
    async fn test_reset_to_pending_creates_fresh_outbox_row() {
        let store = create_test_store().await;
        let n = notification(Uuid::new_v4(), "email");
        store.insert_with_outbox(&n, &outbox_for(&n)).await.unwrap();

        let claimed = store.claim_pending("w1", 10, 30_000).await.unwrap();
        store
            .mark_published(&[claimed[0].id.clone()], &[n.id.clone()])
            .await
            .unwrap();

        let fresh = OutboxRow::new(
            n.id.clone(),
            "email_notification".to_string(),
            "{}".to_string(),
        );
        store
            .reset_to_pending_with_outbox(&n.id, None, &fresh)
            .await
            .unwrap();

        let fetched = store.get(&n.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, NotificationStatus::Pending);
        assert_eq!(store.count_pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_heal_delivered_writes_status_outbox() {
        let store = create_test_store().await;
        let n = notification(Uuid::new_v4(), "email");
        store.insert_with_outbox(&n, &outbox_for(&n)).await.unwrap();

        let status_row = StatusOutboxRow::new(n.id.clone(), TerminalStatus::Delivered, None);
        store.heal_delivered(&n.id, &status_row).await.unwrap();

        let fetched = store.get(&n.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, NotificationStatus::Delivered);

        let claimed = store.claim_unprocessed("w1", 10, 30_000).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, TerminalStatus::Delivered);

        store
            .mark_processed(&[claimed[0].id.clone()])
            .await
            .unwrap();
        assert!(store
            .claim_unprocessed("w1", 10, 0)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_find_stuck_processing() {
        let store = create_test_store().await;
        let n = notification(Uuid::new_v4(), "email");
        store.insert_with_outbox(&n, &outbox_for(&n)).await.unwrap();

        let claimed = store.claim_pending("w1", 10, 30_000).await.unwrap();
        store
            .mark_published(&[claimed[0].id.clone()], &[n.id.clone()])
            .await
            .unwrap();

        // Not stuck relative to the past
        let stuck = store
            .find_stuck_processing(Utc::now() - chrono::Duration::seconds(60), 10)
            .await
            .unwrap();
        assert!(stuck.is_empty());

        // Stuck relative to the future
        let stuck = store
            .find_stuck_processing(Utc::now() + chrono::Duration::seconds(60), 10)
            .await
            .unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].id, n.id);
    }

    #[tokio::test]
    async fn test_alert_dedup_per_notification_and_type() {
        let store = create_test_store().await;

        let alert = Alert::new(
            Some("n-1".to_string()),
            AlertType::GhostDelivery,
            AlertSeverity::Warning,
            "ghost".to_string(),
            serde_json::json!({}),
        );
        assert!(store.raise_once(&alert).await.unwrap());

        // Same pair again: no second row
        let again = Alert::new(
            Some("n-1".to_string()),
            AlertType::GhostDelivery,
            AlertSeverity::Warning,
            "ghost again".to_string(),
            serde_json::json!({}),
        );
        assert!(!store.raise_once(&again).await.unwrap());
        assert_eq!(store.unresolved(10).await.unwrap().len(), 1);

        // A different type for the same notification is a new alert
        let stuck = Alert::new(
            Some("n-1".to_string()),
            AlertType::StuckProcessing,
            AlertSeverity::Error,
            "stuck".to_string(),
            serde_json::json!({}),
        );
        assert!(store.raise_once(&stuck).await.unwrap());

        // Resolving reopens the slot
        let open = store
            .find_open(Some("n-1"), AlertType::GhostDelivery)
            .await
            .unwrap()
            .unwrap();
        assert!(store.resolve(&open.id).await.unwrap());
        assert!(store.raise_once(&alert).await.unwrap());
    }

    #[tokio::test]
    async fn test_alert_escalates_severity_in_place() {
        let store = create_test_store().await;

        let warning = Alert::new(
            None,
            AlertType::OrphanedPending,
            AlertSeverity::Warning,
            "10 orphans".to_string(),
            serde_json::json!({"count": 10}),
        );
        assert!(store.raise_once(&warning).await.unwrap());

        let critical = Alert::new(
            None,
            AlertType::OrphanedPending,
            AlertSeverity::Critical,
            "150 orphans".to_string(),
            serde_json::json!({"count": 150}),
        );
        assert!(!store.raise_once(&critical).await.unwrap());

        let open = store
            .find_open(None, AlertType::OrphanedPending)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(open.severity, AlertSeverity::Critical);
        assert_eq!(open.metadata["count"], 150);
    }
}
