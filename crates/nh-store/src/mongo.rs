//! MongoDB store backend.
//!
//! Requires a replica set (the default URI pins one) so notification and
//! outbox writes can share a multi-document transaction. Opaque JSON
//! fields are stored as JSON strings and parsed at the boundary, keeping
//! both backends byte-compatible in what they accept.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::{FindOptions, IndexOptions, ReturnDocument};
use mongodb::{Client, ClientSession, Collection, Database, IndexModel};
use tracing::{debug, info};

use crate::{from_millis, to_millis, Result, StoreError};
use crate::{AlertStore, NotificationStore, OutboxStore, StatusOutboxStore};
use nh_common::{
    Alert, AlertSeverity, AlertType, Notification, NotificationStatus, OutboxRow, OutboxStatus,
    StatusOutboxRow, TerminalStatus,
};

const NOTIFICATIONS: &str = "notifications";
const OUTBOX: &str = "outbox";
const STATUS_OUTBOX: &str = "status_outbox";
const ALERTS: &str = "alerts";

/// MongoDB implementation of every store repository.
#[derive(Clone)]
pub struct MongoStore {
    client: Client,
    database: Database,
}

impl MongoStore {
    pub fn new(client: Client, db_name: &str) -> Self {
        let database = client.database(db_name);
        Self { client, database }
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    fn notifications(&self) -> Collection<Document> {
        self.database.collection(NOTIFICATIONS)
    }

    fn outbox(&self) -> Collection<Document> {
        self.database.collection(OUTBOX)
    }

    fn status_outbox(&self) -> Collection<Document> {
        self.database.collection(STATUS_OUTBOX)
    }

    fn alerts(&self) -> Collection<Document> {
        self.database.collection(ALERTS)
    }

    pub async fn init_schema(&self) -> Result<()> {
        // U1: one active row per (request_id, channel)
        let unique_active = IndexModel::builder()
            .keys(doc! { "request_id": 1, "channel": 1 })
            .options(
                IndexOptions::builder()
                    .unique(true)
                    .partial_filter_expression(doc! { "status": { "$in": [0, 1, 2] } })
                    .name("idx_active_request_channel".to_string())
                    .build(),
            )
            .build();
        let status_updated = IndexModel::builder()
            .keys(doc! { "status": 1, "updated_at": 1 })
            .options(IndexOptions::builder().name("idx_status_updated".to_string()).build())
            .build();
        let status_created = IndexModel::builder()
            .keys(doc! { "status": 1, "created_at": 1 })
            .options(IndexOptions::builder().name("idx_status_created".to_string()).build())
            .build();
        self.notifications()
            .create_indexes([unique_active, status_updated, status_created])
            .await
            .map_err(db_err)?;

        let outbox_poll = IndexModel::builder()
            .keys(doc! { "status": 1, "created_at": 1 })
            .options(IndexOptions::builder().name("idx_status_created".to_string()).build())
            .build();
        self.outbox().create_indexes([outbox_poll]).await.map_err(db_err)?;

        let status_outbox_poll = IndexModel::builder()
            .keys(doc! { "processed": 1, "created_at": 1 })
            .options(IndexOptions::builder().name("idx_processed_created".to_string()).build())
            .build();
        self.status_outbox()
            .create_indexes([status_outbox_poll])
            .await
            .map_err(db_err)?;

        // A1: one unresolved alert per (notification_id, alert_type)
        let alert_open = IndexModel::builder()
            .keys(doc! { "notification_id": 1, "alert_type": 1 })
            .options(
                IndexOptions::builder()
                    .unique(true)
                    .partial_filter_expression(doc! { "resolved": false })
                    .name("idx_alerts_open".to_string())
                    .build(),
            )
            .build();
        let alert_list = IndexModel::builder()
            .keys(doc! { "resolved": 1, "created_at": 1 })
            .options(IndexOptions::builder().name("idx_resolved_created".to_string()).build())
            .build();
        self.alerts()
            .create_indexes([alert_open, alert_list])
            .await
            .map_err(db_err)?;

        info!(database = %self.database.name(), "MongoDB store indexes initialized");
        Ok(())
    }

    async fn start_transaction(&self) -> Result<ClientSession> {
        let mut session = self.client.start_session().await.map_err(db_err)?;
        session.start_transaction().await.map_err(db_err)?;
        Ok(session)
    }
}

fn db_err(e: mongodb::error::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn is_duplicate_key(e: &mongodb::error::Error) -> bool {
    use mongodb::error::{ErrorKind, WriteFailure};
    match e.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(we)) => we.code == 11000,
        ErrorKind::Command(ce) => ce.code == 11000,
        _ => false,
    }
}

// ============================================================================
// Document codecs
// ============================================================================

pub(crate) fn notification_to_doc(n: &Notification) -> Result<Document> {
    let mut doc = doc! {
        "_id": &n.id,
        "request_id": n.request_id.to_string(),
        "client_id": n.client_id.to_string(),
        "channel": &n.channel,
        "recipient": serde_json::to_string(&n.recipient)?,
        "content": serde_json::to_string(&n.content)?,
        "webhook_url": &n.webhook_url,
        "status": n.status.code(),
        "retry_count": n.retry_count,
        "created_at": to_millis(n.created_at),
        "updated_at": to_millis(n.updated_at),
    };
    if let Some(provider) = &n.provider {
        doc.insert("provider", provider);
    }
    if let Some(variables) = &n.variables {
        doc.insert("variables", serde_json::to_string(variables)?);
    }
    if let Some(scheduled_at) = n.scheduled_at {
        doc.insert("scheduled_at", to_millis(scheduled_at));
    }
    if let Some(error) = &n.error_message {
        doc.insert("error_message", error);
    }
    Ok(doc)
}

pub(crate) fn doc_to_notification(doc: &Document) -> Result<Notification> {
    let request_id: uuid::Uuid = doc
        .get_str("request_id")
        .map_err(|e| StoreError::Database(e.to_string()))?
        .parse()
        .map_err(|e| StoreError::Database(format!("bad request_id: {}", e)))?;
    let client_id: uuid::Uuid = doc
        .get_str("client_id")
        .map_err(|e| StoreError::Database(e.to_string()))?
        .parse()
        .map_err(|e| StoreError::Database(format!("bad client_id: {}", e)))?;

    Ok(Notification {
        id: doc
            .get_str("_id")
            .map_err(|e| StoreError::Database(e.to_string()))?
            .to_string(),
        request_id,
        client_id,
        channel: doc
            .get_str("channel")
            .map_err(|e| StoreError::Database(e.to_string()))?
            .to_string(),
        provider: doc.get_str("provider").ok().map(String::from),
        recipient: serde_json::from_str(
            doc.get_str("recipient")
                .map_err(|e| StoreError::Database(e.to_string()))?,
        )?,
        content: serde_json::from_str(
            doc.get_str("content")
                .map_err(|e| StoreError::Database(e.to_string()))?,
        )?,
        variables: doc
            .get_str("variables")
            .ok()
            .map(serde_json::from_str)
            .transpose()?,
        webhook_url: doc
            .get_str("webhook_url")
            .map_err(|e| StoreError::Database(e.to_string()))?
            .to_string(),
        status: NotificationStatus::from_code(doc.get_i32("status").unwrap_or(0)),
        scheduled_at: doc.get_i64("scheduled_at").ok().map(from_millis),
        retry_count: doc.get_i32("retry_count").unwrap_or(0),
        error_message: doc.get_str("error_message").ok().map(String::from),
        created_at: from_millis(doc.get_i64("created_at").unwrap_or(0)),
        updated_at: from_millis(doc.get_i64("updated_at").unwrap_or(0)),
    })
}

pub(crate) fn outbox_to_doc(row: &OutboxRow) -> Document {
    let mut doc = doc! {
        "_id": &row.id,
        "notification_id": &row.notification_id,
        "topic": &row.topic,
        "payload": &row.payload,
        "status": row.status.code(),
        "created_at": to_millis(row.created_at),
        "updated_at": to_millis(row.updated_at),
    };
    if let Some(claimed_by) = &row.claimed_by {
        doc.insert("claimed_by", claimed_by);
    }
    if let Some(claimed_at) = row.claimed_at {
        doc.insert("claimed_at", to_millis(claimed_at));
    }
    doc
}

pub(crate) fn doc_to_outbox(doc: &Document) -> Result<OutboxRow> {
    Ok(OutboxRow {
        id: doc
            .get_str("_id")
            .map_err(|e| StoreError::Database(e.to_string()))?
            .to_string(),
        notification_id: doc
            .get_str("notification_id")
            .map_err(|e| StoreError::Database(e.to_string()))?
            .to_string(),
        topic: doc
            .get_str("topic")
            .map_err(|e| StoreError::Database(e.to_string()))?
            .to_string(),
        payload: doc
            .get_str("payload")
            .map_err(|e| StoreError::Database(e.to_string()))?
            .to_string(),
        status: OutboxStatus::from_code(doc.get_i32("status").unwrap_or(0)),
        claimed_by: doc.get_str("claimed_by").ok().map(String::from),
        claimed_at: doc.get_i64("claimed_at").ok().map(from_millis),
        created_at: from_millis(doc.get_i64("created_at").unwrap_or(0)),
        updated_at: from_millis(doc.get_i64("updated_at").unwrap_or(0)),
    })
}

fn doc_to_status_outbox(doc: &Document) -> Result<StatusOutboxRow> {
    Ok(StatusOutboxRow {
        id: doc
            .get_str("_id")
            .map_err(|e| StoreError::Database(e.to_string()))?
            .to_string(),
        notification_id: doc
            .get_str("notification_id")
            .map_err(|e| StoreError::Database(e.to_string()))?
            .to_string(),
        status: if doc.get_str("status").unwrap_or("failed") == "delivered" {
            TerminalStatus::Delivered
        } else {
            TerminalStatus::Failed
        },
        message: doc.get_str("message").ok().map(String::from),
        processed: doc.get_bool("processed").unwrap_or(false),
        claimed_by: doc.get_str("claimed_by").ok().map(String::from),
        claimed_at: doc.get_i64("claimed_at").ok().map(from_millis),
        created_at: from_millis(doc.get_i64("created_at").unwrap_or(0)),
    })
}

fn alert_to_doc(alert: &Alert) -> Result<Document> {
    Ok(doc! {
        "_id": &alert.id,
        "notification_id": alert.notification_id.as_deref().map(Bson::from).unwrap_or(Bson::Null),
        "alert_type": alert.alert_type.to_string(),
        "severity": alert.severity.to_string(),
        "message": &alert.message,
        "metadata": serde_json::to_string(&alert.metadata)?,
        "resolved": false,
        "created_at": to_millis(alert.created_at),
    })
}

fn doc_to_alert(doc: &Document) -> Result<Alert> {
    let alert_type = match doc.get_str("alert_type").unwrap_or_default() {
        "ghost_delivery" => AlertType::GhostDelivery,
        "stuck_processing" => AlertType::StuckProcessing,
        _ => AlertType::OrphanedPending,
    };
    let severity = match doc.get_str("severity").unwrap_or_default() {
        "critical" => AlertSeverity::Critical,
        "error" => AlertSeverity::Error,
        _ => AlertSeverity::Warning,
    };
    Ok(Alert {
        id: doc
            .get_str("_id")
            .map_err(|e| StoreError::Database(e.to_string()))?
            .to_string(),
        notification_id: doc.get_str("notification_id").ok().map(String::from),
        alert_type,
        severity,
        message: doc.get_str("message").unwrap_or_default().to_string(),
        metadata: serde_json::from_str(doc.get_str("metadata").unwrap_or("{}"))?,
        resolved: doc.get_bool("resolved").unwrap_or(false),
        resolved_at: doc.get_i64("resolved_at").ok().map(from_millis),
        created_at: from_millis(doc.get_i64("created_at").unwrap_or(0)),
    })
}

fn severity_below(severity: AlertSeverity) -> Vec<&'static str> {
    match severity {
        AlertSeverity::Warning => vec![],
        AlertSeverity::Error => vec!["warning"],
        AlertSeverity::Critical => vec!["warning", "error"],
    }
}

// ============================================================================
// Repositories
// ============================================================================

#[async_trait]
impl NotificationStore for MongoStore {
    async fn insert_with_outbox(
        &self,
        notification: &Notification,
        outbox: &OutboxRow,
    ) -> Result<()> {
        let notification_doc = notification_to_doc(notification)?;
        let outbox_doc = outbox_to_doc(outbox);

        let mut session = self.start_transaction().await?;

        let insert = self
            .notifications()
            .insert_one(notification_doc)
            .session(&mut session)
            .await;

        if let Err(e) = insert {
            let _ = session.abort_transaction().await;
            if is_duplicate_key(&e) {
                return Err(StoreError::Duplicate {
                    request_id: notification.request_id.to_string(),
                    channel: notification.channel.clone(),
                });
            }
            return Err(db_err(e));
        }

        if let Err(e) = self
            .outbox()
            .insert_one(outbox_doc)
            .session(&mut session)
            .await
        {
            let _ = session.abort_transaction().await;
            return Err(db_err(e));
        }

        session.commit_transaction().await.map_err(db_err)?;

        debug!(
            notification_id = %notification.id,
            channel = %notification.channel,
            "Notification and outbox row created"
        );
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Notification>> {
        let doc = self
            .notifications()
            .find_one(doc! { "_id": id })
            .await
            .map_err(db_err)?;
        doc.as_ref().map(doc_to_notification).transpose()
    }

    async fn set_terminal(
        &self,
        id: &str,
        status: TerminalStatus,
        error_message: Option<&str>,
        retry_count: i32,
    ) -> Result<bool> {
        let mut set = doc! {
            "status": status.as_notification_status().code(),
            "retry_count": retry_count,
            "updated_at": to_millis(Utc::now()),
        };
        if let Some(error) = error_message {
            set.insert("error_message", error);
        }

        let result = self
            .notifications()
            .update_one(doc! { "_id": id }, doc! { "$set": set })
            .await
            .map_err(db_err)?;

        Ok(result.matched_count > 0)
    }

    async fn find_stuck_processing(
        &self,
        updated_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Notification>> {
        use futures::stream::TryStreamExt;

        let filter = doc! {
            "status": NotificationStatus::Processing.code(),
            "updated_at": { "$lt": to_millis(updated_before) },
        };
        let options = FindOptions::builder()
            .sort(doc! { "updated_at": 1 })
            .limit(limit as i64)
            .build();

        let mut cursor = self
            .notifications()
            .find(filter)
            .with_options(options)
            .await
            .map_err(db_err)?;

        let mut notifications = Vec::new();
        while let Some(doc) = cursor.try_next().await.map_err(db_err)? {
            notifications.push(doc_to_notification(&doc)?);
        }
        Ok(notifications)
    }

    async fn count_stale_pending(&self, created_before: DateTime<Utc>) -> Result<u64> {
        let filter = doc! {
            "status": NotificationStatus::Pending.code(),
            "created_at": { "$lt": to_millis(created_before) },
        };
        self.notifications()
            .count_documents(filter)
            .await
            .map_err(db_err)
    }

    async fn reset_to_pending_with_outbox(
        &self,
        id: &str,
        new_content: Option<&serde_json::Value>,
        outbox: &OutboxRow,
    ) -> Result<()> {
        let mut set = doc! {
            "status": NotificationStatus::Pending.code(),
            "updated_at": to_millis(Utc::now()),
        };
        if let Some(content) = new_content {
            set.insert("content", serde_json::to_string(content)?);
        }

        let mut session = self.start_transaction().await?;

        let update = self
            .notifications()
            .update_one(
                doc! { "_id": id },
                doc! { "$set": set, "$unset": { "error_message": "" } },
            )
            .session(&mut session)
            .await;

        match update {
            Ok(result) if result.matched_count == 0 => {
                let _ = session.abort_transaction().await;
                return Err(StoreError::NotFound(id.to_string()));
            }
            Ok(_) => {}
            Err(e) => {
                let _ = session.abort_transaction().await;
                return Err(db_err(e));
            }
        }

        if let Err(e) = self
            .outbox()
            .insert_one(outbox_to_doc(outbox))
            .session(&mut session)
            .await
        {
            let _ = session.abort_transaction().await;
            return Err(db_err(e));
        }

        session.commit_transaction().await.map_err(db_err)?;
        info!(notification_id = %id, "Notification reset to pending with fresh outbox row");
        Ok(())
    }

    async fn heal_delivered(&self, id: &str, status_outbox: &StatusOutboxRow) -> Result<()> {
        let status_doc = doc! {
            "_id": &status_outbox.id,
            "notification_id": &status_outbox.notification_id,
            "status": status_outbox.status.to_string(),
            "message": status_outbox.message.as_deref().map(Bson::from).unwrap_or(Bson::Null),
            "processed": false,
            "created_at": to_millis(status_outbox.created_at),
        };

        let mut session = self.start_transaction().await?;

        let update = self
            .notifications()
            .update_one(
                doc! { "_id": id },
                doc! { "$set": {
                    "status": NotificationStatus::Delivered.code(),
                    "updated_at": to_millis(Utc::now()),
                }},
            )
            .session(&mut session)
            .await;

        match update {
            Ok(result) if result.matched_count == 0 => {
                let _ = session.abort_transaction().await;
                return Err(StoreError::NotFound(id.to_string()));
            }
            Ok(_) => {}
            Err(e) => {
                let _ = session.abort_transaction().await;
                return Err(db_err(e));
            }
        }

        if let Err(e) = self
            .status_outbox()
            .insert_one(status_doc)
            .session(&mut session)
            .await
        {
            let _ = session.abort_transaction().await;
            return Err(db_err(e));
        }

        session.commit_transaction().await.map_err(db_err)?;
        Ok(())
    }

    async fn healthy(&self) -> bool {
        self.database
            .run_command(doc! { "ping": 1 })
            .await
            .is_ok()
    }
}

#[async_trait]
impl OutboxStore for MongoStore {
    async fn claim_pending(
        &self,
        worker_id: &str,
        limit: u32,
        lease_ms: u64,
    ) -> Result<Vec<OutboxRow>> {
        use futures::stream::TryStreamExt;

        let now = Utc::now();
        let lease_cutoff = to_millis(now) - lease_ms as i64;
        let claimable = doc! {
            "status": OutboxStatus::Pending.code(),
            "$or": [
                { "claimed_at": Bson::Null },
                { "claimed_at": { "$lt": lease_cutoff } },
            ],
        };
        let options = FindOptions::builder()
            .sort(doc! { "created_at": 1 })
            .limit(limit as i64)
            .projection(doc! { "_id": 1 })
            .build();

        let mut cursor = self
            .outbox()
            .find(claimable.clone())
            .with_options(options)
            .await
            .map_err(db_err)?;

        let mut candidate_ids = Vec::new();
        while let Some(doc) = cursor.try_next().await.map_err(db_err)? {
            if let Ok(id) = doc.get_str("_id") {
                candidate_ids.push(id.to_string());
            }
        }

        // Per-row CAS: only the worker whose update matches wins the claim
        let mut claimed = Vec::new();
        for id in candidate_ids {
            let mut filter = claimable.clone();
            filter.insert("_id", &id);

            let updated = self
                .outbox()
                .find_one_and_update(
                    filter,
                    doc! { "$set": {
                        "claimed_by": worker_id,
                        "claimed_at": to_millis(now),
                        "updated_at": to_millis(now),
                    }},
                )
                .return_document(ReturnDocument::After)
                .await
                .map_err(db_err)?;

            if let Some(doc) = updated {
                claimed.push(doc_to_outbox(&doc)?);
            }
        }

        Ok(claimed)
    }

    async fn mark_published(
        &self,
        row_ids: &[String],
        notification_ids_to_processing: &[String],
    ) -> Result<()> {
        if row_ids.is_empty() {
            return Ok(());
        }

        let now = to_millis(Utc::now());
        let mut session = self.start_transaction().await?;

        let rows = self
            .outbox()
            .update_many(
                doc! { "_id": { "$in": row_ids } },
                doc! { "$set": { "status": OutboxStatus::Published.code(), "updated_at": now } },
            )
            .session(&mut session)
            .await;
        if let Err(e) = rows {
            let _ = session.abort_transaction().await;
            return Err(db_err(e));
        }

        if !notification_ids_to_processing.is_empty() {
            let notifications = self
                .notifications()
                .update_many(
                    doc! {
                        "_id": { "$in": notification_ids_to_processing },
                        "status": NotificationStatus::Pending.code(),
                    },
                    doc! { "$set": {
                        "status": NotificationStatus::Processing.code(),
                        "updated_at": now,
                    }},
                )
                .session(&mut session)
                .await;
            if let Err(e) = notifications {
                let _ = session.abort_transaction().await;
                return Err(db_err(e));
            }
        }

        session.commit_transaction().await.map_err(db_err)?;
        Ok(())
    }

    async fn delete_published_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = self
            .outbox()
            .delete_many(doc! {
                "status": OutboxStatus::Published.code(),
                "updated_at": { "$lt": to_millis(cutoff) },
            })
            .await
            .map_err(db_err)?;
        Ok(result.deleted_count)
    }

    async fn count_pending(&self) -> Result<u64> {
        self.outbox()
            .count_documents(doc! { "status": OutboxStatus::Pending.code() })
            .await
            .map_err(db_err)
    }
}

#[async_trait]
impl StatusOutboxStore for MongoStore {
    async fn claim_unprocessed(
        &self,
        worker_id: &str,
        limit: u32,
        lease_ms: u64,
    ) -> Result<Vec<StatusOutboxRow>> {
        use futures::stream::TryStreamExt;

        let now = Utc::now();
        let lease_cutoff = to_millis(now) - lease_ms as i64;
        let claimable = doc! {
            "processed": false,
            "$or": [
                { "claimed_at": Bson::Null },
                { "claimed_at": { "$lt": lease_cutoff } },
            ],
        };
        let options = FindOptions::builder()
            .sort(doc! { "created_at": 1 })
            .limit(limit as i64)
            .projection(doc! { "_id": 1 })
            .build();

        let mut cursor = self
            .status_outbox()
            .find(claimable.clone())
            .with_options(options)
            .await
            .map_err(db_err)?;

        let mut candidate_ids = Vec::new();
        while let Some(doc) = cursor.try_next().await.map_err(db_err)? {
            if let Ok(id) = doc.get_str("_id") {
                candidate_ids.push(id.to_string());
            }
        }

        let mut claimed = Vec::new();
        for id in candidate_ids {
            let mut filter = claimable.clone();
            filter.insert("_id", &id);

            let updated = self
                .status_outbox()
                .find_one_and_update(
                    filter,
                    doc! { "$set": { "claimed_by": worker_id, "claimed_at": to_millis(now) } },
                )
                .return_document(ReturnDocument::After)
                .await
                .map_err(db_err)?;

            if let Some(doc) = updated {
                claimed.push(doc_to_status_outbox(&doc)?);
            }
        }

        Ok(claimed)
    }

    async fn mark_processed(&self, row_ids: &[String]) -> Result<()> {
        if row_ids.is_empty() {
            return Ok(());
        }
        self.status_outbox()
            .update_many(
                doc! { "_id": { "$in": row_ids } },
                doc! { "$set": { "processed": true } },
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl AlertStore for MongoStore {
    async fn raise_once(&self, alert: &Alert) -> Result<bool> {
        match self.alerts().insert_one(alert_to_doc(alert)?).await {
            Ok(_) => Ok(true),
            Err(e) if is_duplicate_key(&e) => {
                let lower = severity_below(alert.severity);
                if !lower.is_empty() {
                    self.alerts()
                        .update_one(
                            doc! {
                                "notification_id": alert.notification_id.as_deref().map(Bson::from).unwrap_or(Bson::Null),
                                "alert_type": alert.alert_type.to_string(),
                                "resolved": false,
                                "severity": { "$in": lower },
                            },
                            doc! { "$set": {
                                "severity": alert.severity.to_string(),
                                "message": &alert.message,
                                "metadata": serde_json::to_string(&alert.metadata)?,
                            }},
                        )
                        .await
                        .map_err(db_err)?;
                }
                Ok(false)
            }
            Err(e) => Err(db_err(e)),
        }
    }

    async fn get_alert(&self, alert_id: &str) -> Result<Option<Alert>> {
        let doc = self
            .alerts()
            .find_one(doc! { "_id": alert_id })
            .await
            .map_err(db_err)?;
        doc.as_ref().map(doc_to_alert).transpose()
    }

    async fn resolve(&self, alert_id: &str) -> Result<bool> {
        let result = self
            .alerts()
            .update_one(
                doc! { "_id": alert_id, "resolved": false },
                doc! { "$set": { "resolved": true, "resolved_at": to_millis(Utc::now()) } },
            )
            .await
            .map_err(db_err)?;
        Ok(result.modified_count > 0)
    }

    async fn unresolved(&self, limit: u32) -> Result<Vec<Alert>> {
        use futures::stream::TryStreamExt;

        let options = FindOptions::builder()
            .sort(doc! { "created_at": -1 })
            .limit(limit as i64)
            .build();
        let mut cursor = self
            .alerts()
            .find(doc! { "resolved": false })
            .with_options(options)
            .await
            .map_err(db_err)?;

        let mut alerts = Vec::new();
        while let Some(doc) = cursor.try_next().await.map_err(db_err)? {
            alerts.push(doc_to_alert(&doc)?);
        }
        Ok(alerts)
    }

    async fn find_open(
        &self,
        notification_id: Option<&str>,
        alert_type: AlertType,
    ) -> Result<Option<Alert>> {
        let doc = self
            .alerts()
            .find_one(doc! {
                "notification_id": notification_id.map(Bson::from).unwrap_or(Bson::Null),
                "alert_type": alert_type.to_string(),
                "resolved": false,
            })
            .await
            .map_err(db_err)?;
        doc.as_ref().map(doc_to_alert).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_notification_doc_round_trip() {
        let now = Utc::now();
        let n = Notification {
            id: "n-1".to_string(),
            request_id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            channel: "email".to_string(),
            provider: Some("http-email".to_string()),
            recipient: serde_json::json!({"email": "a@x"}),
            content: serde_json::json!({"email": {"subject": "s", "message": "m"}}),
            variables: None,
            webhook_url: "http://w/1".to_string(),
            status: NotificationStatus::Processing,
            scheduled_at: Some(now),
            retry_count: 2,
            error_message: Some("last error".to_string()),
            created_at: now,
            updated_at: now,
        };

        let doc = notification_to_doc(&n).unwrap();
        let back = doc_to_notification(&doc).unwrap();
        assert_eq!(back.id, n.id);
        assert_eq!(back.request_id, n.request_id);
        assert_eq!(back.status, NotificationStatus::Processing);
        assert_eq!(back.retry_count, 2);
        assert_eq!(back.provider.as_deref(), Some("http-email"));
        assert_eq!(back.recipient["email"], "a@x");
    }

    #[test]
    fn test_outbox_doc_round_trip() {
        let row = OutboxRow::new(
            "n-1".to_string(),
            "email_notification".to_string(),
            "{\"k\":1}".to_string(),
        );
        let doc = outbox_to_doc(&row);
        let back = doc_to_outbox(&doc).unwrap();
        assert_eq!(back.id, row.id);
        assert_eq!(back.topic, "email_notification");
        assert_eq!(back.status, OutboxStatus::Pending);
        assert!(back.claimed_by.is_none());
    }

    #[test]
    fn test_severity_below() {
        assert!(severity_below(AlertSeverity::Warning).is_empty());
        assert_eq!(severity_below(AlertSeverity::Error), vec!["warning"]);
        assert_eq!(
            severity_below(AlertSeverity::Critical),
            vec!["warning", "error"]
        );
    }
}
