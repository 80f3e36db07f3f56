//! SQLite-backed bus that mimics keyed FIFO topic semantics for embedded
//! mode and tests. One table holds every topic; per-key ordering is
//! enforced at poll time so only the oldest message of each key is ever
//! in flight.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::{
    BusConsumer, BusError, BusMetrics, BusPublisher, EmbeddedBus, ReceivedMessage, Result,
    TopicMessage,
};

/// SQLite bus shared by publishers and consumers.
#[derive(Clone)]
pub struct SqliteBus {
    pool: Pool<Sqlite>,
    visibility_timeout_seconds: u32,
}

impl SqliteBus {
    pub fn new(pool: Pool<Sqlite>, visibility_timeout_seconds: u32) -> Self {
        Self {
            pool,
            visibility_timeout_seconds,
        }
    }

    /// Create a consumer bound to one topic.
    pub fn consumer(&self, topic: impl Into<String>) -> SqliteTopicConsumer {
        SqliteTopicConsumer {
            pool: self.pool.clone(),
            topic: topic.into(),
            visibility_timeout_seconds: self.visibility_timeout_seconds,
            running: AtomicBool::new(true),
        }
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bus_messages (
                id TEXT PRIMARY KEY,
                topic TEXT NOT NULL,
                partition_key TEXT,
                receipt_handle TEXT,
                visible_at INTEGER NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                receive_count INTEGER DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Index for efficient polling
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_bus_visible
            ON bus_messages (topic, visible_at, partition_key)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("SQLite bus schema initialized");
        Ok(())
    }
}

#[async_trait]
impl BusPublisher for SqliteBus {
    async fn publish(&self, message: TopicMessage) -> Result<String> {
        let now = Utc::now();
        let id = uuid::Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO bus_messages (id, topic, partition_key, visible_at, payload, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&message.topic)
        .bind(&message.key)
        .bind(now.timestamp())
        .bind(&message.body)
        .bind(now.timestamp())
        .execute(&self.pool)
        .await?;

        debug!(
            message_id = %id,
            topic = %message.topic,
            key = %message.key,
            "Message published to SQLite bus"
        );

        Ok(id)
    }
}

#[async_trait]
impl EmbeddedBus for SqliteBus {
    async fn init_schema(&self) -> Result<()> {
        self.create_schema().await
    }
}

/// Consumer over one topic of the SQLite bus.
pub struct SqliteTopicConsumer {
    pool: Pool<Sqlite>,
    topic: String,
    visibility_timeout_seconds: u32,
    running: AtomicBool,
}

impl SqliteTopicConsumer {
    fn generate_receipt_handle(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

#[async_trait]
impl BusConsumer for SqliteTopicConsumer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn poll(&self, max_messages: u32) -> Result<Vec<ReceivedMessage>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(BusError::Stopped);
        }

        let now = Utc::now().timestamp();
        let new_visible_at = now + self.visibility_timeout_seconds as i64;

        // Only the head message of each partition key is eligible, and only
        // while it is visible. An in-flight or delayed head blocks its whole
        // key, so attempts on one key never run concurrently.
        let rows = sqlx::query(
            r#"
            WITH ranked AS (
                SELECT id, partition_key, payload, visible_at,
                       ROW_NUMBER() OVER (PARTITION BY COALESCE(partition_key, id) ORDER BY created_at, rowid) as rn
                FROM bus_messages
                WHERE topic = ?
            )
            SELECT id, partition_key, payload
            FROM ranked
            WHERE rn = 1 AND visible_at <= ?
            LIMIT ?
            "#,
        )
        .bind(&self.topic)
        .bind(now)
        .bind(max_messages as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = Vec::with_capacity(rows.len());

        for row in rows {
            let id: String = row.get("id");
            let partition_key: Option<String> = row.get("partition_key");
            let payload: String = row.get("payload");

            let receipt_handle = self.generate_receipt_handle();

            let updated = sqlx::query(
                r#"
                UPDATE bus_messages
                SET receipt_handle = ?, visible_at = ?, receive_count = receive_count + 1
                WHERE id = ? AND topic = ? AND visible_at <= ?
                "#,
            )
            .bind(&receipt_handle)
            .bind(new_visible_at)
            .bind(&id)
            .bind(&self.topic)
            .bind(now)
            .execute(&self.pool)
            .await?;

            if updated.rows_affected() == 0 {
                // Another consumer grabbed this message
                continue;
            }

            messages.push(ReceivedMessage {
                topic: self.topic.clone(),
                key: partition_key,
                body: payload,
                receipt_handle,
                broker_message_id: Some(id),
            });
        }

        if !messages.is_empty() {
            debug!(
                topic = %self.topic,
                count = messages.len(),
                "Polled messages from SQLite bus"
            );
        }

        Ok(messages)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let result = sqlx::query(
            "DELETE FROM bus_messages WHERE receipt_handle = ? AND topic = ?",
        )
        .bind(receipt_handle)
        .bind(&self.topic)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(
                receipt_handle = %receipt_handle,
                topic = %self.topic,
                "ACK failed - message not found or already deleted"
            );
            return Err(BusError::NotFound(receipt_handle.to_string()));
        }

        debug!(
            receipt_handle = %receipt_handle,
            topic = %self.topic,
            "Message acknowledged"
        );
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()> {
        let delay = delay_seconds.unwrap_or(0) as i64;
        let new_visible_at = Utc::now().timestamp() + delay;

        let result = sqlx::query(
            r#"
            UPDATE bus_messages
            SET visible_at = ?, receipt_handle = NULL
            WHERE receipt_handle = ? AND topic = ?
            "#,
        )
        .bind(new_visible_at)
        .bind(receipt_handle)
        .bind(&self.topic)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(
                receipt_handle = %receipt_handle,
                topic = %self.topic,
                "NACK failed - message not found"
            );
            return Err(BusError::NotFound(receipt_handle.to_string()));
        }

        debug!(
            receipt_handle = %receipt_handle,
            topic = %self.topic,
            delay_seconds = delay,
            "Message negative acknowledged"
        );
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(topic = %self.topic, "SQLite bus consumer stopped");
    }

    async fn get_metrics(&self) -> Result<Option<BusMetrics>> {
        let now = Utc::now().timestamp();

        let pending_row = sqlx::query(
            "SELECT COUNT(*) as count FROM bus_messages WHERE topic = ? AND visible_at <= ? AND receipt_handle IS NULL",
        )
        .bind(&self.topic)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        let pending_messages: i64 = pending_row.get("count");

        let in_flight_row = sqlx::query(
            "SELECT COUNT(*) as count FROM bus_messages WHERE topic = ? AND receipt_handle IS NOT NULL",
        )
        .bind(&self.topic)
        .fetch_one(&self.pool)
        .await?;
        let in_flight_messages: i64 = in_flight_row.get("count");

        Ok(Some(BusMetrics {
            pending_messages: pending_messages as u64,
            in_flight_messages: in_flight_messages as u64,
            topic: self.topic.clone(),
        }))
    }
}
