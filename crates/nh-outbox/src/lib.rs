//! Outbox dispatcher: drains pending outbox rows to the bus.
//!
//! Each pass claims a batch under a lease, groups rows by topic, publishes,
//! and in one store transaction marks the rows published and the affected
//! notifications `processing`. Rows bound for the delayed topic leave their
//! notification `pending`; it only becomes `processing` once the scheduled
//! poller re-injects it onto a channel topic.
//!
//! A failed publish leaves the rows claimed; this worker retries next pass,
//! or another worker reclaims them once the lease expires.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use nh_bus::{BusPublisher, TopicMessage};
use nh_common::{OutboxRow, DELAYED_TOPIC};
use nh_store::OutboxStore;

/// Configuration for the outbox dispatcher.
#[derive(Debug, Clone)]
pub struct OutboxDispatcherConfig {
    pub poll_interval: Duration,
    pub batch_size: u32,
    /// Claim lease; rows claimed longer ago than this are reclaimable.
    pub claim_timeout_ms: u64,
    pub cleanup_interval: Duration,
    /// Published rows older than this are deleted by the cleanup pass.
    pub retention: Duration,
    pub worker_id: String,
}

impl Default for OutboxDispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(2000),
            batch_size: 100,
            claim_timeout_ms: 30_000,
            cleanup_interval: Duration::from_secs(60),
            retention: Duration::from_secs(86_400),
            worker_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

pub struct OutboxDispatcher {
    outbox: Arc<dyn OutboxStore>,
    bus: Arc<dyn BusPublisher>,
    config: OutboxDispatcherConfig,
}

impl OutboxDispatcher {
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        bus: Arc<dyn BusPublisher>,
        config: OutboxDispatcherConfig,
    ) -> Self {
        Self {
            outbox,
            bus,
            config,
        }
    }

    /// Run the dispatch loop until cancelled.
    pub async fn run(&self) {
        info!(
            poll_interval_ms = %self.config.poll_interval.as_millis(),
            batch_size = %self.config.batch_size,
            worker_id = %self.config.worker_id,
            "Starting outbox dispatcher"
        );

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if let Err(e) = self.dispatch_once().await {
                error!(error = %e, "Error dispatching outbox batch");
            }
        }
    }

    /// Run the retention cleanup loop until cancelled.
    pub async fn run_cleanup(&self) {
        info!(
            cleanup_interval_ms = %self.config.cleanup_interval.as_millis(),
            retention_ms = %self.config.retention.as_millis(),
            "Starting outbox cleanup"
        );

        let mut ticker = interval(self.config.cleanup_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let cutoff = Utc::now()
                - chrono::Duration::from_std(self.config.retention)
                    .unwrap_or_else(|_| chrono::Duration::days(1));
            match self.outbox.delete_published_before(cutoff).await {
                Ok(0) => debug!("No published outbox rows past retention"),
                Ok(count) => {
                    metrics::counter!("outbox.cleaned_total").increment(count);
                    info!(count = count, "Deleted published outbox rows past retention");
                }
                Err(e) => error!(error = %e, "Outbox cleanup failed"),
            }
        }
    }

    /// Claim, publish, and mark one batch. Returns the number of rows
    /// successfully published.
    pub async fn dispatch_once(&self) -> Result<usize> {
        let rows = self
            .outbox
            .claim_pending(
                &self.config.worker_id,
                self.config.batch_size,
                self.config.claim_timeout_ms,
            )
            .await?;

        if rows.is_empty() {
            return Ok(0);
        }

        debug!(count = rows.len(), "Claimed outbox rows");
        metrics::gauge!("outbox.claimed_batch").set(rows.len() as f64);

        let mut by_topic: HashMap<String, Vec<OutboxRow>> = HashMap::new();
        for row in rows {
            by_topic.entry(row.topic.clone()).or_default().push(row);
        }

        let mut published = 0usize;
        for (topic, rows) in by_topic {
            let messages: Vec<TopicMessage> = rows
                .iter()
                .map(|row| {
                    TopicMessage::new(
                        row.topic.clone(),
                        row.notification_id.clone(),
                        row.payload.clone(),
                    )
                })
                .collect();

            match self.bus.publish_batch(messages).await {
                Ok(_) => {
                    let row_ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
                    // Scheduled-delivery rows leave the notification pending
                    let notification_ids: Vec<String> = if topic == DELAYED_TOPIC {
                        Vec::new()
                    } else {
                        rows.iter().map(|r| r.notification_id.clone()).collect()
                    };

                    self.outbox
                        .mark_published(&row_ids, &notification_ids)
                        .await?;

                    published += row_ids.len();
                    metrics::counter!("outbox.published_total").increment(row_ids.len() as u64);
                    debug!(
                        topic = %topic,
                        count = row_ids.len(),
                        "Outbox rows published"
                    );
                }
                Err(e) => {
                    // Leave the claims in place; the lease arbitrates retry
                    metrics::counter!("outbox.publish_errors_total").increment(1);
                    warn!(
                        topic = %topic,
                        count = rows.len(),
                        error = %e,
                        "Publish failed; rows stay claimed for retry"
                    );
                }
            }
        }

        Ok(published)
    }
}
