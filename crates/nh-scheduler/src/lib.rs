//! Scheduled delivery: the consumer that feeds the time-ordered queue and
//! the poller that drains due entries back onto channel topics.
//!
//! Two cooperating tasks share the queue. The consumer moves delayed
//! envelopes from the bus into the coordination store; the poller claims
//! due entries (two-phase), publishes each payload to its target topic,
//! and removes the entry only after the publish is acknowledged.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use nh_bus::{BusConsumer, BusPublisher, TopicMessage};
use nh_common::{DelayedMessage, StatusMessage, TerminalStatus, STATUS_TOPIC};
use nh_coord::{ScheduledEntry, ScheduledQueue};

// ============================================================================
// Scheduled consumer
// ============================================================================

/// Consumes `delayed_notification` messages into the scheduled queue.
pub struct ScheduledConsumer {
    consumer: Arc<dyn BusConsumer>,
    queue: Arc<dyn ScheduledQueue>,
    poll_batch: u32,
    idle_delay: Duration,
}

impl ScheduledConsumer {
    pub fn new(consumer: Arc<dyn BusConsumer>, queue: Arc<dyn ScheduledQueue>) -> Self {
        Self {
            consumer,
            queue,
            poll_batch: 50,
            idle_delay: Duration::from_millis(200),
        }
    }

    /// Run the consume loop until cancelled.
    pub async fn run(&self) {
        info!("Starting scheduled consumer");
        loop {
            match self.process_available().await {
                Ok(0) => tokio::time::sleep(self.idle_delay).await,
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "Scheduled consumer poll failed");
                    tokio::time::sleep(self.idle_delay).await;
                }
            }
        }
    }

    /// Poll once and enqueue every returned message.
    pub async fn process_available(&self) -> nh_bus::Result<usize> {
        let messages = self.consumer.poll(self.poll_batch).await?;
        let count = messages.len();

        for message in messages {
            let delayed: DelayedMessage = match serde_json::from_str(&message.body) {
                Ok(delayed) => delayed,
                Err(e) => {
                    warn!(error = %e, "Unparseable delayed message dropped");
                    let _ = self.consumer.ack(&message.receipt_handle).await;
                    continue;
                }
            };

            match self.queue.add(&delayed).await {
                Ok(()) => {
                    metrics::counter!("scheduled.enqueued_total").increment(1);
                    debug!(
                        notification_id = %delayed.notification_id,
                        scheduled_at = %delayed.scheduled_at,
                        "Delayed message enqueued"
                    );
                    if let Err(e) = self.consumer.ack(&message.receipt_handle).await {
                        warn!(error = %e, "Ack failed after enqueue; duplicate add is harmless");
                    }
                }
                Err(e) => {
                    // Leave unacked; the bus redelivers once the store is back
                    error!(
                        notification_id = %delayed.notification_id,
                        error = %e,
                        "Failed to enqueue delayed message"
                    );
                }
            }
        }

        Ok(count)
    }
}

// ============================================================================
// Due poller
// ============================================================================

/// Configuration for the due-entry poller.
#[derive(Debug, Clone)]
pub struct DuePollerConfig {
    pub poll_interval: Duration,
    pub batch_size: u32,
    /// Publish attempts before a scheduled entry is failed terminally.
    pub max_poller_retries: u32,
    /// Backoff applied when a due entry's publish fails.
    pub retry_backoff_ms: u64,
}

impl Default for DuePollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            batch_size: 100,
            max_poller_retries: 5,
            retry_backoff_ms: 5000,
        }
    }
}

/// Publishes due scheduled entries onto their channel topics.
pub struct DuePoller {
    queue: Arc<dyn ScheduledQueue>,
    publisher: Arc<dyn BusPublisher>,
    config: DuePollerConfig,
}

impl DuePoller {
    pub fn new(
        queue: Arc<dyn ScheduledQueue>,
        publisher: Arc<dyn BusPublisher>,
        config: DuePollerConfig,
    ) -> Self {
        Self {
            queue,
            publisher,
            config,
        }
    }

    /// Run the poll loop until cancelled.
    pub async fn run(&self) {
        info!(
            poll_interval_ms = %self.config.poll_interval.as_millis(),
            batch_size = self.config.batch_size,
            "Starting scheduled poller"
        );

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if let Err(e) = self.poll_once().await {
                error!(error = %e, "Error in scheduled poller pass");
            }
        }
    }

    /// Claim and publish one batch of due entries. Returns the number of
    /// entries published and confirmed.
    pub async fn poll_once(&self) -> nh_coord::Result<usize> {
        let entries = self.queue.claim_due(self.config.batch_size).await?;
        if entries.is_empty() {
            return Ok(0);
        }

        debug!(count = entries.len(), "Claimed due scheduled entries");
        metrics::gauge!("scheduled.claimed_batch").set(entries.len() as f64);

        let mut confirmed = 0usize;
        for entry in entries {
            if self.publish_entry(&entry).await? {
                confirmed += 1;
            }
        }
        Ok(confirmed)
    }

    /// Publish one claimed entry to its target topic; confirm on success,
    /// re-add with backoff on failure, fail terminally once the poller
    /// retry budget is spent.
    async fn publish_entry(&self, entry: &ScheduledEntry) -> nh_coord::Result<bool> {
        let message = &entry.message;
        let body = match serde_json::to_string(&message.payload) {
            Ok(body) => body,
            Err(e) => {
                // The payload can never publish; drop the entry
                error!(
                    notification_id = %message.notification_id,
                    error = %e,
                    "Unserializable scheduled payload dropped"
                );
                self.queue.confirm_processed(entry).await?;
                return Ok(false);
            }
        };

        let publish = self
            .publisher
            .publish(TopicMessage::new(
                message.target_topic.clone(),
                message.notification_id.clone(),
                body,
            ))
            .await;

        match publish {
            Ok(_) => {
                metrics::counter!("scheduled.published_total").increment(1);
                debug!(
                    notification_id = %message.notification_id,
                    target_topic = %message.target_topic,
                    "Due entry published"
                );
                // Removal only after the publish is acknowledged
                if !self.queue.confirm_processed(entry).await? {
                    // Claim lapsed mid-publish; the retaker republishes and
                    // the idempotency lock downstream absorbs the duplicate
                    warn!(
                        notification_id = %message.notification_id,
                        "Claim lost before confirm; duplicate publish possible"
                    );
                }
                Ok(true)
            }
            Err(e) => {
                let retries = message.poller_retries + 1;
                metrics::counter!("scheduled.publish_errors_total").increment(1);

                if retries > self.config.max_poller_retries {
                    error!(
                        notification_id = %message.notification_id,
                        retries = retries,
                        error = %e,
                        "Scheduled entry exhausted poller retries; failing terminally"
                    );
                    self.publish_terminal_failure(message).await;
                    self.queue.confirm_processed(entry).await?;
                    return Ok(false);
                }

                let backoff_ms = self.config.retry_backoff_ms * retries as u64;
                warn!(
                    notification_id = %message.notification_id,
                    retries = retries,
                    backoff_ms = backoff_ms,
                    error = %e,
                    "Publish failed; re-adding scheduled entry"
                );

                let mut updated = message.clone();
                updated.poller_retries = retries;
                self.queue.re_add(entry, &updated, backoff_ms).await?;
                Ok(false)
            }
        }
    }

    /// Best-effort terminal failure for an entry the poller gives up on.
    async fn publish_terminal_failure(&self, message: &DelayedMessage) {
        let status = StatusMessage {
            notification_id: message.notification_id.clone(),
            request_id: message.request_id,
            client_id: message.client_id,
            channel: message.payload.channel.clone(),
            status: TerminalStatus::Failed,
            message: Some("scheduled delivery could not be published".to_string()),
            retry_count: message.payload.retry_count,
            webhook_url: message.payload.webhook_url.clone(),
            created_at: Utc::now(),
        };

        let body = match serde_json::to_string(&status) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "Failed to serialize terminal status");
                return;
            }
        };

        if let Err(e) = self
            .publisher
            .publish(TopicMessage::new(
                STATUS_TOPIC,
                message.notification_id.clone(),
                body,
            ))
            .await
        {
            // Dropped entry with no status: the reconciler's orphan pass
            // is the remaining safety net
            error!(
                notification_id = %message.notification_id,
                error = %e,
                "Terminal status publish failed for dropped scheduled entry"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use nh_bus::{BusError, BusPublisher, MemoryBus};
    use nh_common::{channel_topic, NotificationPayload, DELAYED_TOPIC};
    use nh_coord::{MemoryCoord, MemoryCoordConfig, RateLimits};
    use uuid::Uuid;

    fn coord() -> MemoryCoord {
        MemoryCoord::new(
            MemoryCoordConfig {
                worker_id: "w1".to_string(),
                ..Default::default()
            },
            RateLimits::new(100, 10.0),
        )
    }

    fn delayed(nid: &str, due_in_seconds: i64) -> DelayedMessage {
        let payload = NotificationPayload {
            notification_id: nid.to_string(),
            request_id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            channel: "email".to_string(),
            provider: None,
            recipient: serde_json::json!({"email": "a@x"}),
            content: serde_json::json!({"email": {"subject": "s", "message": "m"}}),
            variables: None,
            webhook_url: "http://w/1".to_string(),
            retry_count: 1,
            created_at: Utc::now(),
        };
        DelayedMessage {
            notification_id: nid.to_string(),
            request_id: payload.request_id,
            client_id: payload.client_id,
            scheduled_at: Utc::now() + ChronoDuration::seconds(due_in_seconds),
            target_topic: channel_topic("email"),
            payload,
            poller_retries: 0,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_consumer_moves_messages_into_queue() {
        let bus = MemoryBus::new();
        let queue = Arc::new(coord());

        bus.publish(TopicMessage::new(
            DELAYED_TOPIC,
            "n-1",
            serde_json::to_string(&delayed("n-1", 3600)).unwrap(),
        ))
        .await
        .unwrap();

        let consumer = ScheduledConsumer::new(
            Arc::new(bus.consumer(DELAYED_TOPIC)),
            queue.clone(),
        );
        let handled = consumer.process_available().await.unwrap();

        assert_eq!(handled, 1);
        assert_eq!(queue.len().await.unwrap(), 1);
        assert_eq!(bus.depth(DELAYED_TOPIC), 0);
    }

    #[tokio::test]
    async fn test_poller_publishes_due_and_confirms() {
        let bus = MemoryBus::new();
        let queue = Arc::new(coord());

        queue.add(&delayed("n-due", -5)).await.unwrap();
        queue.add(&delayed("n-future", 3600)).await.unwrap();

        let poller = DuePoller::new(
            queue.clone(),
            Arc::new(bus.clone()),
            DuePollerConfig::default(),
        );
        let published = poller.poll_once().await.unwrap();

        assert_eq!(published, 1);
        // Only the due entry moved to its channel topic
        let bodies = bus.drain(&channel_topic("email"));
        assert_eq!(bodies.len(), 1);
        let payload: NotificationPayload = serde_json::from_str(&bodies[0]).unwrap();
        assert_eq!(payload.notification_id, "n-due");

        // The future entry remains queued
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    struct FailingPublisher;

    #[async_trait]
    impl BusPublisher for FailingPublisher {
        async fn publish(&self, _message: TopicMessage) -> nh_bus::Result<String> {
            Err(BusError::Database("broker down".to_string()))
        }
    }

    #[tokio::test]
    async fn test_publish_failure_re_adds_with_backoff() {
        let queue = Arc::new(coord());
        queue.add(&delayed("n-1", -5)).await.unwrap();

        let poller = DuePoller::new(
            queue.clone(),
            Arc::new(FailingPublisher),
            DuePollerConfig::default(),
        );
        let published = poller.poll_once().await.unwrap();

        assert_eq!(published, 0);
        // Entry stays in the queue, re-scored into the future
        assert_eq!(queue.len().await.unwrap(), 1);
        assert!(queue.claim_due(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_poller_retries_drop_with_terminal_status() {
        let bus = MemoryBus::new();
        let queue = Arc::new(coord());

        let mut message = delayed("n-1", -5);
        message.poller_retries = 5;
        queue.add(&message).await.unwrap();

        // The channel publish fails but the status publish succeeds: route
        // the failure through a publisher that rejects channel topics only
        struct ChannelFailingPublisher {
            bus: MemoryBus,
        }

        #[async_trait]
        impl BusPublisher for ChannelFailingPublisher {
            async fn publish(&self, message: TopicMessage) -> nh_bus::Result<String> {
                if message.topic == STATUS_TOPIC {
                    self.bus.publish(message).await
                } else {
                    Err(BusError::Database("broker down".to_string()))
                }
            }
        }

        let poller = DuePoller::new(
            queue.clone(),
            Arc::new(ChannelFailingPublisher { bus: bus.clone() }),
            DuePollerConfig {
                max_poller_retries: 5,
                ..Default::default()
            },
        );
        poller.poll_once().await.unwrap();

        // Entry is gone and a terminal failure was emitted
        assert_eq!(queue.len().await.unwrap(), 0);
        let statuses = bus.drain(STATUS_TOPIC);
        assert_eq!(statuses.len(), 1);
        let status: StatusMessage = serde_json::from_str(&statuses[0]).unwrap();
        assert_eq!(status.status, TerminalStatus::Failed);
        assert_eq!(status.notification_id, "n-1");
    }

    #[tokio::test]
    async fn test_round_trip_not_before_due_time() {
        let bus = MemoryBus::new();
        let queue = Arc::new(coord());

        // Due 1 hour out: the poller must not publish it now
        queue.add(&delayed("n-1", 3600)).await.unwrap();

        let poller = DuePoller::new(
            queue.clone(),
            Arc::new(bus.clone()),
            DuePollerConfig::default(),
        );
        assert_eq!(poller.poll_once().await.unwrap(), 0);
        assert_eq!(bus.depth(&channel_topic("email")), 0);
    }
}
