//! Per-channel dispatch consumer.
//!
//! For each message on a channel topic: parse, validate against the
//! selected provider, take the idempotency lock, take a rate-limit token,
//! send with fallback, and report the outcome. Terminal outcomes go to the
//! status topic; retryable ones re-enter through the delayed topic with
//! exponential backoff.
//!
//! Ack discipline: malformed, invalid, and duplicate messages ack
//! (poison-pill isolation and de-dup). Infrastructure failures before the
//! send leave the message unacked so the bus redelivers. After a
//! successful send the message always acks; a lost status publish is the
//! reconciler's problem, not a reason to send twice.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, error, info, warn};

use nh_bus::{BusConsumer, BusPublisher, ReceivedMessage, TopicMessage};
use nh_common::{
    retry_backoff_ms, DelayedMessage, NotificationPayload, StatusMessage, TerminalStatus,
    DELAYED_TOPIC, STATUS_TOPIC,
};
use nh_coord::{IdempotencyStore, LockAcquire, RateLimiter};
use nh_plugin::{ProviderRegistry, ProviderRouter};

/// What to do with the bus message after handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Commit: the message is finished (delivered, terminal, rerouted, or
    /// dropped as poison).
    Ack,
    /// Leave unacked: infrastructure failed before the outcome was safe;
    /// the bus redelivers after the visibility window.
    Redeliver,
}

/// Configuration for one channel's dispatch consumer.
#[derive(Debug, Clone)]
pub struct ChannelConsumerConfig {
    pub channel: String,
    pub max_retry_count: i32,
    /// Base for the exponential backoff `2^(n+1) * base_delay_ms`.
    pub base_delay_ms: u64,
    pub poll_batch: u32,
    /// Sleep between empty polls.
    pub idle_delay: Duration,
}

impl ChannelConsumerConfig {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            max_retry_count: 3,
            base_delay_ms: 1000,
            poll_batch: 10,
            idle_delay: Duration::from_millis(200),
        }
    }
}

pub struct ChannelConsumer {
    config: ChannelConsumerConfig,
    consumer: Arc<dyn BusConsumer>,
    publisher: Arc<dyn BusPublisher>,
    router: ProviderRouter,
    registry: Arc<ProviderRegistry>,
    idempotency: Arc<dyn IdempotencyStore>,
    rate_limiter: Arc<dyn RateLimiter>,
}

impl ChannelConsumer {
    pub fn new(
        config: ChannelConsumerConfig,
        consumer: Arc<dyn BusConsumer>,
        publisher: Arc<dyn BusPublisher>,
        registry: Arc<ProviderRegistry>,
        idempotency: Arc<dyn IdempotencyStore>,
        rate_limiter: Arc<dyn RateLimiter>,
    ) -> Self {
        Self {
            router: ProviderRouter::new(registry.clone()),
            config,
            consumer,
            publisher,
            registry,
            idempotency,
            rate_limiter,
        }
    }

    /// Run the consume loop until cancelled.
    pub async fn run(&self) {
        info!(
            channel = %self.config.channel,
            group = %nh_common::processor_group(&self.config.channel),
            max_retry_count = self.config.max_retry_count,
            "Starting dispatch consumer"
        );

        loop {
            match self.process_available().await {
                Ok(0) => tokio::time::sleep(self.config.idle_delay).await,
                Ok(_) => {}
                Err(e) => {
                    error!(channel = %self.config.channel, error = %e, "Poll failed");
                    tokio::time::sleep(self.config.idle_delay).await;
                }
            }
        }
    }

    /// Poll once and handle every returned message. Returns the number of
    /// messages handled.
    pub async fn process_available(&self) -> nh_bus::Result<usize> {
        let messages = self.consumer.poll(self.config.poll_batch).await?;
        let count = messages.len();

        for message in messages {
            let receipt = message.receipt_handle.clone();
            match self.handle_message(&message).await {
                MessageOutcome::Ack => {
                    if let Err(e) = self.consumer.ack(&receipt).await {
                        warn!(
                            channel = %self.config.channel,
                            error = %e,
                            "Ack failed; message may redeliver"
                        );
                    }
                }
                MessageOutcome::Redeliver => {
                    // No commit: visibility timeout brings it back
                    metrics::counter!("dispatch.redeliveries_total").increment(1);
                }
            }
        }

        Ok(count)
    }

    /// Handle one bus message through the full decision ladder.
    pub async fn handle_message(&self, message: &ReceivedMessage) -> MessageOutcome {
        // 1. Parse; a poison pill is committed away, never retried
        let payload: NotificationPayload = match serde_json::from_str(&message.body) {
            Ok(payload) => payload,
            Err(e) => {
                metrics::counter!("dispatch.poison_total").increment(1);
                warn!(
                    channel = %self.config.channel,
                    error = %e,
                    "Unparseable message dropped"
                );
                return MessageOutcome::Ack;
            }
        };

        // 2. Validate against the provider that will send it
        let provider = payload
            .provider
            .as_deref()
            .and_then(|id| self.registry.get(id))
            .or_else(|| self.registry.default_for(&self.config.channel));
        if let Some(provider) = &provider {
            if let Err(e) = provider.validate(&payload) {
                metrics::counter!("dispatch.validation_failures_total").increment(1);
                warn!(
                    notification_id = %payload.notification_id,
                    error = %e,
                    "Payload failed provider validation; dropped"
                );
                return MessageOutcome::Ack;
            }
        }

        // 3. Idempotency lock
        match self.idempotency.try_acquire(&payload.notification_id).await {
            Ok(LockAcquire::AcquiredFresh) => {}
            Ok(LockAcquire::AcquiredRetry) => {
                debug!(
                    notification_id = %payload.notification_id,
                    retry_count = payload.retry_count,
                    "Re-acquired lock for retry attempt"
                );
            }
            Ok(LockAcquire::Rejected) => {
                metrics::counter!("dispatch.duplicates_total").increment(1);
                debug!(
                    notification_id = %payload.notification_id,
                    "Duplicate delivery attempt rejected"
                );
                return MessageOutcome::Ack;
            }
            Err(e) => {
                // Coordination store outage before send: redeliver
                error!(
                    notification_id = %payload.notification_id,
                    error = %e,
                    "Idempotency store unavailable"
                );
                return MessageOutcome::Redeliver;
            }
        }

        // 4. Rate limit
        match self.rate_limiter.consume(&self.config.channel).await {
            Ok(decision) if decision.allowed => {}
            Ok(decision) => {
                metrics::counter!("dispatch.rate_limited_total").increment(1);
                return self
                    .reroute_rate_limited(&payload, decision.retry_after_ms)
                    .await;
            }
            Err(e) => {
                error!(
                    notification_id = %payload.notification_id,
                    error = %e,
                    "Rate limiter unavailable"
                );
                // Release the lock so the redelivery can re-acquire
                let _ = self.idempotency.set_failed(&payload.notification_id).await;
                return MessageOutcome::Redeliver;
            }
        }

        // 5. Send
        let result = self
            .router
            .send_with_fallback(&self.config.channel, &payload)
            .await;

        if result.success {
            // 6. Terminal success
            metrics::counter!("dispatch.delivered_total").increment(1);
            if let Err(e) = self.idempotency.set_delivered(&payload.notification_id).await {
                // Send already happened; flag the ghost risk and move on
                error!(
                    notification_id = %payload.notification_id,
                    error = %e,
                    "setDelivered failed after successful send; potential ghost delivery"
                );
                metrics::counter!("dispatch.ghost_risk_total").increment(1);
            }
            if let Err(e) = self
                .publish_status(&payload, TerminalStatus::Delivered, None, payload.retry_count)
                .await
            {
                // The reconciler republishes from the durable side
                error!(
                    notification_id = %payload.notification_id,
                    error = %e,
                    "Delivered status publish failed; reconciler will heal"
                );
            }
            info!(
                notification_id = %payload.notification_id,
                channel = %self.config.channel,
                message_id = result.message_id.as_deref().unwrap_or(""),
                "Notification delivered"
            );
            return MessageOutcome::Ack;
        }

        // 7. Failure
        let error_message = result.error_message();
        let exhausted = payload.retry_count + 1 > self.config.max_retry_count;

        if !result.is_retryable() || exhausted {
            metrics::counter!("dispatch.failed_total").increment(1);
            let _ = self.idempotency.set_failed(&payload.notification_id).await;
            if let Err(e) = self
                .publish_status(
                    &payload,
                    TerminalStatus::Failed,
                    Some(&error_message),
                    payload.retry_count,
                )
                .await
            {
                error!(
                    notification_id = %payload.notification_id,
                    error = %e,
                    "Terminal status publish failed; leaving for redelivery"
                );
                return MessageOutcome::Redeliver;
            }
            warn!(
                notification_id = %payload.notification_id,
                retry_count = payload.retry_count,
                exhausted = exhausted,
                error = %error_message,
                "Notification failed terminally"
            );
            return MessageOutcome::Ack;
        }

        // Retryable: back off through the delayed topic
        let delay_ms = retry_backoff_ms(payload.retry_count, self.config.base_delay_ms);
        metrics::counter!("dispatch.retries_scheduled_total").increment(1);
        debug!(
            notification_id = %payload.notification_id,
            retry_count = payload.retry_count,
            delay_ms = delay_ms,
            error = %error_message,
            "Scheduling retry with backoff"
        );
        self.reroute_delayed(&payload, delay_ms).await
    }

    /// Route a rate-limited notification back through the delayed topic at
    /// the limiter's suggested time, or fail it if retries are exhausted.
    async fn reroute_rate_limited(
        &self,
        payload: &NotificationPayload,
        retry_after_ms: u64,
    ) -> MessageOutcome {
        if payload.retry_count + 1 > self.config.max_retry_count {
            let _ = self.idempotency.set_failed(&payload.notification_id).await;
            let message = format!(
                "rate limit exceeded after {} attempts",
                payload.retry_count + 1
            );
            if let Err(e) = self
                .publish_status(
                    payload,
                    TerminalStatus::Failed,
                    Some(&message),
                    payload.retry_count,
                )
                .await
            {
                error!(
                    notification_id = %payload.notification_id,
                    error = %e,
                    "Terminal status publish failed; leaving for redelivery"
                );
                return MessageOutcome::Redeliver;
            }
            warn!(
                notification_id = %payload.notification_id,
                "Rate-limited notification exhausted retries"
            );
            return MessageOutcome::Ack;
        }

        debug!(
            notification_id = %payload.notification_id,
            retry_after_ms = retry_after_ms,
            "Rate limited; rerouting through scheduled queue"
        );
        self.reroute_delayed(payload, retry_after_ms).await
    }

    /// Publish a delayed re-entry for this payload, then release the
    /// processing lock so the retry can re-acquire it.
    async fn reroute_delayed(
        &self,
        payload: &NotificationPayload,
        delay_ms: u64,
    ) -> MessageOutcome {
        let mut retry_payload = payload.clone();
        retry_payload.retry_count += 1;

        let delayed = DelayedMessage {
            notification_id: payload.notification_id.clone(),
            request_id: payload.request_id,
            client_id: payload.client_id,
            scheduled_at: Utc::now() + ChronoDuration::milliseconds(delay_ms as i64),
            target_topic: nh_common::channel_topic(&self.config.channel),
            payload: retry_payload,
            poller_retries: 0,
            created_at: Utc::now(),
        };

        let body = match serde_json::to_string(&delayed) {
            Ok(body) => body,
            Err(e) => {
                error!(
                    notification_id = %payload.notification_id,
                    error = %e,
                    "Failed to serialize delayed message"
                );
                let _ = self.idempotency.set_failed(&payload.notification_id).await;
                return MessageOutcome::Redeliver;
            }
        };

        let publish = self
            .publisher
            .publish(TopicMessage::new(
                DELAYED_TOPIC,
                payload.notification_id.clone(),
                body,
            ))
            .await;

        // Release the lock either way so the retry (or redelivery) can
        // re-acquire it
        let _ = self.idempotency.set_failed(&payload.notification_id).await;

        match publish {
            Ok(_) => MessageOutcome::Ack,
            Err(e) => {
                error!(
                    notification_id = %payload.notification_id,
                    error = %e,
                    "Delayed publish failed; leaving for redelivery"
                );
                MessageOutcome::Redeliver
            }
        }
    }

    async fn publish_status(
        &self,
        payload: &NotificationPayload,
        status: TerminalStatus,
        message: Option<&str>,
        retry_count: i32,
    ) -> nh_bus::Result<()> {
        let status_message = StatusMessage {
            notification_id: payload.notification_id.clone(),
            request_id: payload.request_id,
            client_id: payload.client_id,
            channel: self.config.channel.clone(),
            status,
            message: message.map(String::from),
            retry_count,
            webhook_url: payload.webhook_url.clone(),
            created_at: Utc::now(),
        };

        self.publisher
            .publish(TopicMessage::new(
                STATUS_TOPIC,
                payload.notification_id.clone(),
                serde_json::to_string(&status_message)?,
            ))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nh_bus::MemoryBus;
    use nh_coord::{IdempotencyState, MemoryCoord, MemoryCoordConfig, RateLimits};
    use nh_common::{channel_topic, DeliveryResult};
    use nh_plugin::{Provider, ProviderManifest, RateLimitConfig};
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    struct ScriptedProvider {
        results: std::sync::Mutex<Vec<DeliveryResult>>,
        calls: AtomicU32,
    }

    impl ScriptedProvider {
        fn new(results: Vec<DeliveryResult>) -> Arc<Self> {
            Arc::new(Self {
                results: std::sync::Mutex::new(results),
                calls: AtomicU32::new(0),
            })
        }

        fn always(result: DeliveryResult) -> Arc<Self> {
            Self::new(vec![result])
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn manifest(&self) -> ProviderManifest {
            ProviderManifest {
                id: "scripted".to_string(),
                name: "Scripted".to_string(),
                channel: "email".to_string(),
                version: "1.0.0".to_string(),
                required_credentials: vec![],
            }
        }

        fn rate_limit(&self) -> RateLimitConfig {
            RateLimitConfig {
                max_tokens: 100,
                refill_rate: 10.0,
            }
        }

        fn validate(&self, payload: &NotificationPayload) -> nh_plugin::Result<()> {
            if payload.recipient.get("email").is_none() {
                return Err(nh_plugin::ProviderError::Validation(
                    "recipient.email is required".to_string(),
                ));
            }
            Ok(())
        }

        async fn health_check(&self) -> bool {
            true
        }

        async fn send(&self, _payload: &NotificationPayload) -> DeliveryResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut results = self.results.lock().unwrap();
            if results.len() > 1 {
                results.remove(0)
            } else {
                results[0].clone()
            }
        }
    }

    struct Harness {
        bus: MemoryBus,
        coord: MemoryCoord,
        consumer: ChannelConsumer,
    }

    fn harness_with_limits(provider: Arc<ScriptedProvider>, limits: RateLimits) -> Harness {
        let bus = MemoryBus::new();
        let coord = MemoryCoord::new(
            MemoryCoordConfig {
                worker_id: "w1".to_string(),
                ..Default::default()
            },
            limits,
        );

        let registry = Arc::new(ProviderRegistry::new());
        registry.register(provider, 10).unwrap();
        registry.set_channel_defaults("email", Some("scripted".to_string()), None);

        let consumer = ChannelConsumer::new(
            ChannelConsumerConfig::new("email"),
            Arc::new(bus.consumer(channel_topic("email"))),
            Arc::new(bus.clone()),
            registry,
            Arc::new(coord.clone()),
            Arc::new(coord.clone()),
        );

        Harness {
            bus,
            coord,
            consumer,
        }
    }

    fn harness(provider: Arc<ScriptedProvider>) -> Harness {
        harness_with_limits(provider, RateLimits::new(100, 10.0))
    }

    fn payload(nid: &str) -> NotificationPayload {
        NotificationPayload {
            notification_id: nid.to_string(),
            request_id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            channel: "email".to_string(),
            provider: None,
            recipient: serde_json::json!({"email": "a@x"}),
            content: serde_json::json!({"email": {"subject": "s", "message": "m"}}),
            variables: None,
            webhook_url: "http://w/1".to_string(),
            retry_count: 0,
            created_at: Utc::now(),
        }
    }

    async fn publish_payload(bus: &MemoryBus, payload: &NotificationPayload) {
        use nh_bus::BusPublisher;
        bus.publish(TopicMessage::new(
            channel_topic("email"),
            payload.notification_id.clone(),
            serde_json::to_string(payload).unwrap(),
        ))
        .await
        .unwrap();
    }

    fn drain_status(bus: &MemoryBus) -> Vec<StatusMessage> {
        bus.drain(STATUS_TOPIC)
            .into_iter()
            .map(|body| serde_json::from_str(&body).unwrap())
            .collect()
    }

    fn drain_delayed(bus: &MemoryBus) -> Vec<DelayedMessage> {
        bus.drain(DELAYED_TOPIC)
            .into_iter()
            .map(|body| serde_json::from_str(&body).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_happy_path_delivers_and_publishes_status() {
        let provider = ScriptedProvider::always(DeliveryResult::delivered("m-1"));
        let h = harness(provider.clone());

        publish_payload(&h.bus, &payload("n-1")).await;
        let handled = h.consumer.process_available().await.unwrap();
        assert_eq!(handled, 1);

        assert_eq!(provider.call_count(), 1);
        assert_eq!(
            h.coord.get("n-1").await.unwrap(),
            Some(IdempotencyState::Delivered)
        );

        let statuses = drain_status(&h.bus);
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].status, TerminalStatus::Delivered);
        assert_eq!(statuses[0].notification_id, "n-1");

        // Channel topic is empty: the message was acked
        assert_eq!(h.bus.depth(&channel_topic("email")), 0);
    }

    #[tokio::test]
    async fn test_duplicate_is_acked_without_send() {
        let provider = ScriptedProvider::always(DeliveryResult::delivered("m-1"));
        let h = harness(provider.clone());

        h.coord.set_delivered("n-1").await.unwrap();
        publish_payload(&h.bus, &payload("n-1")).await;
        h.consumer.process_available().await.unwrap();

        assert_eq!(provider.call_count(), 0);
        assert!(drain_status(&h.bus).is_empty());
        assert_eq!(h.bus.depth(&channel_topic("email")), 0);
    }

    #[tokio::test]
    async fn test_poison_pill_is_acked() {
        let provider = ScriptedProvider::always(DeliveryResult::delivered("m-1"));
        let h = harness(provider.clone());

        use nh_bus::BusPublisher;
        h.bus
            .publish(TopicMessage::new(
                channel_topic("email"),
                "k",
                "not json at all",
            ))
            .await
            .unwrap();

        h.consumer.process_available().await.unwrap();
        assert_eq!(provider.call_count(), 0);
        assert_eq!(h.bus.depth(&channel_topic("email")), 0);
    }

    #[tokio::test]
    async fn test_validation_failure_is_dropped() {
        let provider = ScriptedProvider::always(DeliveryResult::delivered("m-1"));
        let h = harness(provider.clone());

        let mut bad = payload("n-1");
        bad.recipient = serde_json::json!({"phone": "+1555"});
        publish_payload(&h.bus, &bad).await;

        h.consumer.process_available().await.unwrap();
        assert_eq!(provider.call_count(), 0);
        assert_eq!(h.bus.depth(&channel_topic("email")), 0);
        assert!(drain_status(&h.bus).is_empty());
    }

    #[tokio::test]
    async fn test_rate_limited_reroutes_through_delayed_topic() {
        let provider = ScriptedProvider::always(DeliveryResult::delivered("m-1"));
        // One token, slow refill: the second message in the batch is limited
        let mut limits = RateLimits::new(100, 10.0);
        limits.set("email", 1, 0.5);
        let h = harness_with_limits(provider.clone(), limits);

        publish_payload(&h.bus, &payload("n-1")).await;
        publish_payload(&h.bus, &payload("n-2")).await;
        h.consumer.process_available().await.unwrap();

        // First sent, second rerouted
        assert_eq!(provider.call_count(), 1);
        let delayed = drain_delayed(&h.bus);
        assert_eq!(delayed.len(), 1);
        assert_eq!(delayed[0].payload.retry_count, 1);
        assert!(delayed[0].scheduled_at > Utc::now());
        assert_eq!(delayed[0].target_topic, channel_topic("email"));

        // The lock was released so the retry can re-acquire
        assert_eq!(
            h.coord.get(&delayed[0].notification_id).await.unwrap(),
            Some(IdempotencyState::Failed)
        );
    }

    #[tokio::test]
    async fn test_retryable_failure_schedules_backoff() {
        let provider = ScriptedProvider::always(DeliveryResult::failure(
            "TIMEOUT",
            "timed out",
            true,
        ));
        let h = harness(provider.clone());

        publish_payload(&h.bus, &payload("n-1")).await;
        h.consumer.process_available().await.unwrap();

        let delayed = drain_delayed(&h.bus);
        assert_eq!(delayed.len(), 1);
        assert_eq!(delayed[0].payload.retry_count, 1);

        // First retry backoff is 2^1 * base = 2s out
        let delta_ms = (delayed[0].scheduled_at - Utc::now()).num_milliseconds();
        assert!(delta_ms > 1000 && delta_ms <= 2100, "delta {}ms", delta_ms);

        // No terminal status yet
        assert!(drain_status(&h.bus).is_empty());
    }

    #[tokio::test]
    async fn test_non_retryable_failure_is_terminal() {
        let provider = ScriptedProvider::always(DeliveryResult::failure(
            "INVALID_ADDRESS",
            "no such mailbox",
            false,
        ));
        let h = harness(provider.clone());

        publish_payload(&h.bus, &payload("n-1")).await;
        h.consumer.process_available().await.unwrap();

        let statuses = drain_status(&h.bus);
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].status, TerminalStatus::Failed);
        assert!(statuses[0].message.as_ref().unwrap().contains("INVALID_ADDRESS"));

        assert!(drain_delayed(&h.bus).is_empty());
        assert_eq!(
            h.coord.get("n-1").await.unwrap(),
            Some(IdempotencyState::Failed)
        );
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_terminally() {
        let provider = ScriptedProvider::always(DeliveryResult::failure(
            "TIMEOUT",
            "timed out",
            true,
        ));
        let h = harness(provider.clone());

        // Fourth attempt on a max_retry_count of 3
        let mut p = payload("n-1");
        p.retry_count = 3;
        publish_payload(&h.bus, &p).await;
        h.consumer.process_available().await.unwrap();

        let statuses = drain_status(&h.bus);
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].status, TerminalStatus::Failed);
        assert_eq!(statuses[0].retry_count, 3);
        assert!(drain_delayed(&h.bus).is_empty());
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failure() {
        let provider = ScriptedProvider::new(vec![
            DeliveryResult::failure("TIMEOUT", "timed out", true),
            DeliveryResult::delivered("m-2"),
        ]);
        let h = harness(provider.clone());

        publish_payload(&h.bus, &payload("n-1")).await;
        h.consumer.process_available().await.unwrap();

        // Simulate the scheduled poller re-injecting the delayed payload
        let delayed = drain_delayed(&h.bus);
        assert_eq!(delayed.len(), 1);
        publish_payload(&h.bus, &delayed[0].payload).await;
        h.consumer.process_available().await.unwrap();

        assert_eq!(provider.call_count(), 2);
        let statuses = drain_status(&h.bus);
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].status, TerminalStatus::Delivered);
        assert_eq!(
            h.coord.get("n-1").await.unwrap(),
            Some(IdempotencyState::Delivered)
        );
    }
}
