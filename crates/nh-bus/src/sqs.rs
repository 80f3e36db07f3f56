//! AWS SQS FIFO bus backend.
//!
//! One FIFO queue per topic. The partition key maps to the SQS message
//! group id, which serializes delivery per key; the broker message id maps
//! to the deduplication id so replays of the same outbox row collapse.

use async_trait::async_trait;
use aws_sdk_sqs::{types::QueueAttributeName, Client};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info};

use crate::{
    BusConsumer, BusError, BusMetrics, BusPublisher, ReceivedMessage, Result, TopicMessage,
};

fn queue_url_for_topic(prefix: &str, topic: &str) -> String {
    format!("{}/{}.fifo", prefix.trim_end_matches('/'), topic)
}

/// SQS publisher routing each message to its topic's FIFO queue.
pub struct SqsBusPublisher {
    client: Client,
    queue_url_prefix: String,
}

impl SqsBusPublisher {
    pub fn new(client: Client, queue_url_prefix: String) -> Self {
        Self {
            client,
            queue_url_prefix,
        }
    }
}

#[async_trait]
impl BusPublisher for SqsBusPublisher {
    async fn publish(&self, message: TopicMessage) -> Result<String> {
        let queue_url = queue_url_for_topic(&self.queue_url_prefix, &message.topic);
        let dedup_id = uuid::Uuid::new_v4().to_string();

        let result = self
            .client
            .send_message()
            .queue_url(&queue_url)
            .message_body(&message.body)
            .message_group_id(&message.key)
            .message_deduplication_id(&dedup_id)
            .send()
            .await
            .map_err(|e| BusError::Sqs(e.to_string()))?;

        let message_id = result.message_id().unwrap_or(&dedup_id).to_string();
        debug!(
            topic = %message.topic,
            key = %message.key,
            message_id = %message_id,
            "Message published to SQS"
        );
        Ok(message_id)
    }
}

/// SQS consumer over one topic's FIFO queue.
pub struct SqsTopicConsumer {
    client: Client,
    queue_url: String,
    topic: String,
    visibility_timeout_seconds: i32,
    wait_time_seconds: i32,
    running: AtomicBool,
}

impl SqsTopicConsumer {
    /// Default long poll wait time in seconds.
    /// 5 seconds balances efficiency with shutdown responsiveness.
    pub const DEFAULT_WAIT_TIME_SECONDS: i32 = 5;

    pub fn new(
        client: Client,
        queue_url_prefix: &str,
        topic: impl Into<String>,
        visibility_timeout_seconds: i32,
    ) -> Self {
        let topic = topic.into();
        Self {
            queue_url: queue_url_for_topic(queue_url_prefix, &topic),
            client,
            topic,
            visibility_timeout_seconds,
            wait_time_seconds: Self::DEFAULT_WAIT_TIME_SECONDS,
            running: AtomicBool::new(true),
        }
    }

    /// Set the long poll wait time in seconds (max 20).
    pub fn with_wait_time_seconds(mut self, seconds: i32) -> Self {
        self.wait_time_seconds = seconds.clamp(0, 20);
        self
    }
}

#[async_trait]
impl BusConsumer for SqsTopicConsumer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn poll(&self, max_messages: u32) -> Result<Vec<ReceivedMessage>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(BusError::Stopped);
        }

        let result = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages.min(10) as i32) // SQS max is 10
            .visibility_timeout(self.visibility_timeout_seconds)
            .wait_time_seconds(self.wait_time_seconds)
            .message_system_attribute_names(
                aws_sdk_sqs::types::MessageSystemAttributeName::MessageGroupId,
            )
            .send()
            .await
            .map_err(|e| BusError::Sqs(e.to_string()))?;

        let sqs_messages = result.messages.unwrap_or_default();
        let mut messages = Vec::with_capacity(sqs_messages.len());

        for sqs_msg in sqs_messages {
            let Some(receipt_handle) = sqs_msg.receipt_handle().map(str::to_string) else {
                error!(topic = %self.topic, "SQS message missing receipt handle");
                continue;
            };
            let Some(body) = sqs_msg.body().map(str::to_string) else {
                // Malformed message: drop it rather than redeliver forever
                let _ = self.ack(&receipt_handle).await;
                continue;
            };

            let key = sqs_msg
                .attributes()
                .and_then(|attrs| {
                    attrs.get(&aws_sdk_sqs::types::MessageSystemAttributeName::MessageGroupId)
                })
                .cloned();

            messages.push(ReceivedMessage {
                topic: self.topic.clone(),
                key,
                body,
                receipt_handle,
                broker_message_id: sqs_msg.message_id().map(str::to_string),
            });
        }

        if !messages.is_empty() {
            debug!(
                topic = %self.topic,
                count = messages.len(),
                "Polled messages from SQS"
            );
        }

        Ok(messages)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| BusError::Sqs(e.to_string()))?;

        debug!(
            receipt_handle = %receipt_handle,
            topic = %self.topic,
            "Message acknowledged in SQS"
        );
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()> {
        // In SQS, NACK is done by shrinking the visibility timeout
        let visibility_timeout = delay_seconds.unwrap_or(0) as i32;

        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(visibility_timeout)
            .send()
            .await
            .map_err(|e| BusError::Sqs(e.to_string()))?;

        debug!(
            receipt_handle = %receipt_handle,
            topic = %self.topic,
            visibility_timeout = visibility_timeout,
            "Message NACKed in SQS"
        );
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(topic = %self.topic, "SQS consumer stopped");
    }

    async fn get_metrics(&self) -> Result<Option<BusMetrics>> {
        let result = self
            .client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
            .send()
            .await
            .map_err(|e| BusError::Sqs(e.to_string()))?;

        let attributes = result.attributes();

        let pending_messages = attributes
            .and_then(|attrs| attrs.get(&QueueAttributeName::ApproximateNumberOfMessages))
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        let in_flight_messages = attributes
            .and_then(|attrs| attrs.get(&QueueAttributeName::ApproximateNumberOfMessagesNotVisible))
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        Ok(Some(BusMetrics {
            pending_messages,
            in_flight_messages,
            topic: self.topic.clone(),
        }))
    }
}
