use async_trait::async_trait;

pub mod error;
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqs")]
pub mod sqs;

pub use error::BusError;
pub use memory::MemoryBus;

pub type Result<T> = std::result::Result<T, BusError>;

/// A message addressed to a topic.
///
/// `key` is the partition key: all messages for one key are delivered in
/// order to one consumer at a time. Dispatch keys by notification id so
/// duplicate detection stays local to a single consumer.
#[derive(Debug, Clone)]
pub struct TopicMessage {
    pub topic: String,
    pub key: String,
    pub body: String,
}

impl TopicMessage {
    pub fn new(topic: impl Into<String>, key: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            body: body.into(),
        }
    }
}

/// A message received from a topic with its redelivery handle.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub topic: String,
    pub key: Option<String>,
    pub body: String,
    pub receipt_handle: String,
    /// Broker-side message id, where the backend exposes one.
    pub broker_message_id: Option<String>,
}

/// Bus metrics for monitoring
#[derive(Debug, Clone, Default)]
pub struct BusMetrics {
    pub pending_messages: u64,
    pub in_flight_messages: u64,
    pub topic: String,
}

/// Trait for publishing messages to the bus.
///
/// `publish` resolves only once the message is durably accepted by the
/// broker; the outbox dispatcher relies on this before marking rows
/// published.
#[async_trait]
pub trait BusPublisher: Send + Sync {
    /// Publish a single message, returning the broker message id.
    async fn publish(&self, message: TopicMessage) -> Result<String>;

    /// Publish a batch of messages to the same or different topics.
    async fn publish_batch(&self, messages: Vec<TopicMessage>) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(messages.len());
        for message in messages {
            ids.push(self.publish(message).await?);
        }
        Ok(ids)
    }
}

/// Trait for consuming messages from one topic.
///
/// Offset handling is manual: a message stays invisible for the visibility
/// window after `poll` and redelivers unless `ack`ed. `nack` makes it
/// visible again after an optional delay.
#[async_trait]
pub trait BusConsumer: Send + Sync {
    /// The topic this consumer reads.
    fn topic(&self) -> &str;

    /// Poll for messages.
    async fn poll(&self, max_messages: u32) -> Result<Vec<ReceivedMessage>>;

    /// Acknowledge a message (the commit).
    async fn ack(&self, receipt_handle: &str) -> Result<()>;

    /// Return a message to the topic, visible again after the delay.
    async fn nack(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()>;

    /// Check if the consumer is healthy.
    fn is_healthy(&self) -> bool;

    /// Stop the consumer.
    async fn stop(&self);

    /// Get topic metrics (pending/in-flight counts), where available.
    async fn get_metrics(&self) -> Result<Option<BusMetrics>> {
        Ok(None)
    }
}

/// Combined publisher plus per-topic consumer factory for embedded mode.
#[async_trait]
pub trait EmbeddedBus: BusPublisher {
    /// Initialize the bus schema (create tables, etc.)
    async fn init_schema(&self) -> Result<()>;
}
