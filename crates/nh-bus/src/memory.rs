//! In-process bus for unit tests and single-process embedded runs.
//!
//! Mirrors the observable semantics of the durable backends: visibility
//! timeouts, nack-with-delay, and per-key serialization.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::{
    BusConsumer, BusError, BusMetrics, BusPublisher, ReceivedMessage, Result, TopicMessage,
};

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    key: String,
    body: String,
    visible_at: DateTime<Utc>,
    receipt_handle: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct BusState {
    topics: HashMap<String, Vec<StoredMessage>>,
}

/// Shared in-memory bus. Cloning shares the underlying state.
#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consumer(&self, topic: impl Into<String>) -> MemoryTopicConsumer {
        MemoryTopicConsumer {
            bus: self.clone(),
            topic: topic.into(),
        }
    }

    /// Number of messages currently stored on a topic, regardless of
    /// visibility. Test helper.
    pub fn depth(&self, topic: &str) -> usize {
        self.state
            .lock()
            .topics
            .get(topic)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Drain every message body currently on a topic. Test helper.
    pub fn drain(&self, topic: &str) -> Vec<String> {
        let mut state = self.state.lock();
        state
            .topics
            .remove(topic)
            .map(|msgs| msgs.into_iter().map(|m| m.body).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BusPublisher for MemoryBus {
    async fn publish(&self, message: TopicMessage) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let mut state = self.state.lock();
        state
            .topics
            .entry(message.topic.clone())
            .or_default()
            .push(StoredMessage {
                id: id.clone(),
                key: message.key,
                body: message.body,
                visible_at: now,
                receipt_handle: None,
                created_at: now,
            });
        debug!(topic = %message.topic, message_id = %id, "Message published to memory bus");
        Ok(id)
    }
}

/// Consumer over one topic of the in-memory bus.
pub struct MemoryTopicConsumer {
    bus: MemoryBus,
    topic: String,
}

#[async_trait]
impl BusConsumer for MemoryTopicConsumer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn poll(&self, max_messages: u32) -> Result<Vec<ReceivedMessage>> {
        let now = Utc::now();
        let visibility = ChronoDuration::seconds(30);
        let mut state = self.bus.state.lock();

        let Some(messages) = state.topics.get_mut(&self.topic) else {
            return Ok(Vec::new());
        };
        messages.sort_by_key(|m| m.created_at);

        let mut received = Vec::new();
        let mut keys_seen: Vec<String> = Vec::new();

        for msg in messages.iter_mut() {
            if received.len() as u32 >= max_messages {
                break;
            }
            if keys_seen.contains(&msg.key) {
                continue;
            }
            keys_seen.push(msg.key.clone());

            // In-flight or future messages block their whole key
            if msg.visible_at > now {
                continue;
            }

            let handle = uuid::Uuid::new_v4().to_string();
            msg.receipt_handle = Some(handle.clone());
            msg.visible_at = now + visibility;

            received.push(ReceivedMessage {
                topic: self.topic.clone(),
                key: Some(msg.key.clone()),
                body: msg.body.clone(),
                receipt_handle: handle,
                broker_message_id: Some(msg.id.clone()),
            });
        }

        Ok(received)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let mut state = self.bus.state.lock();
        let messages = state
            .topics
            .get_mut(&self.topic)
            .ok_or_else(|| BusError::NotFound(receipt_handle.to_string()))?;

        let before = messages.len();
        messages.retain(|m| m.receipt_handle.as_deref() != Some(receipt_handle));
        if messages.len() == before {
            return Err(BusError::NotFound(receipt_handle.to_string()));
        }
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()> {
        let mut state = self.bus.state.lock();
        let messages = state
            .topics
            .get_mut(&self.topic)
            .ok_or_else(|| BusError::NotFound(receipt_handle.to_string()))?;

        for msg in messages.iter_mut() {
            if msg.receipt_handle.as_deref() == Some(receipt_handle) {
                msg.receipt_handle = None;
                msg.visible_at =
                    Utc::now() + ChronoDuration::seconds(delay_seconds.unwrap_or(0) as i64);
                return Ok(());
            }
        }
        Err(BusError::NotFound(receipt_handle.to_string()))
    }

    fn is_healthy(&self) -> bool {
        true
    }

    async fn stop(&self) {}

    async fn get_metrics(&self) -> Result<Option<BusMetrics>> {
        let now = Utc::now();
        let state = self.bus.state.lock();
        let (pending, in_flight) = state
            .topics
            .get(&self.topic)
            .map(|msgs| {
                let in_flight = msgs.iter().filter(|m| m.receipt_handle.is_some()).count();
                let pending = msgs
                    .iter()
                    .filter(|m| m.receipt_handle.is_none() && m.visible_at <= now)
                    .count();
                (pending, in_flight)
            })
            .unwrap_or((0, 0));

        Ok(Some(BusMetrics {
            pending_messages: pending as u64,
            in_flight_messages: in_flight as u64,
            topic: self.topic.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_poll_ack() {
        let bus = MemoryBus::new();
        let consumer = bus.consumer("t");

        bus.publish(TopicMessage::new("t", "k1", "hello")).await.unwrap();

        let messages = consumer.poll(10).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, "hello");

        consumer.ack(&messages[0].receipt_handle).await.unwrap();
        assert_eq!(bus.depth("t"), 0);
    }

    #[tokio::test]
    async fn test_in_flight_message_blocks_key() {
        let bus = MemoryBus::new();
        let consumer = bus.consumer("t");

        bus.publish(TopicMessage::new("t", "k1", "first")).await.unwrap();
        bus.publish(TopicMessage::new("t", "k1", "second")).await.unwrap();
        bus.publish(TopicMessage::new("t", "k2", "other")).await.unwrap();

        let messages = consumer.poll(10).await.unwrap();
        let bodies: Vec<_> = messages.iter().map(|m| m.body.as_str()).collect();
        assert!(bodies.contains(&"first"));
        assert!(bodies.contains(&"other"));
        assert!(!bodies.contains(&"second"));
    }

    #[tokio::test]
    async fn test_nack_makes_visible_again() {
        let bus = MemoryBus::new();
        let consumer = bus.consumer("t");

        bus.publish(TopicMessage::new("t", "k1", "m")).await.unwrap();
        let messages = consumer.poll(10).await.unwrap();

        consumer.nack(&messages[0].receipt_handle, None).await.unwrap();

        let messages = consumer.poll(10).await.unwrap();
        assert_eq!(messages.len(), 1);
    }
}
