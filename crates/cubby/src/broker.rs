//! Cross-gateway message broker.
//!
//! Presence updates and relayed user messages travel through a broker so
//! multiple gateway instances see each other's traffic. The interface is
//! deliberately narrow (publish / subscribe per topic); the in-process
//! implementation backs a single-instance deployment and the test suite,
//! while an external broker can be swapped in behind the same trait.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;

/// Capacity of each topic's broadcast channel.
const TOPIC_BUFFER_SIZE: usize = 256;

/// Well-known topics.
pub const TOPIC_PRESENCE: &str = "presence";
pub const TOPIC_MESSAGES: &str = "messages";

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Publish a payload to every subscriber of `topic`, across instances.
    async fn publish(&self, topic: &str, payload: Value) -> anyhow::Result<()>;

    /// Subscribe to a topic. Messages published before the subscription are
    /// not replayed.
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<Value>;
}

/// In-process broker backed by per-topic broadcast channels.
#[derive(Default)]
pub struct LocalBroker {
    topics: DashMap<String, broadcast::Sender<Value>>,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Value> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_BUFFER_SIZE).0)
            .clone()
    }
}

#[async_trait]
impl MessageBroker for LocalBroker {
    async fn publish(&self, topic: &str, payload: Value) -> anyhow::Result<()> {
        // No subscribers is fine; the send result only signals that.
        let _ = self.sender(topic).send(payload);
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<Value> {
        self.sender(topic).subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let broker = LocalBroker::new();
        let mut rx = broker.subscribe(TOPIC_MESSAGES);

        broker
            .publish(TOPIC_MESSAGES, json!({"text": "hi"}))
            .await
            .unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg["text"], "hi");
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let broker = LocalBroker::new();
        let mut presence = broker.subscribe(TOPIC_PRESENCE);
        let mut messages = broker.subscribe(TOPIC_MESSAGES);

        broker
            .publish(TOPIC_PRESENCE, json!({"userId": "u1"}))
            .await
            .unwrap();

        assert_eq!(presence.recv().await.unwrap()["userId"], "u1");
        assert!(messages.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let broker = LocalBroker::new();
        broker.publish("empty", json!(1)).await.unwrap();
    }
}
