//! Broker seam. Real drivers (Kafka, RabbitMQ) live outside the core; they
//! only deliver and acknowledge encoded messages. The in-memory driver backs
//! tests and single-process runs.

use std::collections::HashMap;

use async_trait::async_trait;
use snafu::prelude::*;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Inbound channel: continuations to execute.
pub const TOPIC_IN: &str = "workflows-in";
/// Outbound channel: events emitted by workflows (CloudEvents).
pub const TOPIC_OUT: &str = "workflows-out";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("publish to {topic} failed: {message}"))]
    Publish { topic: String, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// One delivered payload. Acknowledgement is the driver's concern: the
/// consumer returns from handling only after its continuations are durably
/// committed, and the driver acks (or redelivers) on that boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub payload: String,
}

#[async_trait]
pub trait Broker: Send + Sync + std::fmt::Debug {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()>;
    async fn subscribe(&self, topic: &str) -> Result<mpsc::UnboundedReceiver<Delivery>>;
}

#[derive(Debug, Default)]
struct InMemoryTopic {
    subscribers: Vec<mpsc::UnboundedSender<Delivery>>,
    /// Payloads published before anyone subscribed; drained on subscribe.
    backlog: Vec<String>,
}

/// Process-local broker with per-topic fan-out.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    topics: Mutex<HashMap<String, InMemoryTopic>>,
}

impl InMemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Test support: pop everything currently buffered on a topic without
    /// subscribing.
    pub async fn drain(&self, topic: &str) -> Vec<String> {
        let mut topics = self.topics.lock().await;
        topics
            .entry(topic.to_string())
            .or_default()
            .backlog
            .drain(..)
            .collect()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        let mut topics = self.topics.lock().await;
        let entry = topics.entry(topic.to_string()).or_default();

        entry.subscribers.retain(|sender| !sender.is_closed());
        if entry.subscribers.is_empty() {
            debug!(topic, "no subscribers, buffering payload");
            entry.backlog.push(payload.to_string());
            return Ok(());
        }
        for sender in &entry.subscribers {
            sender
                .send(Delivery {
                    payload: payload.to_string(),
                })
                .map_err(|e| Error::Publish {
                    topic: topic.to_string(),
                    message: e.to_string(),
                })?;
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::UnboundedReceiver<Delivery>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut topics = self.topics.lock().await;
        let entry = topics.entry(topic.to_string()).or_default();
        for payload in entry.backlog.drain(..) {
            let _ = sender.send(Delivery { payload });
        }
        entry.subscribers.push(sender);
        Ok(receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let broker = InMemoryBroker::new();
        let mut receiver = broker.subscribe(TOPIC_IN).await.unwrap();
        broker.publish(TOPIC_IN, "hello").await.unwrap();
        let delivery = receiver.recv().await.unwrap();
        assert_eq!(delivery.payload, "hello");
    }

    #[tokio::test]
    async fn backlog_is_replayed_to_late_subscriber() {
        let broker = InMemoryBroker::new();
        broker.publish(TOPIC_OUT, "early").await.unwrap();
        let mut receiver = broker.subscribe(TOPIC_OUT).await.unwrap();
        assert_eq!(receiver.recv().await.unwrap().payload, "early");
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let broker = InMemoryBroker::new();
        let mut on_in = broker.subscribe(TOPIC_IN).await.unwrap();
        broker.publish(TOPIC_OUT, "event").await.unwrap();
        assert!(on_in.try_recv().is_err());
        assert_eq!(broker.drain(TOPIC_OUT).await, vec!["event".to_string()]);
    }
}
