//! Publish/subscribe seam for the surrounding message-bus transport.
//!
//! The transport itself (broker connection, QoS, reconnection) is external
//! glue; this core only needs a capability to publish text payloads on named
//! topics and to receive inbound command payloads. [`MemoryBus`] is the
//! in-process implementation used by tests and bench-top runs.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;

/// Capacity of per-topic subscriber channels.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

/// Publish/subscribe capability over the node's message bus.
///
/// `publish` is infallible from the caller's perspective: delivery problems
/// are the transport's to log and retry, and never stall the sampling loop.
pub trait MessageBus: Send + Sync {
    fn publish(&self, topic: &str, payload: &str);

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<String>;
}

/// In-process bus that records every published message and fans them out to
/// subscribers.
#[derive(Default)]
pub struct MemoryBus {
    published: Mutex<Vec<(String, String)>>,
    topics: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message published so far, in order, as (topic, payload) pairs.
    pub fn published(&self) -> Vec<(String, String)> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Payloads published on one topic, in order.
    pub fn published_on(&self, topic: &str) -> Vec<String> {
        self.published()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload)
            .collect()
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<String> {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIBER_CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl MessageBus for MemoryBus {
    fn publish(&self, topic: &str, payload: &str) {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((topic.to_string(), payload.to_string()));
        // A send error just means nobody is subscribed to this topic.
        let _ = self.sender_for(topic).send(payload.to_string());
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<String> {
        self.sender_for(topic).subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_published_messages_in_order() {
        let bus = MemoryBus::new();
        bus.publish("a", "one");
        bus.publish("b", "two");
        bus.publish("a", "three");
        assert_eq!(bus.published_on("a"), vec!["one", "three"]);
        assert_eq!(bus.published_on("b"), vec!["two"]);
    }

    #[tokio::test]
    async fn subscribers_receive_later_publishes() {
        let bus = MemoryBus::new();
        let mut rx = bus.subscribe("commands");
        bus.publish("commands", "START_LOGGING");
        assert_eq!(rx.recv().await.expect("recv"), "START_LOGGING");
    }
}
