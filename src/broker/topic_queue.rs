//! Topic fan-out queue.
//!
//! A publish reaches every worker link (when the queue lives on the
//! coordinator) and every local subscription whose pattern matches. Publishes
//! with no matching subscriber are dropped; nothing is buffered.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::message::WireMessage;
use crate::bus::{Payload, Result};
use crate::cluster::WorkerRegistry;
use crate::topic::{self, Matcher};

/// A message received on a subscribe queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub topic: String,
    pub payload: Payload,
}

impl Delivery {
    /// Decode the payload into a concrete type.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        crate::bus::decode(self.payload.clone())
    }
}

/// Identifies one subscription on a topic queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where matching deliveries for a subscription are sent.
pub type DeliverySink = mpsc::UnboundedSender<Delivery>;

struct Subscription {
    id: SubscriptionId,
    matcher: Matcher,
    sink: DeliverySink,
}

/// Named fan-out channel filtered by hierarchical pattern match.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct TopicQueue {
    name: Arc<str>,
    workers: Option<WorkerRegistry>,
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
}

impl TopicQueue {
    /// Coordinator-side queue: publishes are broadcast to every worker link.
    pub fn new(name: impl Into<String>, workers: WorkerRegistry) -> Self {
        Self::build(name.into(), Some(workers))
    }

    /// Worker-side queue: local subscribers only.
    pub fn local(name: impl Into<String>) -> Self {
        Self::build(name.into(), None)
    }

    fn build(name: String, workers: Option<WorkerRegistry>) -> Self {
        Self {
            name: Arc::from(name),
            workers,
            subscriptions: Arc::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish to all workers and all matching local subscribers.
    pub fn publish(&self, topic: Option<&str>, payload: Payload) -> Result<()> {
        let topic = topic::normalize(topic)?;

        if let Some(workers) = &self.workers {
            let sent = workers.broadcast(&WireMessage::PublishDelivery {
                queue_name: self.name.to_string(),
                topic: topic.clone(),
                payload: payload.clone(),
            });
            debug!(queue = %self.name, topic = %topic, workers = sent, "Publish broadcast");
        }

        self.deliver_local(&topic, payload)?;
        Ok(())
    }

    /// Evaluate local subscriptions only. Returns how many received the message.
    pub fn deliver_local(&self, topic: &str, payload: Payload) -> Result<usize> {
        let topic = topic::normalize(Some(topic))?;
        let mut delivered = 0;

        self.lock().retain(|subscription| {
            if !subscription.matcher.matches(&topic) {
                return true;
            }
            let delivery = Delivery {
                topic: topic.clone(),
                payload: payload.clone(),
            };
            match subscription.sink.send(delivery) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => {
                    debug!(
                        queue = %self.name,
                        subscription = %subscription.id,
                        "Subscriber is gone, dropping subscription"
                    );
                    false
                }
            }
        });

        Ok(delivered)
    }

    /// Compile `pattern` and add a subscription.
    pub fn subscribe(&self, pattern: Option<&str>, sink: DeliverySink) -> Result<SubscriptionId> {
        let matcher = Matcher::compile(pattern)?;
        let id = SubscriptionId::new();
        self.insert(id, matcher, sink);
        Ok(id)
    }

    /// Add a subscription with a caller-chosen id.
    pub fn insert(&self, id: SubscriptionId, matcher: Matcher, sink: DeliverySink) {
        debug!(queue = %self.name, subscription = %id, pattern = %matcher.pattern(), "Subscribed");
        self.lock().push(Subscription { id, matcher, sink });
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.lock();
        match subscriptions.iter().position(|s| s.id == id) {
            Some(index) => {
                subscriptions.remove(index);
                debug!(queue = %self.name, subscription = %id, "Unsubscribed");
                true
            }
            None => false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for TopicQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicQueue")
            .field("name", &self.name)
            .field("subscriptions", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusError;
    use crate::cluster::{WorkerId, WorkerLink};
    use serde_json::json;

    fn subscriber() -> (DeliverySink, mpsc::UnboundedReceiver<Delivery>) {
        mpsc::unbounded_channel()
    }

    fn topics(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(delivery) = rx.try_recv() {
            out.push(delivery.topic);
        }
        out
    }

    #[test]
    fn test_publish_fans_out_by_pattern() {
        let queue = TopicQueue::local("orders");
        let (all, mut all_rx) = subscriber();
        let (urgent, mut urgent_rx) = subscriber();
        queue.subscribe(None, all).unwrap();
        queue.subscribe(Some("orders.urgent"), urgent).unwrap();

        queue.publish(Some("orders.urgent.retry"), json!(1)).unwrap();
        queue.publish(Some("orders.normal"), json!(2)).unwrap();
        queue.publish(None, json!(3)).unwrap();

        assert_eq!(
            topics(&mut all_rx),
            vec!["orders.urgent.retry", "orders.normal", ""]
        );
        assert_eq!(topics(&mut urgent_rx), vec!["orders.urgent.retry"]);
    }

    #[test]
    fn test_publish_without_subscribers_is_dropped() {
        let queue = TopicQueue::local("orders");
        queue.publish(Some("orders"), json!("lost")).unwrap();

        let (sink, mut rx) = subscriber();
        queue.subscribe(None, sink).unwrap();
        assert!(topics(&mut rx).is_empty());
    }

    #[test]
    fn test_invalid_topic_is_rejected() {
        let queue = TopicQueue::local("orders");
        let (sink, mut rx) = subscriber();
        queue.subscribe(None, sink).unwrap();

        let err = queue.publish(Some("orders."), json!(1)).unwrap_err();
        assert!(matches!(err, BusError::InvalidTopic { .. }));
        assert!(queue.deliver_local("a..b", json!(1)).is_err());
        assert!(topics(&mut rx).is_empty());

        let (sink, _rx) = subscriber();
        assert!(queue.subscribe(Some("+"), sink).is_err());
    }

    #[test]
    fn test_unsubscribe_twice() {
        let queue = TopicQueue::local("orders");
        let (sink, mut rx) = subscriber();
        let id = queue.subscribe(None, sink).unwrap();

        assert!(queue.unsubscribe(id));
        assert!(!queue.unsubscribe(id));
        queue.publish(Some("orders"), json!(1)).unwrap();
        assert!(topics(&mut rx).is_empty());
    }

    #[test]
    fn test_closed_subscriber_is_dropped() {
        let queue = TopicQueue::local("orders");
        let (sink, rx) = subscriber();
        queue.subscribe(None, sink).unwrap();
        drop(rx);

        assert_eq!(queue.deliver_local("orders", json!(1)).unwrap(), 0);
        assert_eq!(queue.subscriber_count(), 0);
    }

    #[test]
    fn test_publish_broadcasts_to_workers() {
        let workers = WorkerRegistry::default();
        let (tx, mut link_rx) = mpsc::unbounded_channel();
        workers.insert(WorkerLink::new(WorkerId(1), tx));

        let queue = TopicQueue::new("orders", workers);
        queue.publish(Some("orders.urgent"), json!({"id": 7})).unwrap();

        assert_eq!(
            link_rx.try_recv().unwrap(),
            WireMessage::PublishDelivery {
                queue_name: "orders".to_string(),
                topic: "orders.urgent".to_string(),
                payload: json!({"id": 7}),
            }
        );
    }

    #[test]
    fn test_delivery_decode() {
        let delivery = Delivery {
            topic: "t".to_string(),
            payload: json!(42),
        };
        let value: u32 = delivery.decode().unwrap();
        assert_eq!(value, 42);
    }
}
