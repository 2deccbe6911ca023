//! In-memory gossip network
//!
//! A [`MemoryNetwork`] is shared by every node of a test. Each node gets a
//! [`MemoryGossip`] handle implementing [`GossipEffects`]. Publishing delivers
//! to every live subscription of the topic, the publisher's own included,
//! which mirrors how pub/sub meshes loop messages back to local subscribers.
//!
//! Faults can be injected per topic to exercise the recovery paths of the
//! broadcaster and the client cache.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use strata_core::effects::{
    GossipEffects, GossipError, GossipMessage, GossipSubscription, GossipTopic, PeerId,
};
use tokio::sync::{broadcast, watch};

/// Per-topic channel capacity; slow subscribers beyond it observe `Lagged`
const TOPIC_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
enum Delivery {
    Message(GossipMessage),
    Fault(GossipError),
}

/// Shared pub/sub fabric connecting test nodes
#[derive(Debug)]
pub struct MemoryNetwork {
    topics: Mutex<HashMap<String, broadcast::Sender<Delivery>>>,
    subscribe_failures: Mutex<HashMap<String, VecDeque<GossipError>>>,
    published: Mutex<HashMap<String, usize>>,
    subscribe_calls: AtomicUsize,
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            topics: Mutex::new(HashMap::new()),
            subscribe_failures: Mutex::new(HashMap::new()),
            published: Mutex::new(HashMap::new()),
            subscribe_calls: AtomicUsize::new(0),
        })
    }

    /// Gossip handle for one node
    pub fn node(self: &Arc<Self>, peer: impl Into<String>) -> Arc<MemoryGossip> {
        Arc::new(MemoryGossip {
            network: Arc::clone(self),
            peer: PeerId::new(peer),
        })
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Delivery> {
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    fn deliver(&self, topic: &str, delivery: Delivery) {
        // No receivers is not an error for pub/sub
        let _ = self.sender(topic).send(delivery);
    }

    fn publish_from(&self, peer: &PeerId, topic: &str, data: Vec<u8>) {
        *self.published.lock().entry(topic.to_string()).or_default() += 1;
        self.deliver(
            topic,
            Delivery::Message(GossipMessage {
                topic: topic.to_string(),
                data,
                from: Some(peer.clone()),
            }),
        );
    }

    fn open_subscription(
        &self,
        topic: &str,
        closed: Option<watch::Receiver<bool>>,
    ) -> Result<Box<dyn GossipSubscription>, GossipError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self
            .subscribe_failures
            .lock()
            .get_mut(topic)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        Ok(Box::new(MemorySubscription {
            topic: topic.to_string(),
            receiver: self.sender(topic).subscribe(),
            closed,
            cancelled: false,
        }))
    }

    /// Deliver `err` to every live subscription of `topic`
    pub fn inject_fault(&self, topic: &str, err: GossipError) {
        self.deliver(topic, Delivery::Fault(err));
    }

    /// Make the next subscribe call on `topic` fail with `err`
    pub fn fail_next_subscribe(&self, topic: &str, err: GossipError) {
        self.subscribe_failures
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push_back(err);
    }

    /// Live subscriptions of `topic` across all nodes
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .get(topic)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Messages published on `topic` so far
    pub fn published_count(&self, topic: &str) -> usize {
        self.published.lock().get(topic).copied().unwrap_or(0)
    }

    /// Subscribe calls made across all topics, failed ones included
    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }
}

/// One node's view of the network
#[derive(Debug)]
pub struct MemoryGossip {
    network: Arc<MemoryNetwork>,
    peer: PeerId,
}

impl MemoryGossip {
    /// Identifier of this node
    pub fn peer_id(&self) -> &PeerId {
        &self.peer
    }

    /// Network this node is attached to
    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }
}

#[async_trait]
impl GossipEffects for MemoryGossip {
    async fn join(&self, topic: &str) -> Result<Arc<dyn GossipTopic>, GossipError> {
        let (closed_tx, _) = watch::channel(false);
        Ok(Arc::new(MemoryTopic {
            name: topic.to_string(),
            network: Arc::clone(&self.network),
            peer: self.peer.clone(),
            closed: AtomicBool::new(false),
            closed_tx,
        }))
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), GossipError> {
        self.network.publish_from(&self.peer, topic, data);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Box<dyn GossipSubscription>, GossipError> {
        self.network.open_subscription(topic, None)
    }
}

/// Joined topic handle. Closing it ends the subscriptions opened through it
/// without touching other nodes.
#[derive(Debug)]
pub struct MemoryTopic {
    name: String,
    network: Arc<MemoryNetwork>,
    peer: PeerId,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl MemoryTopic {
    fn check_open(&self) -> Result<(), GossipError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GossipError::TopicClosed {
                topic: self.name.clone(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl GossipTopic for MemoryTopic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, data: Vec<u8>) -> Result<(), GossipError> {
        self.check_open()?;
        self.network.publish_from(&self.peer, &self.name, data);
        Ok(())
    }

    async fn subscribe(&self) -> Result<Box<dyn GossipSubscription>, GossipError> {
        self.check_open()?;
        self.network
            .open_subscription(&self.name, Some(self.closed_tx.subscribe()))
    }

    async fn close(&self) -> Result<(), GossipError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(GossipError::TopicClosed {
                topic: self.name.clone(),
            });
        }
        self.closed_tx.send_replace(true);
        Ok(())
    }
}

struct MemorySubscription {
    topic: String,
    receiver: broadcast::Receiver<Delivery>,
    closed: Option<watch::Receiver<bool>>,
    cancelled: bool,
}

async fn topic_closed(closed: &mut Option<watch::Receiver<bool>>) {
    match closed {
        Some(rx) => {
            // A dropped sender means the topic handle is gone
            let _ = rx.wait_for(|closed| *closed).await;
        }
        None => std::future::pending().await,
    }
}

#[async_trait]
impl GossipSubscription for MemorySubscription {
    async fn next(&mut self) -> Result<GossipMessage, GossipError> {
        if self.cancelled {
            return Err(GossipError::Cancelled);
        }
        let topic = self.topic.clone();
        tokio::select! {
            biased;
            _ = topic_closed(&mut self.closed) => Err(GossipError::TopicClosed { topic }),
            received = self.receiver.recv() => match received {
                Ok(Delivery::Message(message)) => Ok(message),
                Ok(Delivery::Fault(err)) => Err(err),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    Err(GossipError::Lagged { skipped })
                }
                Err(broadcast::error::RecvError::Closed) => Err(GossipError::TopicClosed { topic }),
            },
        }
    }

    fn cancel(&mut self) {
        self.cancelled = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let network = MemoryNetwork::new();
        let a = network.node("a");
        let b = network.node("b");

        let mut sub_a = a.subscribe("t").await.unwrap();
        let mut sub_b = b.subscribe("t").await.unwrap();
        a.publish("t", b"hi".to_vec()).await.unwrap();

        assert_eq!(sub_a.next().await.unwrap().data, b"hi");
        let message = sub_b.next().await.unwrap();
        assert_eq!(message.from, Some(PeerId::new("a")));
        assert_eq!(network.published_count("t"), 1);
    }

    #[tokio::test]
    async fn closing_a_topic_handle_ends_its_subscriptions_only() {
        let network = MemoryNetwork::new();
        let a = network.node("a");
        let topic = a.join("t").await.unwrap();
        let mut through_handle = topic.subscribe().await.unwrap();
        let mut direct = a.subscribe("t").await.unwrap();

        topic.close().await.unwrap();
        let err = through_handle.next().await.unwrap_err();
        assert!(err.is_graceful_shutdown());
        assert!(topic.publish(vec![1]).await.is_err());

        a.publish("t", vec![2]).await.unwrap();
        assert_eq!(direct.next().await.unwrap().data, vec![2]);
    }

    #[tokio::test]
    async fn injected_faults_and_subscribe_failures() {
        let network = MemoryNetwork::new();
        let a = network.node("a");
        let mut sub = a.subscribe("t").await.unwrap();

        network.inject_fault("t", GossipError::ReceiveFailed { reason: "reset".into() });
        assert_eq!(
            sub.next().await.unwrap_err(),
            GossipError::ReceiveFailed { reason: "reset".into() }
        );

        network.fail_next_subscribe("t", GossipError::Shutdown);
        assert!(a.subscribe("t").await.is_err());
        assert!(a.subscribe("t").await.is_ok());
        assert_eq!(network.subscribe_calls(), 3);
    }

    #[tokio::test]
    async fn cancelled_subscription_stops() {
        let network = MemoryNetwork::new();
        let mut sub = network.node("a").subscribe("t").await.unwrap();
        sub.cancel();
        assert_eq!(sub.next().await.unwrap_err(), GossipError::Cancelled);
    }
}
