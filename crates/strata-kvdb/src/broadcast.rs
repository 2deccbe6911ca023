//! Gossip-backed delta dissemination for CRDT stores
//!
//! A [`PubSubBroadcaster`] bridges the CRDT engine's `broadcast`/`next`
//! contract to one gossip topic. The [`BroadcasterRegistry`] joins each topic
//! at most once and hands out the broadcaster already serving it.
//!
//! # Receive errors
//!
//! - shutdown and cancellation errors end the stream with `NoMoreBroadcast`
//! - lag is logged and reading continues on the same subscription
//! - anything else triggers a resubscribe, at most `max_resubscribe_attempts`
//!   times per `next` call, after which the stream ends

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use strata_core::effects::{
    BroadcastError, CrdtBroadcaster, GossipEffects, GossipError, GossipSubscription, GossipTopic,
};
use strata_core::KvdbConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Topic name to broadcaster, one entry per joined topic
pub struct BroadcasterRegistry {
    gossip: Arc<dyn GossipEffects>,
    broadcasters: Mutex<HashMap<String, Arc<PubSubBroadcaster>>>,
    max_resubscribe_attempts: u32,
}

impl BroadcasterRegistry {
    /// Registry joining topics through `gossip`
    pub fn new(gossip: Arc<dyn GossipEffects>, config: &KvdbConfig) -> Arc<Self> {
        Arc::new(Self {
            gossip,
            broadcasters: Mutex::new(HashMap::new()),
            max_resubscribe_attempts: config.max_resubscribe_attempts,
        })
    }

    /// Broadcaster for `topic`, joining and subscribing on first use.
    ///
    /// `scope` bounds the life of a newly created broadcaster; an existing
    /// broadcaster keeps its original scope.
    pub async fn broadcaster(
        self: &Arc<Self>,
        topic: &str,
        scope: CancellationToken,
    ) -> Result<Arc<PubSubBroadcaster>, GossipError> {
        if let Some(existing) = self.get(topic) {
            return Ok(existing);
        }

        let handle = self.gossip.join(topic).await?;
        let subscription = match handle.subscribe().await {
            Ok(subscription) => subscription,
            Err(err) => {
                let _ = handle.close().await;
                return Err(err);
            }
        };
        let created = Arc::new(PubSubBroadcaster {
            name: topic.to_string(),
            topic: handle,
            subscription: async_lock::Mutex::new(Some(subscription)),
            scope: scope.child_token(),
            registry: Arc::downgrade(self),
            max_attempts: self.max_resubscribe_attempts,
            shut_down: AtomicBool::new(false),
        });

        let winner = {
            let mut broadcasters = self.broadcasters.lock();
            let slot = broadcasters
                .entry(topic.to_string())
                .or_insert_with(|| Arc::clone(&created));
            if slot.is_shut_down() {
                *slot = Arc::clone(&created);
            }
            Arc::clone(slot)
        };
        if !Arc::ptr_eq(&winner, &created) {
            // Lost a concurrent join; release our handle
            created.shutdown().await;
        } else {
            debug!(topic = %topic, "Joined broadcast topic");
        }
        Ok(winner)
    }

    /// Broadcaster currently registered for `topic`, unless it is shutting down
    pub fn get(&self, topic: &str) -> Option<Arc<PubSubBroadcaster>> {
        self.broadcasters
            .lock()
            .get(topic)
            .filter(|broadcaster| !broadcaster.is_shut_down())
            .cloned()
    }

    /// Number of registered topics
    pub fn len(&self) -> usize {
        self.broadcasters.lock().len()
    }

    /// Whether no topic is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shut down every registered broadcaster
    pub async fn shutdown(&self) {
        let all: Vec<_> = self.broadcasters.lock().values().cloned().collect();
        for broadcaster in all {
            broadcaster.shutdown().await;
        }
    }

    fn deregister(&self, broadcaster: &PubSubBroadcaster) {
        let mut broadcasters = self.broadcasters.lock();
        if broadcasters
            .get(&broadcaster.name)
            .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), broadcaster))
        {
            broadcasters.remove(&broadcaster.name);
        }
    }
}

/// CRDT broadcaster publishing on a single gossip topic
pub struct PubSubBroadcaster {
    name: String,
    topic: Arc<dyn GossipTopic>,
    // Held across the receive await, hence the async mutex
    subscription: async_lock::Mutex<Option<Box<dyn GossipSubscription>>>,
    scope: CancellationToken,
    registry: Weak<BroadcasterRegistry>,
    max_attempts: u32,
    shut_down: AtomicBool,
}

impl PubSubBroadcaster {
    /// Topic this broadcaster publishes on
    pub fn topic(&self) -> &str {
        &self.name
    }

    /// Whether [`shutdown`](Self::shutdown) has run
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Cancel the subscription, close the topic and deregister. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wakes a pending `next` so the subscription lock is released
        self.scope.cancel();

        if let Some(mut subscription) = self.subscription.lock().await.take() {
            subscription.cancel();
        }
        if let Err(err) = self.topic.close().await {
            if !err.is_graceful_shutdown() {
                warn!(topic = %self.name, error = %err, "Failed to close broadcast topic");
            }
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.deregister(self);
        }
        debug!(topic = %self.name, "Broadcaster shut down");
    }
}

#[async_trait]
impl CrdtBroadcaster for PubSubBroadcaster {
    async fn broadcast(&self, data: Vec<u8>) -> Result<(), BroadcastError> {
        if self.is_shut_down() {
            return Err(BroadcastError::NoMoreBroadcast);
        }
        match self.topic.publish(data).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_graceful_shutdown() => Err(BroadcastError::NoMoreBroadcast),
            Err(err) => Err(BroadcastError::Gossip(err)),
        }
    }

    async fn next(&self) -> Result<Vec<u8>, BroadcastError> {
        let mut guard = self.subscription.lock().await;
        let mut attempts = 0;
        loop {
            let Some(subscription) = guard.as_mut() else {
                return Err(BroadcastError::NoMoreBroadcast);
            };
            let received = tokio::select! {
                biased;
                _ = self.scope.cancelled() => return Err(BroadcastError::NoMoreBroadcast),
                received = subscription.next() => received,
            };

            let err = match received {
                Ok(message) => return Ok(message.data),
                Err(err) if err.is_graceful_shutdown() => {
                    debug!(topic = %self.name, error = %err, "Broadcast subscription ended");
                    return Err(BroadcastError::NoMoreBroadcast);
                }
                Err(GossipError::Lagged { skipped }) => {
                    warn!(topic = %self.name, skipped, "Broadcast subscriber lagged");
                    continue;
                }
                Err(err) => err,
            };

            attempts += 1;
            if attempts > self.max_attempts {
                warn!(
                    topic = %self.name,
                    attempts = self.max_attempts,
                    error = %err,
                    "Giving up on broadcast subscription"
                );
                return Err(BroadcastError::NoMoreBroadcast);
            }
            warn!(topic = %self.name, attempt = attempts, error = %err, "Receive failed, resubscribing");

            match self.topic.subscribe().await {
                Ok(fresh) => *guard = Some(fresh),
                Err(err) if err.is_graceful_shutdown() => {
                    return Err(BroadcastError::NoMoreBroadcast)
                }
                Err(err) => return Err(BroadcastError::Gossip(err)),
            }
        }
    }
}
