//! Client read cache with invalidate-on-write semantics
//!
//! Every cached path is bound to the gossip subscription of its coarsened
//! [`Topic`]. A subscription carries a generation counter; any message on
//! the topic bumps it and thereby supersedes every entry stored under the old
//! generation. Entries also carry a deadline, so a value is served for at most
//! the configured lifetime and at most until the next write notice on its
//! topic, whichever comes first.
//!
//! A value read from the server is stored against the [`Stamp`] taken before
//! the read, so a notice that arrives while the read is in flight keeps it
//! out of the cache.
//!
//! The entry table and the subscription table share one reader/writer lock,
//! which is never held across an `.await`.
//!
//! # Background tasks
//!
//! - one listener per subscription, bumping the generation on each message
//!   and dropping the subscription with all its entries on a receive error
//! - one watcher per entry, deleting it once its deadline passes, its
//!   generation is superseded or its subscription ends

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strata_core::effects::{GossipEffects, GossipError, GossipSubscription};
use strata_core::{CacheConfig, Path, Topic, Value};
use tokio::sync::watch;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

struct Entry {
    value: Value,
    topic: Topic,
    generation: u64,
    expires_at: Instant,
    id: u64,
}

struct Subscription {
    id: u64,
    generation: watch::Sender<u64>,
    scope: CancellationToken,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, Entry>,
    subscriptions: HashMap<Topic, Subscription>,
}

struct CacheInner {
    gossip: Arc<dyn GossipEffects>,
    lifetime: Duration,
    state: RwLock<CacheState>,
    root: CancellationToken,
    tasks: TaskTracker,
    next_id: AtomicU64,
}

/// Subscription and generation a value was read under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp {
    subscription: u64,
    generation: u64,
}

/// Path-keyed read cache shared by a naming client and its peer views
#[derive(Clone)]
pub struct ClientCache {
    inner: Arc<CacheInner>,
}

impl ClientCache {
    /// Cache listening for write notices through `gossip`
    pub fn new(gossip: Arc<dyn GossipEffects>, config: &CacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                gossip,
                lifetime: config.lifetime(),
                state: RwLock::new(CacheState::default()),
                root: CancellationToken::new(),
                tasks: TaskTracker::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Cached value for `path`, if still current
    pub fn get(&self, path: &Path) -> Option<Value> {
        let state = self.inner.state.read();
        let entry = state.entries.get(&path.to_key())?;
        let subscription = state.subscriptions.get(&entry.topic)?;
        if *subscription.generation.borrow() != entry.generation
            || Instant::now() >= entry.expires_at
        {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Store `value` for `path` and start watching its topic.
    ///
    /// Paths without a topic are not cached. If the topic cannot be
    /// subscribed the value is dropped and the failure logged; callers keep
    /// working uncached.
    pub async fn put(&self, path: &Path, value: Value) {
        if let Some(stamp) = self.stamp(path).await {
            self.put_at(path, value, stamp);
        }
    }

    /// Subscribe to the topic of `path` and capture its current generation.
    ///
    /// Take the stamp before reading the value to be cached, then hand both
    /// to [`put_at`](Self::put_at): a write notice arriving in between makes
    /// the stamp stale and the value is not stored. `None` when the path is
    /// not cacheable.
    pub async fn stamp(&self, path: &Path) -> Option<Stamp> {
        let topic = path.topic()?;
        if self.inner.root.is_cancelled() {
            return None;
        }
        if let Err(err) = self.ensure_subscription(&topic).await {
            warn!(path = %path, topic = %topic, error = %err, "Cache subscribe failed, not caching");
            return None;
        }
        let state = self.inner.state.read();
        // Absent if a receive error dropped it in the meantime
        let subscription = state.subscriptions.get(&topic)?;
        let stamp = Stamp {
            subscription: subscription.id,
            generation: *subscription.generation.borrow(),
        };
        Some(stamp)
    }

    /// Store `value` for `path` unless its topic moved past `stamp`
    pub fn put_at(&self, path: &Path, value: Value, stamp: Stamp) {
        let Some(topic) = path.topic() else {
            return;
        };
        let key = path.to_key();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let expires_at = Instant::now() + self.inner.lifetime;
        let (updates, scope) = {
            let mut state = self.inner.state.write();
            let Some(subscription) = state.subscriptions.get(&topic) else {
                return;
            };
            if subscription.id != stamp.subscription
                || *subscription.generation.borrow() != stamp.generation
            {
                debug!(path = %path, topic = %topic, "Written while fetching, not caching");
                return;
            }
            let handles = (subscription.generation.subscribe(), subscription.scope.clone());
            state.entries.insert(
                key.clone(),
                Entry {
                    value,
                    topic,
                    generation: stamp.generation,
                    expires_at,
                    id,
                },
            );
            handles
        };

        let inner = Arc::clone(&self.inner);
        self.inner.tasks.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(expires_at) => {}
                _ = superseded(updates, stamp.generation) => {}
                _ = scope.cancelled() => {}
            }
            inner.remove_entry(&key, id);
        });
    }

    /// Supersede every entry under `topic`, as if a write notice arrived
    pub fn invalidate(&self, topic: &Topic) {
        self.inner.bump(topic);
    }

    /// Entries currently held, stale ones included until their watcher runs
    pub fn len(&self) -> usize {
        self.inner.state.read().entries.len()
    }

    /// Whether no entry is held
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live topic subscriptions
    pub fn subscription_count(&self) -> usize {
        self.inner.state.read().subscriptions.len()
    }

    /// Whether `topic` has a live subscription
    pub fn is_subscribed(&self, topic: &Topic) -> bool {
        self.inner.state.read().subscriptions.contains_key(topic)
    }

    /// Cancel every subscription and watcher, then wait for them to finish
    pub async fn close(&self) {
        self.inner.root.cancel();
        {
            let mut state = self.inner.state.write();
            state.entries.clear();
            state.subscriptions.clear();
        }
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }

    async fn ensure_subscription(&self, topic: &Topic) -> Result<(), GossipError> {
        if self.is_subscribed(topic) {
            return Ok(());
        }
        let subscription = self.inner.gossip.subscribe(topic.as_str()).await?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let scope = self.inner.root.child_token();
        let inserted = {
            let mut state = self.inner.state.write();
            if state.subscriptions.contains_key(topic) {
                false
            } else {
                state.subscriptions.insert(
                    topic.clone(),
                    Subscription {
                        id,
                        generation: watch::channel(0).0,
                        scope: scope.clone(),
                    },
                );
                true
            }
        };
        if !inserted {
            // Another put subscribed first
            let mut subscription = subscription;
            subscription.cancel();
            return Ok(());
        }

        debug!(topic = %topic, "Watching topic");
        let inner = Arc::clone(&self.inner);
        let topic = topic.clone();
        self.inner
            .tasks
            .spawn(async move { inner.listen(topic, id, subscription, scope).await });
        Ok(())
    }
}

impl CacheInner {
    fn bump(&self, topic: &Topic) {
        let state = self.state.read();
        if let Some(subscription) = state.subscriptions.get(topic) {
            subscription.generation.send_modify(|generation| *generation += 1);
        }
    }

    fn remove_entry(&self, key: &str, id: u64) {
        let mut state = self.state.write();
        if state.entries.get(key).is_some_and(|entry| entry.id == id) {
            state.entries.remove(key);
        }
    }

    /// Drop the subscription `id` of `topic` and every entry under it
    fn drop_subscription(&self, topic: &Topic, id: u64) {
        let mut state = self.state.write();
        if state
            .subscriptions
            .get(topic)
            .is_some_and(|subscription| subscription.id == id)
        {
            state.subscriptions.remove(topic);
            state.entries.retain(|_, entry| &entry.topic != topic);
        }
    }

    async fn listen(
        self: Arc<Self>,
        topic: Topic,
        id: u64,
        mut subscription: Box<dyn GossipSubscription>,
        scope: CancellationToken,
    ) {
        loop {
            let received = tokio::select! {
                biased;
                _ = scope.cancelled() => break,
                received = subscription.next() => received,
            };
            match received {
                Ok(_) => self.bump(&topic),
                Err(GossipError::Lagged { skipped }) => {
                    // Missed notices may have been writes
                    debug!(topic = %topic, skipped, "Cache listener lagged");
                    self.bump(&topic);
                }
                Err(err) => {
                    if err.is_graceful_shutdown() {
                        debug!(topic = %topic, error = %err, "Cache subscription ended");
                    } else {
                        warn!(topic = %topic, error = %err, "Cache subscription failed");
                    }
                    scope.cancel();
                    self.drop_subscription(&topic, id);
                    break;
                }
            }
        }
        subscription.cancel();
    }
}

/// Resolves once the generation moves past `generation` or its sender is gone
async fn superseded(mut updates: watch::Receiver<u64>, generation: u64) {
    loop {
        if *updates.borrow_and_update() != generation {
            return;
        }
        if updates.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_testkit::MemoryNetwork;

    fn cache(network: &Arc<MemoryNetwork>, lifetime_ms: u64) -> ClientCache {
        ClientCache::new(network.node("client"), &CacheConfig { lifetime_ms })
    }

    #[tokio::test]
    async fn paths_without_topic_are_not_cached() {
        let network = MemoryNetwork::new();
        let cache = cache(&network, 60_000);
        cache.put(&Path::default(), Value::from("x")).await;
        assert!(cache.get(&Path::default()).is_none());
        assert_eq!(cache.subscription_count(), 0);
    }

    #[tokio::test]
    async fn one_subscription_per_topic() {
        let network = MemoryNetwork::new();
        let cache = cache(&network, 60_000);
        let a = Path::from(["projects", "p1", "branches", "main", "a"]);
        let b = Path::from(["projects", "p1", "branches", "main", "b"]);
        cache.put(&a, Value::from(1)).await;
        cache.put(&b, Value::from(2)).await;

        assert_eq!(cache.get(&a), Some(Value::from(1)));
        assert_eq!(cache.get(&b), Some(Value::from(2)));
        assert_eq!(cache.subscription_count(), 1);
        assert_eq!(network.subscriber_count("/updates/projects/p1/branches/main"), 1);
    }

    #[tokio::test]
    async fn local_invalidation_supersedes_the_topic() {
        let network = MemoryNetwork::new();
        let cache = cache(&network, 60_000);
        let path = Path::from(["a", "b"]);
        cache.put(&path, Value::from("v")).await;

        cache.invalidate(&path.topic().unwrap());
        assert!(cache.get(&path).is_none());

        // A fresh put is served again
        cache.put(&path, Value::from("w")).await;
        assert_eq!(cache.get(&path), Some(Value::from("w")));
    }

    #[tokio::test]
    async fn stale_stamps_are_not_stored() {
        let network = MemoryNetwork::new();
        let cache = cache(&network, 60_000);
        let path = Path::from(["a", "b"]);

        // Cold topic: the stamp subscribes before the value is read
        let stamp = cache.stamp(&path).await.unwrap();
        assert_eq!(cache.subscription_count(), 1);
        cache.invalidate(&path.topic().unwrap());
        cache.put_at(&path, Value::from("old"), stamp);
        assert!(cache.get(&path).is_none());
        assert!(cache.is_empty());

        let stamp = cache.stamp(&path).await.unwrap();
        cache.put_at(&path, Value::from("new"), stamp);
        assert_eq!(cache.get(&path), Some(Value::from("new")));
    }

    #[tokio::test]
    async fn notices_during_a_read_reject_the_value() {
        let network = MemoryNetwork::new();
        let cache = cache(&network, 60_000);
        let writer = network.node("writer");
        let path = Path::from(["a", "b"]);
        let sibling = Path::from(["a", "c"]);
        cache.put(&sibling, Value::from(1)).await;

        let stamp = cache.stamp(&path).await.unwrap();
        writer.publish("/updates/a", Vec::new()).await.unwrap();
        for _ in 0..200 {
            if cache.get(&sibling).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(cache.get(&sibling).is_none());

        cache.put_at(&path, Value::from("old"), stamp);
        assert!(cache.get(&path).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_lifetime() {
        let network = MemoryNetwork::new();
        let cache = cache(&network, 1_000);
        let path = Path::from(["a", "b"]);
        cache.put(&path, Value::from("v")).await;

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert!(cache.get(&path).is_some());
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(cache.get(&path).is_none());
    }

    #[tokio::test]
    async fn close_drops_everything() {
        let network = MemoryNetwork::new();
        let cache = cache(&network, 60_000);
        cache.put(&Path::from(["a", "b"]), Value::from(1)).await;
        cache.close().await;

        assert!(cache.is_empty());
        assert_eq!(cache.subscription_count(), 0);
        cache.put(&Path::from(["a", "b"]), Value::from(1)).await;
        assert!(cache.is_empty());
    }
}
