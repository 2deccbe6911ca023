//! In-memory CRDT store
//!
//! A last-writer-wins map keyed by Lamport clock, good enough to drive replica
//! engines in tests. Every local write ships a bincode-encoded delta through
//! the broadcaster it was opened with; a background loop merges deltas from
//! other replicas and another re-announces the full state periodically.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use strata_core::effects::{
    BatchOp, BroadcastError, CrdtBroadcaster, CrdtOptions, CrdtStore, CrdtStoreOpener, KeyStream,
    StoreError, StoreStats,
};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Lamport timestamp tie-broken by replica id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
struct Clock {
    counter: u64,
    replica: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Register {
    key: String,
    value: Option<Vec<u8>>,
    clock: Clock,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Delta {
    registers: Vec<Register>,
}

impl Delta {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serialize(self).map_err(|e| StoreError::Encoding {
            reason: e.to_string(),
        })
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        bincode::deserialize(bytes).map_err(|e| StoreError::Encoding {
            reason: e.to_string(),
        })
    }
}

/// Opens [`MemoryCrdtStore`]s for one node and remembers them for inspection
#[derive(Debug)]
pub struct MemoryCrdtOpener {
    replica: u64,
    stalled_queries: AtomicBool,
    stores: Mutex<Vec<(String, Arc<MemoryCrdtStore>)>>,
    open_failures: Mutex<Vec<StoreError>>,
}

impl MemoryCrdtOpener {
    /// Opener for the replica with the given id
    pub fn new(replica: u64) -> Arc<Self> {
        Arc::new(Self {
            replica,
            stalled_queries: AtomicBool::new(false),
            stores: Mutex::new(Vec::new()),
            open_failures: Mutex::new(Vec::new()),
        })
    }

    /// Stores opened afterwards emit their keys and then never finish a query
    pub fn stall_queries(&self) {
        self.stalled_queries.store(true, Ordering::SeqCst);
    }

    /// Make the next open fail with `err`
    pub fn fail_next_open(&self, err: StoreError) {
        self.open_failures.lock().push(err);
    }

    /// How many times `namespace` was opened
    pub fn open_count(&self, namespace: &str) -> usize {
        self.stores
            .lock()
            .iter()
            .filter(|(ns, _)| ns == namespace)
            .count()
    }

    /// Every store opened so far
    pub fn stores(&self) -> Vec<Arc<MemoryCrdtStore>> {
        self.stores.lock().iter().map(|(_, s)| Arc::clone(s)).collect()
    }
}

#[async_trait]
impl CrdtStoreOpener for MemoryCrdtOpener {
    async fn open(
        &self,
        namespace: &str,
        broadcaster: Arc<dyn CrdtBroadcaster>,
        options: CrdtOptions,
    ) -> Result<Arc<dyn CrdtStore>, StoreError> {
        if let Some(err) = self.open_failures.lock().pop() {
            return Err(err);
        }
        let store = MemoryCrdtStore::start(
            namespace,
            self.replica,
            broadcaster,
            options,
            self.stalled_queries.load(Ordering::SeqCst),
        );
        self.stores
            .lock()
            .push((namespace.to_string(), Arc::clone(&store)));
        Ok(store)
    }
}

/// Last-writer-wins replicated map
pub struct MemoryCrdtStore {
    namespace: String,
    replica: u64,
    registers: RwLock<BTreeMap<String, Register>>,
    lamport: AtomicU64,
    heads: RwLock<BTreeMap<u64, Clock>>,
    broadcaster: Arc<dyn CrdtBroadcaster>,
    options: CrdtOptions,
    stalled_queries: bool,
    closed: AtomicBool,
    close_calls: AtomicUsize,
    merged_deltas: AtomicUsize,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl std::fmt::Debug for MemoryCrdtStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCrdtStore")
            .field("namespace", &self.namespace)
            .field("replica", &self.replica)
            .field("keys", &self.registers.read().len())
            .finish()
    }
}

impl MemoryCrdtStore {
    fn start(
        namespace: &str,
        replica: u64,
        broadcaster: Arc<dyn CrdtBroadcaster>,
        options: CrdtOptions,
        stalled_queries: bool,
    ) -> Arc<Self> {
        let store = Arc::new(Self {
            namespace: namespace.to_string(),
            replica,
            registers: RwLock::new(BTreeMap::new()),
            lamport: AtomicU64::new(0),
            heads: RwLock::new(BTreeMap::new()),
            broadcaster,
            options,
            stalled_queries,
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            merged_deltas: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });

        let receiver = Arc::clone(&store);
        store.tasks.spawn(async move { receiver.receive_loop().await });
        let rebroadcaster = Arc::clone(&store);
        store
            .tasks
            .spawn(async move { rebroadcaster.rebroadcast_loop().await });
        store
    }

    /// Namespace the store was opened under
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Number of `close` calls received
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Whether the store has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Remote deltas merged so far
    pub fn merged_deltas(&self) -> usize {
        self.merged_deltas.load(Ordering::SeqCst)
    }

    async fn receive_loop(self: Arc<Self>) {
        loop {
            let received = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                received = self.broadcaster.next() => received,
            };
            match received {
                Ok(bytes) => match Delta::decode(&bytes) {
                    Ok(delta) => {
                        self.merge(delta.registers);
                        self.merged_deltas.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(err) => tracing::warn!(namespace = %self.namespace, error = %err, "Dropping undecodable delta"),
                },
                Err(BroadcastError::NoMoreBroadcast) => {
                    tracing::debug!(namespace = %self.namespace, "Broadcaster finished");
                    return;
                }
                Err(err) => {
                    tracing::warn!(namespace = %self.namespace, error = %err, "Receive loop stopped");
                    return;
                }
            }
        }
    }

    async fn rebroadcast_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.options.rebroadcast_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let registers: Vec<Register> = self.registers.read().values().cloned().collect();
            if registers.is_empty() {
                continue;
            }
            if let Err(err) = self.ship(registers).await {
                tracing::debug!(namespace = %self.namespace, error = %err, "Rebroadcast failed");
            }
        }
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn tick(&self) -> Clock {
        Clock {
            counter: self.lamport.fetch_add(1, Ordering::SeqCst) + 1,
            replica: self.replica,
        }
    }

    /// Merge registers, keeping the greater clock per key
    fn merge(&self, incoming: Vec<Register>) {
        let mut applied = Vec::new();
        {
            let mut registers = self.registers.write();
            let mut heads = self.heads.write();
            for register in incoming {
                self.lamport
                    .fetch_max(register.clock.counter, Ordering::SeqCst);
                let head = heads.entry(register.clock.replica).or_insert(register.clock);
                *head = (*head).max(register.clock);

                let newer = registers
                    .get(&register.key)
                    .map_or(true, |current| register.clock > current.clock);
                if newer {
                    registers.insert(register.key.clone(), register.clone());
                    applied.push(register);
                }
            }
        }

        for register in applied {
            match (&register.value, &self.options.put_hook, &self.options.delete_hook) {
                (Some(value), Some(hook), _) => hook(&register.key, value),
                (None, _, Some(hook)) => hook(&register.key),
                _ => {}
            }
        }
    }

    async fn ship(&self, registers: Vec<Register>) -> Result<(), StoreError> {
        let bytes = Delta { registers }.encode()?;
        self.broadcaster.broadcast(bytes).await?;
        Ok(())
    }

    async fn write(&self, ops: Vec<(String, Option<Vec<u8>>)>) -> Result<(), StoreError> {
        self.check_open()?;
        let registers: Vec<Register> = ops
            .into_iter()
            .map(|(key, value)| Register {
                key,
                value,
                clock: self.tick(),
            })
            .collect();
        self.merge(registers.clone());
        self.ship(registers).await
    }
}

#[async_trait]
impl CrdtStore for MemoryCrdtStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_open()?;
        Ok(self
            .registers
            .read()
            .get(key)
            .and_then(|register| register.value.clone()))
    }

    async fn has(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.write(vec![(key.to_string(), Some(value))]).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.write(vec![(key.to_string(), None)]).await
    }

    async fn sync(&self, _prefix: &str) -> Result<(), StoreError> {
        self.check_open()
    }

    async fn apply_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        let ops = ops
            .into_iter()
            .map(|op| match op {
                BatchOp::Put { key, value } => (key, Some(value)),
                BatchOp::Delete { key } => (key, None),
            })
            .collect();
        self.write(ops).await
    }

    async fn query_keys(&self, prefix: &str) -> Result<KeyStream, StoreError> {
        self.check_open()?;
        let keys: Vec<Result<String, StoreError>> = self
            .registers
            .read()
            .values()
            .filter(|r| r.value.is_some() && r.key.starts_with(prefix))
            .map(|r| Ok(r.key.clone()))
            .collect();
        let keys = stream::iter(keys);
        if self.stalled_queries {
            Ok(keys.chain(stream::pending()).boxed())
        } else {
            Ok(keys.boxed())
        }
    }

    fn stats(&self) -> StoreStats {
        let heads = self
            .heads
            .read()
            .values()
            .map(|clock| format!("{:x}-{}", clock.replica, clock.counter))
            .collect();
        StoreStats {
            heads,
            queued_jobs: 0,
        }
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Broadcaster that records what it ships and never receives
    #[derive(Default)]
    struct RecordingBroadcaster {
        shipped: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl CrdtBroadcaster for RecordingBroadcaster {
        async fn broadcast(&self, data: Vec<u8>) -> Result<(), BroadcastError> {
            self.shipped.lock().push(data);
            Ok(())
        }

        async fn next(&self) -> Result<Vec<u8>, BroadcastError> {
            std::future::pending().await
        }
    }

    fn open(broadcaster: Arc<RecordingBroadcaster>, options: CrdtOptions) -> Arc<MemoryCrdtStore> {
        MemoryCrdtStore::start("crdt/test", 1, broadcaster, options, false)
    }

    #[tokio::test]
    async fn writes_are_visible_and_shipped() {
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let store = open(Arc::clone(&broadcaster), CrdtOptions::default());

        store.put("/a", b"1".to_vec()).await.unwrap();
        store.put("/b", b"2".to_vec()).await.unwrap();
        store.delete("/b").await.unwrap();

        assert_eq!(store.get("/a").await.unwrap(), Some(b"1".to_vec()));
        assert!(!store.has("/b").await.unwrap());
        assert_eq!(broadcaster.shipped.lock().len(), 3);

        let keys: Vec<_> = store.query_keys("/").await.unwrap().collect().await;
        assert_eq!(keys, vec![Ok("/a".to_string())]);
        assert_eq!(store.stats().heads, vec!["1-3".to_string()]);
    }

    #[tokio::test]
    async fn merge_keeps_latest_clock_and_fires_hooks() {
        let puts = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&puts);
        let options = CrdtOptions {
            put_hook: Some(Arc::new(move |key: &str, _: &[u8]| seen.lock().push(key.to_string()))),
            ..CrdtOptions::default()
        };
        let store = open(Arc::new(RecordingBroadcaster::default()), options);

        let stale = Register {
            key: "/k".into(),
            value: Some(b"old".to_vec()),
            clock: Clock { counter: 1, replica: 2 },
        };
        let fresh = Register {
            key: "/k".into(),
            value: Some(b"new".to_vec()),
            clock: Clock { counter: 5, replica: 2 },
        };
        store.merge(vec![fresh, stale]);

        assert_eq!(store.get("/k").await.unwrap(), Some(b"new".to_vec()));
        assert_eq!(*puts.lock(), vec!["/k".to_string()]);

        // Local clock moved past the merged one
        store.put("/k", b"local".to_vec()).await.unwrap();
        assert_eq!(store.get("/k").await.unwrap(), Some(b"local".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn rebroadcasts_state_periodically() {
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let options = CrdtOptions {
            rebroadcast_interval: Duration::from_secs(1),
            ..CrdtOptions::default()
        };
        let store = open(Arc::clone(&broadcaster), options);
        store.put("/a", vec![1]).await.unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(broadcaster.shipped.lock().len() >= 3);
    }

    #[tokio::test]
    async fn close_is_reported_once() {
        let store = open(Arc::new(RecordingBroadcaster::default()), CrdtOptions::default());
        store.close().await.unwrap();
        assert_eq!(store.close().await, Err(StoreError::Closed));
        assert_eq!(store.get("/a").await, Err(StoreError::Closed));
        assert_eq!(store.close_calls(), 2);
    }
}
