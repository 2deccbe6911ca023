//! Replica factory
//!
//! Memoizes one [`ReplicaDatabase`] per domain path. Lookups take the map's
//! read lock only; creation is serialized by a separate async mutex so that
//! concurrent callers for a missing path open exactly one store. The map lock
//! is never held across an `.await` or while the creation mutex is acquired.
//!
//! Every background task (heartbeats, streaming queries) is spawned on the
//! factory's [`TaskTracker`], so [`ReplicaFactory::close`] returns only once
//! all of them have drained.

use crate::broadcast::BroadcasterRegistry;
use crate::database::ReplicaDatabase;
use crate::query::StreamSettings;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use strata_core::effects::{
    CrdtBroadcaster, CrdtOptions, CrdtStore, CrdtStoreOpener, DeleteHook, GossipEffects, PutHook,
};
use strata_core::{KvdbConfig, Result, StrataError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// Suffix of the gossip topic carrying a replica's CRDT deltas
pub const BROADCAST_TOPIC_SUFFIX: &str = "/broadcast";

/// Prefix of the datastore namespace holding a replica's CRDT state
pub const CRDT_NAMESPACE_PREFIX: &str = "crdt/";

pub(crate) struct FactoryInner {
    opener: Arc<dyn CrdtStoreOpener>,
    registry: Arc<BroadcasterRegistry>,
    databases: RwLock<HashMap<String, Arc<ReplicaDatabase>>>,
    creation: async_lock::Mutex<()>,
    root: CancellationToken,
    tasks: TaskTracker,
    config: KvdbConfig,
}

impl FactoryInner {
    /// Drop `database` from the map unless a newer replica replaced it
    pub(crate) fn remove(&self, database: &ReplicaDatabase) {
        let mut databases = self.databases.write();
        if databases
            .get(database.path())
            .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), database))
        {
            databases.remove(database.path());
        }
    }
}

/// Registry of replica engines keyed by domain path
#[derive(Clone)]
pub struct ReplicaFactory {
    inner: Arc<FactoryInner>,
}

impl ReplicaFactory {
    /// Factory opening stores through `opener` and replicating over `gossip`
    pub fn new(
        gossip: Arc<dyn GossipEffects>,
        opener: Arc<dyn CrdtStoreOpener>,
        config: KvdbConfig,
    ) -> Self {
        Self {
            inner: Arc::new(FactoryInner {
                opener,
                registry: BroadcasterRegistry::new(gossip, &config),
                databases: RwLock::new(HashMap::new()),
                creation: async_lock::Mutex::new(()),
                root: CancellationToken::new(),
                tasks: TaskTracker::new(),
                config,
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<FactoryInner>) -> Self {
        Self { inner }
    }

    /// Replica for `path`, opening it on first use.
    ///
    /// `rebroadcast_interval_secs` of 0 selects the configured default. The
    /// interval of an already open replica is left unchanged.
    pub async fn get_or_create(
        &self,
        path: &str,
        rebroadcast_interval_secs: u64,
    ) -> Result<Arc<ReplicaDatabase>> {
        if let Some(existing) = self.get(path) {
            return Ok(existing);
        }

        let _creating = self.inner.creation.lock().await;
        if let Some(existing) = self.get(path) {
            return Ok(existing);
        }
        if self.inner.root.is_cancelled() {
            return Err(StrataError::closed("replica factory"));
        }

        let scope = self.inner.root.child_token();
        let topic = format!("{path}{BROADCAST_TOPIC_SUFFIX}");
        let broadcaster = match self.inner.registry.broadcaster(&topic, scope.clone()).await {
            Ok(broadcaster) => broadcaster,
            Err(err) => {
                scope.cancel();
                return Err(err.into());
            }
        };

        let options = CrdtOptions {
            rebroadcast_interval: self
                .inner
                .config
                .rebroadcast_interval(rebroadcast_interval_secs),
            put_hook: Some(put_hook(path)),
            delete_hook: Some(delete_hook(path)),
        };
        let namespace = format!("{CRDT_NAMESPACE_PREFIX}{path}");
        let store = match self
            .inner
            .opener
            .open(
                &namespace,
                Arc::clone(&broadcaster) as Arc<dyn CrdtBroadcaster>,
                options,
            )
            .await
        {
            Ok(store) => store,
            Err(err) => {
                tracing::error!(path = %path, error = %err, "Failed to open replica store");
                scope.cancel();
                broadcaster.shutdown().await;
                return Err(err.into());
            }
        };

        let database = Arc::new(ReplicaDatabase::new(
            path.to_string(),
            Arc::clone(&store),
            broadcaster,
            scope.clone(),
            self.inner.tasks.clone(),
            StreamSettings {
                buffer: self.inner.config.query_buffer_size,
                inactivity_timeout: self.inner.config.read_query_timeout(),
            },
            Arc::downgrade(&self.inner),
        ));
        self.spawn_heartbeat(path.to_string(), store, scope);

        self.inner
            .databases
            .write()
            .insert(path.to_string(), Arc::clone(&database));
        info!(path = %path, namespace = %namespace, "Replica opened");
        Ok(database)
    }

    fn spawn_heartbeat(&self, path: String, store: Arc<dyn CrdtStore>, scope: CancellationToken) {
        let interval = self.inner.config.heartbeat_interval();
        self.inner.tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = scope.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {
                        debug!(path = %path, heads = store.stats().heads.len(), "Replica heads");
                    }
                }
            }
        });
    }

    /// Open replica for `path`, if any. Replicas being closed are skipped.
    pub fn get(&self, path: &str) -> Option<Arc<ReplicaDatabase>> {
        self.inner
            .databases
            .read()
            .get(path)
            .filter(|database| !database.is_closed())
            .cloned()
    }

    /// Domain paths with an open replica
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<_> = self.inner.databases.read().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Number of open replicas
    pub fn len(&self) -> usize {
        self.inner.databases.read().len()
    }

    /// Whether no replica is open
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Broadcaster registry shared by this factory's replicas
    pub fn registry(&self) -> &Arc<BroadcasterRegistry> {
        &self.inner.registry
    }

    /// Close every replica, then wait for all background tasks to finish
    pub async fn close(&self) {
        let open: Vec<_> = self.inner.databases.read().values().cloned().collect();
        for database in open {
            database.close().await;
        }
        self.inner.root.cancel();
        self.inner.registry.shutdown().await;
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        debug!("Replica factory closed");
    }
}

fn put_hook(path: &str) -> PutHook {
    let path = path.to_string();
    Arc::new(move |key: &str, value: &[u8]| {
        debug!(path = %path, key = %key, bytes = value.len(), "Added");
    })
}

fn delete_hook(path: &str) -> DeleteHook {
    let path = path.to_string();
    Arc::new(move |key: &str| {
        debug!(path = %path, key = %key, "Removed");
    })
}
