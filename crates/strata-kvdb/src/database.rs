//! Replica engine: one CRDT-backed key-value store per domain path
//!
//! A [`ReplicaDatabase`] owns its store handle and broadcaster and lives
//! inside a cancellation scope derived from its factory. Keys are normalized
//! to their canonical `/a/b` form before reaching the store.

use crate::batch::Batch;
use crate::broadcast::PubSubBroadcaster;
use crate::factory::{FactoryInner, ReplicaFactory};
use crate::query::{spawn_key_stream, KeyFilter, StreamSettings};
use futures::TryStreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use strata_core::effects::{CrdtStore, StoreStats};
use strata_core::{Path, Result, StrataError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Canonical store key for `key`. Empty keys are rejected.
pub(crate) fn normalize_key(key: &str) -> Result<String> {
    let path = Path::parse(key);
    if path.is_empty() {
        return Err(StrataError::invalid(format!("invalid key `{key}`")));
    }
    Ok(path.to_key())
}

/// Query prefix in canonical form; the empty prefix selects everything
fn normalize_prefix(prefix: &str) -> String {
    let path = Path::parse(prefix);
    if path.is_empty() {
        return "/".to_string();
    }
    let mut key = path.to_key();
    if prefix.ends_with('/') {
        key.push('/');
    }
    key
}

/// CRDT-backed replicated key-value store for one domain path
pub struct ReplicaDatabase {
    path: String,
    store: Arc<dyn CrdtStore>,
    broadcaster: Arc<PubSubBroadcaster>,
    scope: CancellationToken,
    tasks: TaskTracker,
    stream_settings: StreamSettings,
    closed: AtomicBool,
    factory: Weak<FactoryInner>,
}

impl std::fmt::Debug for ReplicaDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaDatabase")
            .field("path", &self.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ReplicaDatabase {
    pub(crate) fn new(
        path: String,
        store: Arc<dyn CrdtStore>,
        broadcaster: Arc<PubSubBroadcaster>,
        scope: CancellationToken,
        tasks: TaskTracker,
        stream_settings: StreamSettings,
        factory: Weak<FactoryInner>,
    ) -> Self {
        Self {
            path,
            store,
            broadcaster,
            scope,
            tasks,
            stream_settings,
            closed: AtomicBool::new(false),
            factory,
        }
    }

    /// Domain path this replica serves
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Owning factory, while it is alive
    pub fn factory(&self) -> Option<ReplicaFactory> {
        self.factory.upgrade().map(ReplicaFactory::from_inner)
    }

    /// Whether [`close`](Self::close) has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Scope cancelled when the replica closes
    pub fn scope(&self) -> &CancellationToken {
        &self.scope
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(StrataError::closed(format!("database {}", self.path)));
        }
        Ok(())
    }

    /// Read a key
    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.check_open()?;
        let key = normalize_key(key)?;
        self.store
            .get(&key)
            .await?
            .ok_or_else(|| StrataError::not_found(key))
    }

    /// Write a key
    pub async fn put(&self, key: &str, value: impl Into<Vec<u8>>) -> Result<()> {
        self.check_open()?;
        let key = normalize_key(key)?;
        self.store.put(&key, value.into()).await?;
        Ok(())
    }

    /// Remove a key
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.check_open()?;
        let key = normalize_key(key)?;
        self.store.delete(&key).await?;
        Ok(())
    }

    /// Whether a key exists
    pub async fn has(&self, key: &str) -> Result<bool> {
        self.check_open()?;
        let key = normalize_key(key)?;
        Ok(self.store.has(&key).await?)
    }

    /// Flush everything under `prefix`
    pub async fn sync(&self, prefix: &str) -> Result<()> {
        self.check_open()?;
        self.store.sync(&normalize_prefix(prefix)).await?;
        Ok(())
    }

    /// Start a batch of writes
    pub fn batch(&self) -> Result<Batch> {
        self.check_open()?;
        Ok(Batch::new(Arc::clone(&self.store)))
    }

    /// Every key under `prefix`
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.check_open()?;
        let keys = self.store.query_keys(&normalize_prefix(prefix)).await?;
        Ok(keys.try_collect().await?)
    }

    /// Stream the keys under `prefix`. The stream ends when the query is
    /// exhausted or idle, when `cancel` fires, when the replica closes, or
    /// when the receiver is dropped.
    pub async fn list_async(
        &self,
        prefix: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<String>> {
        self.stream_keys(prefix, None, cancel).await
    }

    /// Keys under `prefix` matching any of `patterns`
    pub async fn list_regex<S: AsRef<str>>(
        &self,
        prefix: &str,
        patterns: &[S],
    ) -> Result<Vec<String>> {
        self.check_open()?;
        let filter = KeyFilter::new(patterns)?;
        let keys = self.store.query_keys(&normalize_prefix(prefix)).await?;
        let keys: Vec<String> = keys.try_collect().await?;
        Ok(keys.into_iter().filter(|k| filter.matches(k)).collect())
    }

    /// Streaming form of [`list_regex`](Self::list_regex)
    pub async fn list_regex_async<S: AsRef<str>>(
        &self,
        prefix: &str,
        patterns: &[S],
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<String>> {
        let filter = KeyFilter::new(patterns)?;
        self.stream_keys(prefix, Some(filter), cancel).await
    }

    async fn stream_keys(
        &self,
        prefix: &str,
        filter: Option<KeyFilter>,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<String>> {
        self.check_open()?;
        let keys = self.store.query_keys(&normalize_prefix(prefix)).await?;
        Ok(spawn_key_stream(
            &self.tasks,
            keys,
            filter,
            self.stream_settings.clone(),
            cancel,
            self.scope.clone(),
        ))
    }

    /// Current store statistics
    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }

    /// Close the replica: leave the factory, cancel its scope, shut the
    /// broadcaster down and close the store. Later calls are no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Before the first await, so the factory never hands out a closing replica
        if let Some(factory) = self.factory.upgrade() {
            factory.remove(self);
        }
        self.scope.cancel();
        self.broadcaster.shutdown().await;
        if let Err(err) = self.store.close().await {
            warn!(path = %self.path, error = %err, "Failed to close replica store");
        }
        debug!(path = %self.path, "Replica closed");
    }
}
