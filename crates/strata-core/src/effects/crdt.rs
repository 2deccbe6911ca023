//! CRDT datastore contract
//!
//! The merge algorithm and the block/DAG store underneath it are consumed as a
//! black box. A replica engine hands the store a [`CrdtBroadcaster`] to ship
//! and receive deltas, plus [`CrdtOptions`] carrying observability hooks.

use super::gossip::GossipError;
use crate::errors::StrataError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Rebroadcast interval applied when none is configured
pub const DEFAULT_REBROADCAST_INTERVAL: Duration = Duration::from_secs(5);

/// Errors surfaced by a broadcaster to the CRDT engine
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum BroadcastError {
    /// Terminal signal: the broadcaster will not deliver anything else
    #[error("No more broadcasts")]
    NoMoreBroadcast,
    /// A real gossip failure
    #[error("Broadcast failed: {0}")]
    Gossip(GossipError),
}

impl From<GossipError> for BroadcastError {
    fn from(err: GossipError) -> Self {
        BroadcastError::Gossip(err)
    }
}

/// CRDT store errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum StoreError {
    /// The store was closed
    #[error("Store closed")]
    Closed,
    /// Key does not exist
    #[error("Key not found: {key}")]
    NotFound {
        /// Missing key
        key: String,
    },
    /// Encoding or decoding a delta failed
    #[error("Encoding failed: {reason}")]
    Encoding {
        /// Reason for the failure
        reason: String,
    },
    /// Delta dissemination failed
    #[error(transparent)]
    Broadcast(#[from] BroadcastError),
    /// Backend failure
    #[error("Backend failure: {reason}")]
    Backend {
        /// Reason for the failure
        reason: String,
    },
}

impl From<StoreError> for StrataError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Closed => StrataError::closed("replica store"),
            StoreError::NotFound { key } => StrataError::not_found(key),
            other => StrataError::storage(other.to_string()),
        }
    }
}

/// Delta dissemination contract consumed by the CRDT engine
#[async_trait]
pub trait CrdtBroadcaster: Send + Sync {
    /// Ship an opaque delta to the other replicas
    async fn broadcast(&self, data: Vec<u8>) -> Result<(), BroadcastError>;

    /// Wait for the next delta from another replica. `NoMoreBroadcast` means
    /// the engine should stop its receive loop.
    async fn next(&self) -> Result<Vec<u8>, BroadcastError>;
}

/// Called when a put becomes the prevailing value for a key
pub type PutHook = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Called when a key is removed
pub type DeleteHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Engine options
#[derive(Clone)]
pub struct CrdtOptions {
    /// How often the engine re-announces its heads
    pub rebroadcast_interval: Duration,
    /// Local or remote put observed
    pub put_hook: Option<PutHook>,
    /// Local or remote delete observed
    pub delete_hook: Option<DeleteHook>,
}

impl Default for CrdtOptions {
    fn default() -> Self {
        Self {
            rebroadcast_interval: DEFAULT_REBROADCAST_INTERVAL,
            put_hook: None,
            delete_hook: None,
        }
    }
}

impl fmt::Debug for CrdtOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrdtOptions")
            .field("rebroadcast_interval", &self.rebroadcast_interval)
            .field("put_hook", &self.put_hook.is_some())
            .field("delete_hook", &self.delete_hook.is_some())
            .finish()
    }
}

/// One staged batch operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Write `value` under `key`
    Put {
        /// Target key
        key: String,
        /// Stored bytes
        value: Vec<u8>,
    },
    /// Remove `key`
    Delete {
        /// Target key
        key: String,
    },
}

/// Keys produced by a store query
pub type KeyStream = BoxStream<'static, Result<String, StoreError>>;

/// Snapshot of engine internals
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Current DAG heads
    pub heads: Vec<String>,
    /// Deltas waiting to be processed
    pub queued_jobs: usize,
}

/// Replicated key-value store
#[async_trait]
pub trait CrdtStore: Send + Sync {
    /// Read a key
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Whether a key exists
    async fn has(&self, key: &str) -> Result<bool, StoreError>;

    /// Write a key
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Delete a key
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Flush everything under `prefix` to durable storage
    async fn sync(&self, prefix: &str) -> Result<(), StoreError>;

    /// Apply a set of operations atomically
    async fn apply_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError>;

    /// Stream every key under `prefix`
    async fn query_keys(&self, prefix: &str) -> Result<KeyStream, StoreError>;

    /// Current statistics
    fn stats(&self) -> StoreStats;

    /// Close the store and stop its background work
    async fn close(&self) -> Result<(), StoreError>;
}

/// Opens CRDT stores against the node's block store
#[async_trait]
pub trait CrdtStoreOpener: Send + Sync {
    /// Open the store rooted at `namespace` (e.g. `crdt/<path>`)
    async fn open(
        &self,
        namespace: &str,
        broadcaster: Arc<dyn CrdtBroadcaster>,
        options: CrdtOptions,
    ) -> Result<Arc<dyn CrdtStore>, StoreError>;
}
