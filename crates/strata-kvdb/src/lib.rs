//! # Strata KVDB - replicated key-value engines
//!
//! Eventually consistent key-value stores, one per domain path, replicated
//! through a CRDT engine whose deltas travel over gossip.
//!
//! - [`ReplicaFactory`]: memoized get-or-create of replicas, shared shutdown
//! - [`ReplicaDatabase`]: get/put/delete, batches, prefix and regex listings
//! - [`BroadcasterRegistry`] / [`PubSubBroadcaster`]: the gossip bridge
//!
//! ```rust,ignore
//! let factory = ReplicaFactory::new(gossip, opener, KvdbConfig::default());
//! let db = factory.get_or_create("tns", 0).await?;
//! db.put("/projects/p1/name", b"demo".to_vec()).await?;
//! let keys = db.list_regex("/projects", &["/name$"]).await?;
//! factory.close().await;
//! ```

#![forbid(unsafe_code)]

pub mod batch;
pub mod broadcast;
pub mod database;
pub mod factory;
pub mod query;

pub use batch::Batch;
pub use broadcast::{BroadcasterRegistry, PubSubBroadcaster};
pub use database::ReplicaDatabase;
pub use factory::{ReplicaFactory, BROADCAST_TOPIC_SUFFIX, CRDT_NAMESPACE_PREFIX};
pub use query::KeyFilter;
