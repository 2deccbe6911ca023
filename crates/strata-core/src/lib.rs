//! # Strata Core - Foundation types for the naming substrate
//!
//! Shared vocabulary for every crate in the workspace:
//!
//! - **Paths and topics**: [`Path`] addresses a resource; [`Topic`] is the
//!   coarsened gossip destination announcing writes under it
//! - **Values**: the [`Value`] tagged union carried through caches and RPCs
//! - **Errors**: the unified [`StrataError`]
//! - **Configuration**: [`StrataConfig`] and its sections
//! - **Effects**: trait seams for gossip, the stream transport and the CRDT
//!   datastore, which are all external collaborators
//!
//! This crate holds no runtime state and spawns no tasks.

#![forbid(unsafe_code)]

pub mod config;
pub mod effects;
pub mod errors;
pub mod path;
pub mod stats;
pub mod value;

pub use config::{CacheConfig, ClientConfig, KvdbConfig, StrataConfig};
pub use errors::{Result, StrataError};
pub use path::{Path, Topic, MAX_TOPIC_SEGMENTS, UPDATES_TOPIC_PREFIX};
pub use stats::{DatabaseStats, CRDT_STATS_KIND};
pub use value::{Scalar, Value};
