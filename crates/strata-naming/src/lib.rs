//! # Strata Naming - cached naming client and typed resource views
//!
//! Client and server halves of the naming protocol:
//!
//! - [`NamingClient`]: push/fetch/lookup/list/stats over the stream transport,
//!   with fetches served from a [`ClientCache`] that drops entries when a
//!   write notice arrives on their topic
//! - [`ResponseObject`]: a fetched value, resolvable against a branch's
//!   current commit
//! - [`structure`]: typed accessors for the resources of a project
//! - [`NamingService`]: request handler answering the protocol from a
//!   [`strata_kvdb::ReplicaDatabase`]
//!
//! ```rust,ignore
//! let client = NamingClient::new(&transport, gossip, &StrataConfig::default()).await?;
//! client.push(&Path::from(["projects", "p1", "name"]), "demo").await?;
//! let functions = client.function().all("p1", "app", "main").list().await?;
//! ```

#![forbid(unsafe_code)]

pub mod cache;
pub mod client;
pub mod keys;
pub mod response;
pub mod service;
pub mod structure;

pub use cache::{ClientCache, Stamp};
pub use client::{NamingClient, Query, Stats, NAMING_PROTOCOL};
pub use response::ResponseObject;
pub use service::NamingService;
pub use structure::{Accessor, Resource, Scope};
