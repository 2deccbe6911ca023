//! # Strata Testkit
//!
//! In-memory stand-ins for the external collaborators of the naming substrate:
//!
//! - [`MemoryNetwork`] / [`MemoryGossip`]: pub/sub gossip with fault injection
//! - [`MemoryCrdtOpener`] / [`MemoryCrdtStore`]: a last-writer-wins CRDT store
//! - [`LoopbackTransport`]: request/response routing to in-process handlers
//! - [`strategies`]: proptest strategies for paths and values
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! strata-testkit = { path = "../strata-testkit" }
//! ```

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

pub mod crdt;
pub mod gossip;
pub mod strategies;
pub mod transport;

pub use crdt::{MemoryCrdtOpener, MemoryCrdtStore};
pub use gossip::{MemoryGossip, MemoryNetwork, MemoryTopic};
pub use transport::{LoopbackClient, LoopbackTransport};

/// Install a test subscriber honoring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
