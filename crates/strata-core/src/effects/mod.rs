//! Effect traits for the collaborators this substrate consumes
//!
//! - [`gossip`]: pub/sub topics for CRDT replication and invalidation notices
//! - [`transport`]: request/response streams to naming servers
//! - [`crdt`]: the replicated datastore driven by a broadcaster

pub mod crdt;
pub mod gossip;
pub mod transport;

pub use crdt::{
    BatchOp, BroadcastError, CrdtBroadcaster, CrdtOptions, CrdtStore, CrdtStoreOpener,
    DeleteHook, KeyStream, PutHook, StoreError, StoreStats, DEFAULT_REBROADCAST_INTERVAL,
};
pub use gossip::{GossipEffects, GossipError, GossipMessage, GossipSubscription, GossipTopic};
pub use transport::{
    body, Body, BodyExt, PeerFanOut, PeerId, RequestHandler, StreamClient, StreamConnector,
    TransportError,
};
