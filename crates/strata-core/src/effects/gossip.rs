//! Gossip pub/sub effect traits
//!
//! The gossip layer is an external collaborator. Replica engines use it to
//! replicate CRDT deltas, and the naming client uses it to announce and observe
//! writes. Implementations live outside this crate (a libp2p-style network in
//! production, `strata-testkit`'s in-memory network in tests).

use super::transport::PeerId;
use crate::errors::StrataError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Substrings that mark an error as part of an orderly shutdown
const SHUTDOWN_MARKERS: &[&str] = &["context canceled", "cancelled", "canceled", "shutdown", "closed"];

/// Gossip operation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum GossipError {
    /// The topic handle was closed
    #[error("Topic {topic} closed")]
    TopicClosed {
        /// Topic name
        topic: String,
    },
    /// The subscription was cancelled locally
    #[error("Subscription cancelled")]
    Cancelled,
    /// The node is shutting down
    #[error("Gossip node shutting down")]
    Shutdown,
    /// The subscriber fell behind and messages were dropped
    #[error("Subscriber lagged, {skipped} messages skipped")]
    Lagged {
        /// Number of dropped messages
        skipped: u64,
    },
    /// Joining a topic failed
    #[error("Failed to join {topic}: {reason}")]
    JoinFailed {
        /// Topic name
        topic: String,
        /// Reason for the failure
        reason: String,
    },
    /// Publishing failed
    #[error("Failed to publish on {topic}: {reason}")]
    PublishFailed {
        /// Topic name
        topic: String,
        /// Reason for the failure
        reason: String,
    },
    /// Receiving the next message failed
    #[error("Failed to receive message: {reason}")]
    ReceiveFailed {
        /// Reason for the failure
        reason: String,
    },
}

impl GossipError {
    /// Whether the error is the result of an orderly shutdown rather than a
    /// real fault. Free-form reasons are matched against known markers.
    pub fn is_graceful_shutdown(&self) -> bool {
        match self {
            GossipError::TopicClosed { .. } | GossipError::Cancelled | GossipError::Shutdown => {
                true
            }
            GossipError::Lagged { .. } => false,
            GossipError::JoinFailed { reason, .. }
            | GossipError::PublishFailed { reason, .. }
            | GossipError::ReceiveFailed { reason } => {
                let reason = reason.to_lowercase();
                SHUTDOWN_MARKERS.iter().any(|marker| reason.contains(marker))
            }
        }
    }
}

impl From<GossipError> for StrataError {
    fn from(err: GossipError) -> Self {
        if err.is_graceful_shutdown() {
            StrataError::closed(err.to_string())
        } else {
            StrataError::network(err.to_string())
        }
    }
}

/// A message received from a topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipMessage {
    /// Topic the message was published on
    pub topic: String,
    /// Opaque payload
    pub data: Vec<u8>,
    /// Publishing peer, when known
    pub from: Option<PeerId>,
}

/// Live subscription to one topic
#[async_trait]
pub trait GossipSubscription: Send {
    /// Wait for the next message
    async fn next(&mut self) -> Result<GossipMessage, GossipError>;

    /// Stop receiving. Subsequent `next` calls fail with a shutdown error.
    fn cancel(&mut self);
}

/// Joined topic handle
#[async_trait]
pub trait GossipTopic: Send + Sync {
    /// Topic name
    fn name(&self) -> &str;

    /// Publish a payload to every subscriber of the topic
    async fn publish(&self, data: Vec<u8>) -> Result<(), GossipError>;

    /// Open a new subscription on this topic
    async fn subscribe(&self) -> Result<Box<dyn GossipSubscription>, GossipError>;

    /// Leave the topic. Open subscriptions observe a shutdown error.
    async fn close(&self) -> Result<(), GossipError>;
}

/// Gossip network effects
#[async_trait]
pub trait GossipEffects: Send + Sync {
    /// Join a topic and return a handle for it
    async fn join(&self, topic: &str) -> Result<Arc<dyn GossipTopic>, GossipError>;

    /// Publish without holding a topic handle
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), GossipError>;

    /// Subscribe without holding a topic handle
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn GossipSubscription>, GossipError>;
}

#[async_trait]
impl<T: GossipEffects + ?Sized> GossipEffects for Arc<T> {
    async fn join(&self, topic: &str) -> Result<Arc<dyn GossipTopic>, GossipError> {
        (**self).join(topic).await
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), GossipError> {
        (**self).publish(topic, data).await
    }

    async fn subscribe(&self, topic: &str) -> Result<Box<dyn GossipSubscription>, GossipError> {
        (**self).subscribe(topic).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_variants_are_graceful() {
        assert!(GossipError::Cancelled.is_graceful_shutdown());
        assert!(GossipError::Shutdown.is_graceful_shutdown());
        assert!(GossipError::TopicClosed { topic: "t".into() }.is_graceful_shutdown());
    }

    #[test]
    fn reasons_are_matched_against_markers() {
        let canceled = GossipError::ReceiveFailed {
            reason: "context canceled".into(),
        };
        assert!(canceled.is_graceful_shutdown());

        let reset = GossipError::ReceiveFailed {
            reason: "stream reset by peer".into(),
        };
        assert!(!reset.is_graceful_shutdown());
        assert!(!GossipError::Lagged { skipped: 3 }.is_graceful_shutdown());
    }
}
