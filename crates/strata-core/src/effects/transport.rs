//! Request/response stream transport effect traits
//!
//! Commands travel as a command name plus a [`Body`] map; responses come back
//! as another body. The transport picks peers for a protocol within a fan-out
//! window unless the caller names explicit targets.

use crate::errors::{Result, StrataError};
use crate::value::Value;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Command/response payload
pub type Body = BTreeMap<String, Value>;

/// Identifier of a remote peer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Wrap a peer identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// How many peers a protocol client keeps connections to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerFanOut {
    /// Minimum number of peers before requests are sent
    pub min_peers: usize,
    /// Maximum number of peers contacted
    pub max_peers: usize,
}

/// Transport errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum TransportError {
    /// No peer serving the protocol could be reached
    #[error("No peers available for {protocol}")]
    NoPeers {
        /// Protocol that had no peers
        protocol: String,
    },
    /// A specific peer was unreachable
    #[error("Peer unreachable: {peer}")]
    PeerUnreachable {
        /// Identifier of the unreachable peer
        peer: String,
    },
    /// The request timed out
    #[error("Command '{command}' timed out after {timeout_ms}ms")]
    Timeout {
        /// Command that timed out
        command: String,
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },
    /// The remote side answered with an error
    #[error("Remote error: {message}")]
    Remote {
        /// Error reported by the remote handler
        message: String,
    },
    /// The client was closed
    #[error("Stream client closed")]
    Closed,
}

impl From<TransportError> for StrataError {
    fn from(err: TransportError) -> Self {
        StrataError::network(err.to_string())
    }
}

/// Client side of a request/response protocol
#[async_trait]
pub trait StreamClient: Send + Sync {
    /// Send `command` with `body`. An empty `peers` slice lets the transport
    /// choose; otherwise only the named peers are contacted.
    async fn send(
        &self,
        command: &str,
        body: Body,
        peers: &[PeerId],
    ) -> std::result::Result<Body, TransportError>;

    /// Release connections
    fn close(&self);
}

/// Opens protocol clients
#[async_trait]
pub trait StreamConnector: Send + Sync {
    /// Connect to peers serving `protocol`
    async fn connect(
        &self,
        protocol: &str,
        fan_out: PeerFanOut,
    ) -> std::result::Result<Arc<dyn StreamClient>, TransportError>;
}

/// Server side of a request/response protocol
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle one command
    async fn handle(&self, command: &str, body: Body) -> Result<Body>;
}

/// Typed field access on a response body
pub trait BodyExt {
    /// Required field, or a malformed-response error naming it
    fn field(&self, name: &str) -> Result<&Value>;

    /// Required boolean field
    fn bool_field(&self, name: &str) -> Result<bool>;

    /// Required integer field
    fn int_field(&self, name: &str) -> Result<i64>;

    /// Required string-array field
    fn string_array(&self, name: &str) -> Result<Vec<String>>;
}

impl BodyExt for Body {
    fn field(&self, name: &str) -> Result<&Value> {
        self.get(name)
            .ok_or_else(|| StrataError::malformed(format!("missing field `{name}`")))
    }

    fn bool_field(&self, name: &str) -> Result<bool> {
        self.field(name)?
            .as_bool()
            .ok_or_else(|| StrataError::malformed(format!("field `{name}` is not a boolean")))
    }

    fn int_field(&self, name: &str) -> Result<i64> {
        self.field(name)?
            .as_i64()
            .ok_or_else(|| StrataError::malformed(format!("field `{name}` is not an integer")))
    }

    fn string_array(&self, name: &str) -> Result<Vec<String>> {
        self.field(name)?.as_string_array().ok_or_else(|| {
            StrataError::malformed(format!("field `{name}` is not an array of strings"))
        })
    }
}

/// Build a body from `(field, value)` pairs
pub fn body<I, K>(fields: I) -> Body
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    fields.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn missing_fields_are_malformed() {
        let response = body([("pushed", Value::from("yes"))]);
        assert_matches!(
            response.field("object"),
            Err(StrataError::MalformedResponse { .. })
        );
        assert_matches!(
            response.bool_field("pushed"),
            Err(StrataError::MalformedResponse { .. })
        );
    }

    #[test]
    fn string_arrays_are_extracted() {
        let response = body([("keys", Value::from(vec!["/a".to_string()]))]);
        assert_eq!(response.string_array("keys").unwrap(), vec!["/a"]);
    }
}
