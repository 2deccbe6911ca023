//! Loopback stream transport
//!
//! Routes naming commands straight to in-process [`RequestHandler`]s
//! registered by peer id. Counts calls per command and supports one-shot
//! failure injection so tests can observe caching and retry behavior.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use strata_core::effects::{
    Body, PeerFanOut, PeerId, RequestHandler, StreamClient, StreamConnector, TransportError,
};

#[derive(Default)]
struct Routes {
    servers: RwLock<BTreeMap<PeerId, Arc<dyn RequestHandler>>>,
    calls: Mutex<HashMap<String, usize>>,
    failures: Mutex<VecDeque<TransportError>>,
    connections: Mutex<Vec<(String, PeerFanOut)>>,
}

/// In-process connector shared by the servers and clients of a test
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    routes: Arc<Routes>,
}

impl LoopbackTransport {
    /// Empty transport with no servers
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` as the server behind `peer`
    pub fn serve(&self, peer: impl Into<String>, handler: Arc<dyn RequestHandler>) {
        self.routes
            .servers
            .write()
            .insert(PeerId::new(peer), handler);
    }

    /// Remove a server
    pub fn remove(&self, peer: &str) {
        self.routes.servers.write().remove(&PeerId::new(peer));
    }

    /// Fail the next send with `err`
    pub fn fail_next(&self, err: TransportError) {
        self.routes.failures.lock().push_back(err);
    }

    /// Sends of `command` that reached a server
    pub fn calls(&self, command: &str) -> usize {
        self.routes.calls.lock().get(command).copied().unwrap_or(0)
    }

    /// Protocols connected so far with their fan-out windows
    pub fn connections(&self) -> Vec<(String, PeerFanOut)> {
        self.routes.connections.lock().clone()
    }
}

#[async_trait]
impl StreamConnector for LoopbackTransport {
    async fn connect(
        &self,
        protocol: &str,
        fan_out: PeerFanOut,
    ) -> Result<Arc<dyn StreamClient>, TransportError> {
        if self.routes.servers.read().len() < fan_out.min_peers {
            return Err(TransportError::NoPeers {
                protocol: protocol.to_string(),
            });
        }
        self.routes
            .connections
            .lock()
            .push((protocol.to_string(), fan_out));
        Ok(Arc::new(LoopbackClient {
            protocol: protocol.to_string(),
            routes: Arc::clone(&self.routes),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Client handle returned by [`LoopbackTransport::connect`]
pub struct LoopbackClient {
    protocol: String,
    routes: Arc<Routes>,
    closed: AtomicBool,
}

impl LoopbackClient {
    fn pick(&self, peers: &[PeerId]) -> Result<Arc<dyn RequestHandler>, TransportError> {
        let servers = self.routes.servers.read();
        if peers.is_empty() {
            return servers
                .values()
                .next()
                .cloned()
                .ok_or_else(|| TransportError::NoPeers {
                    protocol: self.protocol.clone(),
                });
        }
        peers
            .iter()
            .find_map(|peer| servers.get(peer).cloned())
            .ok_or_else(|| TransportError::PeerUnreachable {
                peer: peers
                    .iter()
                    .map(PeerId::as_str)
                    .collect::<Vec<_>>()
                    .join(","),
            })
    }
}

#[async_trait]
impl StreamClient for LoopbackClient {
    async fn send(
        &self,
        command: &str,
        body: Body,
        peers: &[PeerId],
    ) -> Result<Body, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if let Some(err) = self.routes.failures.lock().pop_front() {
            return Err(err);
        }
        let handler = self.pick(peers)?;
        *self
            .routes
            .calls
            .lock()
            .entry(command.to_string())
            .or_default() += 1;
        handler
            .handle(command, body)
            .await
            .map_err(|err| TransportError::Remote {
                message: err.to_string(),
            })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::effects::body;
    use strata_core::{Result, StrataError, Value};

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, command: &str, body: Body) -> Result<Body> {
            if command == "boom" {
                return Err(StrataError::internal("boom"));
            }
            Ok(body)
        }
    }

    fn fan_out() -> PeerFanOut {
        PeerFanOut {
            min_peers: 0,
            max_peers: 4,
        }
    }

    #[tokio::test]
    async fn routes_to_registered_servers() {
        let transport = LoopbackTransport::new();
        transport.serve("server-1", Arc::new(Echo));
        let client = transport.connect("/naming/v1", fan_out()).await.unwrap();

        let request = body([("k", Value::from("v"))]);
        let response = client.send("echo", request.clone(), &[]).await.unwrap();
        assert_eq!(response, request);
        assert_eq!(transport.calls("echo"), 1);

        let err = client
            .send("echo", Body::new(), &[PeerId::new("server-9")])
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::PeerUnreachable { .. }));

        let err = client.send("boom", Body::new(), &[]).await.unwrap_err();
        assert!(matches!(err, TransportError::Remote { .. }));
    }

    #[tokio::test]
    async fn injected_failures_and_close() {
        let transport = LoopbackTransport::new();
        transport.serve("server-1", Arc::new(Echo));
        let client = transport.connect("/naming/v1", fan_out()).await.unwrap();

        transport.fail_next(TransportError::Timeout {
            command: "echo".into(),
            timeout_ms: 10,
        });
        assert!(client.send("echo", Body::new(), &[]).await.is_err());
        assert!(client.send("echo", Body::new(), &[]).await.is_ok());

        client.close();
        assert_eq!(
            client.send("echo", Body::new(), &[]).await,
            Err(TransportError::Closed)
        );
    }
}
