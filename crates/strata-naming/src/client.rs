//! Naming client
//!
//! Public push/fetch/lookup/list/stats API over the naming protocol. Fetches
//! go through the [`ClientCache`]; every other call is a plain pass-through.
//! A successful push announces the write on the path's topic so that every
//! cache watching it, this one included, drops what it holds.

use crate::cache::ClientCache;
use crate::response::ResponseObject;
use crate::structure::{
    Accessor, Database, Domain, Function, Library, Messaging, Service, SmartOp, Storage, Website,
};
use std::sync::Arc;
use strata_core::effects::{body, Body, BodyExt, GossipEffects, PeerId, StreamClient, StreamConnector};
use strata_core::{ClientConfig, DatabaseStats, Path, Result, StrataConfig, StrataError, Value};
use tracing::{debug, error};

/// Protocol identifier of the naming service
pub const NAMING_PROTOCOL: &str = "/naming/v1";

/// RPC command names
pub mod command {
    /// `push{path, data} -> {pushed}`
    pub const PUSH: &str = "push";
    /// `fetch{path} -> {object}`
    pub const FETCH: &str = "fetch";
    /// `lookup{prefix, regex} -> {keys}`
    pub const LOOKUP: &str = "lookup";
    /// `list{depth} -> {keys}`
    pub const LIST: &str = "list";
    /// `stats{action} -> {stats}`
    pub const STATS: &str = "stats";
    /// `stats` action returning database statistics
    pub const STATS_DB: &str = "db";
}

/// Prefix lookup request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    /// Leading path segments, or patterns when `regex` is set
    pub prefix: Vec<String>,
    /// Treat each prefix element as a regular expression
    pub regex: bool,
}

impl Query {
    /// Plain prefix lookup
    pub fn prefix<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefix: segments.into_iter().map(Into::into).collect(),
            regex: false,
        }
    }

    /// Lookup matching any of `patterns`
    pub fn regex<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefix: patterns.into_iter().map(Into::into).collect(),
            regex: true,
        }
    }
}

struct ClientInner {
    stream: Arc<dyn StreamClient>,
    gossip: Arc<dyn GossipEffects>,
    cache: ClientCache,
    config: ClientConfig,
}

/// Client of the naming service
#[derive(Clone)]
pub struct NamingClient {
    inner: Arc<ClientInner>,
    peers: Arc<[PeerId]>,
}

impl std::fmt::Debug for NamingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamingClient")
            .field("peers", &self.peers)
            .finish_non_exhaustive()
    }
}

impl NamingClient {
    /// Connect to naming peers through `connector`
    pub async fn new(
        connector: &dyn StreamConnector,
        gossip: Arc<dyn GossipEffects>,
        config: &StrataConfig,
    ) -> Result<Self> {
        let stream = connector
            .connect(NAMING_PROTOCOL, config.client.fan_out())
            .await
            .map_err(|err| {
                error!(error = %err, "Naming client creation failed");
                StrataError::from(err)
            })?;
        debug!(protocol = NAMING_PROTOCOL, "Naming client created");
        Ok(Self {
            inner: Arc::new(ClientInner {
                stream,
                cache: ClientCache::new(Arc::clone(&gossip), &config.cache),
                gossip,
                config: config.client.clone(),
            }),
            peers: Arc::from(Vec::new()),
        })
    }

    /// View of this client that only talks to `peers`. Cache and transport
    /// are shared with the original.
    pub fn peers<I>(&self, peers: I) -> Self
    where
        I: IntoIterator<Item = PeerId>,
    {
        Self {
            inner: Arc::clone(&self.inner),
            peers: peers.into_iter().collect(),
        }
    }

    /// Peers this view is bound to; empty means any
    pub fn targets(&self) -> &[PeerId] {
        &self.peers
    }

    /// Read cache backing [`fetch`](Self::fetch)
    pub fn cache(&self) -> &ClientCache {
        &self.inner.cache
    }

    async fn send(&self, name: &str, request: Body) -> Result<Body> {
        self.inner
            .stream
            .send(name, request, &self.peers)
            .await
            .map_err(|err| {
                error!(command = name, error = %err, "Naming request failed");
                StrataError::from(err)
            })
    }

    /// Value at `path`, served from the cache while it is current
    pub async fn fetch(&self, path: &Path) -> Result<ResponseObject> {
        if let Some(value) = self.inner.cache.get(path) {
            debug!(path = %path, "Fetch served from cache");
            return Ok(ResponseObject::new(path.clone(), value, self.clone()));
        }

        debug!(path = %path, "Fetching");
        let stamp = self.inner.cache.stamp(path).await;
        let response = self
            .send(command::FETCH, body([("path", segments(path))]))
            .await?;
        let object = response
            .get("object")
            .cloned()
            .ok_or_else(|| StrataError::malformed(format!("no object found for {path}")))?;
        if let Some(stamp) = stamp {
            self.inner.cache.put_at(path, object.clone(), stamp);
        }
        Ok(ResponseObject::new(path.clone(), object, self.clone()))
    }

    /// [`fetch`](Self::fetch), retried up to `attempts` times with the
    /// configured pause in between. Returns the last error.
    pub async fn fetch_with_retry(&self, path: &Path, attempts: usize) -> Result<ResponseObject> {
        let mut last = StrataError::invalid("fetch_with_retry needs at least one attempt");
        for attempt in 1..=attempts {
            match self.fetch(path).await {
                Ok(object) => return Ok(object),
                Err(err) => {
                    debug!(path = %path, attempt, error = %err, "Fetch attempt failed");
                    last = err;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.inner.config.fetch_retry_wait()).await;
            }
        }
        Err(last)
    }

    /// Store `data` at `path` and announce the write
    pub async fn push(&self, path: &Path, data: impl Into<Value>) -> Result<()> {
        debug!(path = %path, "Pushing");
        let response = self
            .send(
                command::PUSH,
                body([("path", segments(path)), ("data", data.into())]),
            )
            .await?;
        if !response.bool_field("pushed")? {
            return Err(StrataError::storage(format!("failed to push {path}")));
        }

        if let Some(topic) = path.topic() {
            self.inner.cache.invalidate(&topic);
            self.inner
                .gossip
                .publish(topic.as_str(), Vec::new())
                .await
                .map_err(|err| StrataError::network(format!("push failed to publish: {err}")))?;
        }
        Ok(())
    }

    /// Every key truncated to `depth` segments
    pub async fn list(&self, depth: usize) -> Result<Vec<String>> {
        let response = self
            .send(command::LIST, body([("depth", Value::from(depth))]))
            .await?;
        response.string_array("keys")
    }

    /// Keys selected by `query`
    pub async fn lookup(&self, query: &Query) -> Result<Vec<String>> {
        let response = self
            .send(
                command::LOOKUP,
                body([
                    ("prefix", Value::from(query.prefix.clone())),
                    ("regex", Value::from(query.regex)),
                ]),
            )
            .await?;
        response.string_array("keys")
    }

    /// Statistics calls
    pub fn stats(&self) -> Stats<'_> {
        Stats { client: self }
    }

    /// Drop cache subscriptions and release the transport
    pub async fn close(&self) {
        self.inner.cache.close().await;
        self.inner.stream.close();
    }

    /// Databases of a project
    pub fn database(&self) -> Accessor<Database> {
        Accessor::new(self.clone())
    }

    /// Domains of a project
    pub fn domain(&self) -> Accessor<Domain> {
        Accessor::new(self.clone())
    }

    /// Functions of a project
    pub fn function(&self) -> Accessor<Function> {
        Accessor::new(self.clone())
    }

    /// Libraries of a project
    pub fn library(&self) -> Accessor<Library> {
        Accessor::new(self.clone())
    }

    /// Messaging channels of a project
    pub fn messaging(&self) -> Accessor<Messaging> {
        Accessor::new(self.clone())
    }

    /// Services of a project
    pub fn service(&self) -> Accessor<Service> {
        Accessor::new(self.clone())
    }

    /// Smart operators of a project
    pub fn smart_op(&self) -> Accessor<SmartOp> {
        Accessor::new(self.clone())
    }

    /// Storages of a project
    pub fn storage(&self) -> Accessor<Storage> {
        Accessor::new(self.clone())
    }

    /// Websites of a project
    pub fn website(&self) -> Accessor<Website> {
        Accessor::new(self.clone())
    }
}

fn segments(path: &Path) -> Value {
    Value::from(path.segments().to_vec())
}

/// Statistics calls of a [`NamingClient`]
pub struct Stats<'a> {
    client: &'a NamingClient,
}

impl Stats<'_> {
    /// Statistics of the server's replicated store
    pub async fn database(&self) -> Result<DatabaseStats> {
        let response = self
            .client
            .send(
                command::STATS,
                body([("action", Value::from(command::STATS_DB))]),
            )
            .await?;
        let bytes = response.field("stats")?.as_bytes().ok_or_else(|| {
            StrataError::malformed("field `stats` is not a byte string")
        })?;
        DatabaseStats::decode(&bytes)
    }
}
