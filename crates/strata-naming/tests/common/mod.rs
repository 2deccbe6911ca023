//! Shared fixture: naming servers on a loopback transport plus clients on
//! one in-memory gossip network.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use strata_core::StrataConfig;
use strata_kvdb::{ReplicaDatabase, ReplicaFactory};
use strata_naming::{NamingClient, NamingService};
use strata_testkit::{MemoryCrdtOpener, MemoryNetwork, LoopbackTransport};

pub const SERVER: &str = "naming-1";

pub struct Universe {
    pub network: Arc<MemoryNetwork>,
    pub transport: LoopbackTransport,
    pub factory: ReplicaFactory,
    pub database: Arc<ReplicaDatabase>,
}

impl Universe {
    /// One naming server backed by the `naming` replica
    pub async fn new() -> Self {
        strata_testkit::init_tracing();
        let network = MemoryNetwork::new();
        let transport = LoopbackTransport::new();
        let factory = ReplicaFactory::new(
            network.node(SERVER),
            MemoryCrdtOpener::new(1),
            StrataConfig::default().kvdb,
        );
        let database = factory.get_or_create("naming", 0).await.unwrap();
        transport.serve(SERVER, Arc::new(NamingService::new(Arc::clone(&database))));
        Self {
            network,
            transport,
            factory,
            database,
        }
    }

    /// Serve another, independent replica as `peer`
    pub async fn add_server(&self, peer: &str, path: &str) -> Arc<ReplicaDatabase> {
        let database = self.factory.get_or_create(path, 0).await.unwrap();
        self.transport
            .serve(peer, Arc::new(NamingService::new(Arc::clone(&database))));
        database
    }

    pub async fn client(&self, name: &str) -> NamingClient {
        self.client_with(name, &StrataConfig::default()).await
    }

    pub async fn client_with(&self, name: &str, config: &StrataConfig) -> NamingClient {
        NamingClient::new(&self.transport, self.network.node(name), config)
            .await
            .unwrap()
    }

    pub async fn close(&self) {
        self.factory.close().await;
    }
}

/// Poll `check` until it holds, failing after about two seconds
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
