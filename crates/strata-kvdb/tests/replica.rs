//! Replica engine and factory behavior

use assert_matches::assert_matches;
use std::sync::Arc;
use std::time::Duration;
use strata_core::effects::StoreError;
use strata_core::{KvdbConfig, StrataError};
use strata_kvdb::ReplicaFactory;
use strata_testkit::{MemoryCrdtOpener, MemoryNetwork};
use tokio_util::sync::CancellationToken;

struct Node {
    factory: ReplicaFactory,
    opener: Arc<MemoryCrdtOpener>,
}

fn node(network: &Arc<MemoryNetwork>, name: &str, replica: u64, config: KvdbConfig) -> Node {
    let opener = MemoryCrdtOpener::new(replica);
    let factory = ReplicaFactory::new(network.node(name), opener.clone(), config);
    Node { factory, opener }
}

fn single_node() -> Node {
    node(&MemoryNetwork::new(), "node-a", 1, KvdbConfig::default())
}

async fn drain(mut rx: tokio::sync::mpsc::Receiver<String>) -> Vec<String> {
    let mut keys = Vec::new();
    while let Some(key) = rx.recv().await {
        keys.push(key);
    }
    keys.sort();
    keys
}

#[tokio::test]
async fn put_get_delete() {
    let node = single_node();
    let db = node.factory.get_or_create("testpath", 10).await.unwrap();

    db.put("testkey", b"testvalue".to_vec()).await.unwrap();
    assert_eq!(db.get("testkey").await.unwrap(), b"testvalue");
    assert!(db.has("/testkey").await.unwrap());

    db.delete("testkey").await.unwrap();
    assert!(!db.has("testkey").await.unwrap());
    assert_matches!(db.get("testkey").await, Err(StrataError::NotFound { .. }));

    // Empty values are fine, empty keys are not
    db.put("empty", Vec::new()).await.unwrap();
    assert_matches!(db.put("", b"value".to_vec()).await, Err(StrataError::Invalid { .. }));

    db.sync("/").await.unwrap();
    assert!(!db.stats().heads.is_empty());
    node.factory.close().await;
}

#[tokio::test]
async fn same_path_returns_same_replica() {
    let node = single_node();
    let first = node.factory.get_or_create("tns", 0).await.unwrap();
    let second = node.factory.get_or_create("tns", 0).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(node.opener.open_count("crdt/tns"), 1);
    assert_eq!(node.factory.paths(), vec!["tns".to_string()]);
    assert!(node.factory.registry().get("tns/broadcast").is_some());
    assert!(first.factory().is_some());
    node.factory.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creation_opens_one_store() {
    let node = single_node();
    let calls: Vec<_> = (0..16)
        .map(|_| {
            let factory = node.factory.clone();
            tokio::spawn(async move { factory.get_or_create("shared", 0).await })
        })
        .collect();

    let mut replicas = Vec::new();
    for call in calls {
        replicas.push(call.await.unwrap().unwrap());
    }
    assert!(replicas.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    assert_eq!(node.opener.open_count("crdt/shared"), 1);
    node.factory.close().await;
}

#[tokio::test]
async fn closing_twice_closes_the_store_once() {
    let node = single_node();
    let db = node.factory.get_or_create("testpath", 0).await.unwrap();

    db.close().await;
    db.close().await;

    let store = &node.opener.stores()[0];
    assert_eq!(store.close_calls(), 1);
    assert!(store.is_closed());
    assert!(db.is_closed());
    assert!(db.scope().is_cancelled());
    assert!(node.factory.get("testpath").is_none());
    assert!(node.factory.registry().get("testpath/broadcast").is_none());
    assert_matches!(db.get("k").await, Err(StrataError::Closed { .. }));
}

#[tokio::test]
async fn reopening_a_closed_path_gives_a_new_replica() {
    let node = single_node();
    let db = node.factory.get_or_create("testpath", 0).await.unwrap();
    db.close().await;

    let reopened = node.factory.get_or_create("testpath", 0).await.unwrap();
    assert!(!Arc::ptr_eq(&db, &reopened));
    assert_eq!(node.opener.open_count("crdt/testpath"), 2);

    // The stale handle must not evict its replacement
    db.close().await;
    assert!(node.factory.get("testpath").is_some());
    node.factory.close().await;
}

#[tokio::test]
async fn closing_replicas_are_not_handed_out() {
    let node = single_node();
    let db = node.factory.get_or_create("tns", 0).await.unwrap();

    let closing = tokio::spawn({
        let db = Arc::clone(&db);
        async move { db.close().await }
    });
    let mut last = Arc::clone(&db);
    for _ in 0..50 {
        tokio::task::yield_now().await;
        last = node.factory.get_or_create("tns", 0).await.unwrap();
        assert!(!last.is_closed());
    }
    closing.await.unwrap();

    assert!(db.is_closed());
    assert!(!Arc::ptr_eq(&db, &last));
    assert!(!last.is_closed());
    last.put("k", b"v".to_vec()).await.unwrap();
    assert_eq!(last.get("k").await.unwrap(), b"v");
    node.factory.close().await;
}

#[tokio::test]
async fn batch_applies_in_order() {
    let node = single_node();
    let db = node.factory.get_or_create("testpath", 0).await.unwrap();

    let mut batch = db.batch().unwrap();
    batch.put("batchkey1", b"value1".to_vec()).unwrap();
    batch.delete("batchkey1").unwrap();
    batch.put("batchkey2", b"value2".to_vec()).unwrap();
    assert!(batch.put("", b"x".to_vec()).is_err());
    assert_eq!(batch.len(), 3);
    batch.commit().await.unwrap();

    assert_matches!(db.get("batchkey1").await, Err(StrataError::NotFound { .. }));
    assert_eq!(db.get("batchkey2").await.unwrap(), b"value2");
    node.factory.close().await;
}

#[tokio::test]
async fn list_by_prefix() {
    let node = single_node();
    let db = node.factory.get_or_create("testpath", 0).await.unwrap();
    for key in ["myprefix/key1", "myprefix/key2", "other/key3"] {
        db.put(key, b"value".to_vec()).await.unwrap();
    }

    let mut listed = db.list("myprefix/").await.unwrap();
    listed.sort();
    assert_eq!(listed, vec!["/myprefix/key1", "/myprefix/key2"]);
    assert_eq!(db.list("").await.unwrap().len(), 3);
    node.factory.close().await;
}

#[tokio::test]
async fn regex_listing_is_a_union() {
    let node = single_node();
    let db = node.factory.get_or_create("testpath", 0).await.unwrap();
    for key in ["/a/1", "/a/2", "/b/1", "/c/9"] {
        db.put(key, b"v".to_vec()).await.unwrap();
    }

    let mut union = db.list_regex("/", &["^/a/", "9$"]).await.unwrap();
    union.sort();
    assert_eq!(union, vec!["/a/1", "/a/2", "/c/9"]);

    assert!(db.list_regex("/", &["^/zzz"]).await.unwrap().is_empty());
    assert!(db.list_regex::<&str>("/", &[]).await.unwrap().is_empty());
    assert_matches!(db.list_regex("/", &["("]).await, Err(StrataError::Invalid { .. }));

    let streamed = db
        .list_regex_async("/", &["^/b/", "^/c/"], CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(drain(streamed).await, vec!["/b/1", "/c/9"]);
    node.factory.close().await;
}

#[tokio::test]
async fn list_async_streams_every_key() {
    let node = single_node();
    let db = node.factory.get_or_create("testpath", 0).await.unwrap();
    for key in ["async1", "async2", "async3"] {
        db.put(key, b"value".to_vec()).await.unwrap();
    }

    let rx = db.list_async("", CancellationToken::new()).await.unwrap();
    assert_eq!(drain(rx).await, vec!["/async1", "/async2", "/async3"]);
    node.factory.close().await;
}

#[tokio::test(start_paused = true)]
async fn idle_streaming_queries_are_closed() {
    let config = KvdbConfig {
        read_query_timeout_ms: 100,
        ..KvdbConfig::default()
    };
    let node = node(&MemoryNetwork::new(), "node-a", 1, config);
    node.opener.stall_queries();
    let db = node.factory.get_or_create("testpath", 0).await.unwrap();
    db.put("k1", b"v".to_vec()).await.unwrap();

    let rx = db.list_async("", CancellationToken::new()).await.unwrap();
    assert_eq!(drain(rx).await, vec!["/k1"]);

    let rx = db
        .list_regex_async("", &["k"], CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(drain(rx).await, vec!["/k1"]);
    node.factory.close().await;
}

#[tokio::test]
async fn cancelled_listing_stops() {
    let node = single_node();
    node.opener.stall_queries();
    let db = node.factory.get_or_create("testpath", 0).await.unwrap();

    let cancel = CancellationToken::new();
    let mut rx = db.list_async("", cancel.clone()).await.unwrap();
    cancel.cancel();
    assert_eq!(rx.recv().await, None);

    // Closing the replica ends its open listings too
    let mut rx = db.list_async("", CancellationToken::new()).await.unwrap();
    db.close().await;
    assert_eq!(rx.recv().await, None);
    node.factory.close().await;
}

#[tokio::test]
async fn writes_replicate_between_nodes() {
    let network = MemoryNetwork::new();
    let a = node(&network, "node-a", 1, KvdbConfig::default());
    let b = node(&network, "node-b", 2, KvdbConfig::default());
    let db_a = a.factory.get_or_create("shared", 0).await.unwrap();
    let db_b = b.factory.get_or_create("shared", 0).await.unwrap();

    db_a.put("/greeting", b"hello".to_vec()).await.unwrap();

    let mut replicated = None;
    for _ in 0..200 {
        if let Ok(value) = db_b.get("/greeting").await {
            replicated = Some(value);
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(replicated.as_deref(), Some(&b"hello"[..]));

    a.factory.close().await;
    b.factory.close().await;
}

#[tokio::test]
async fn factory_close_closes_everything() {
    let node = single_node();
    let one = node.factory.get_or_create("one", 0).await.unwrap();
    let two = node.factory.get_or_create("two", 0).await.unwrap();

    node.factory.close().await;

    assert!(one.is_closed() && two.is_closed());
    assert!(node.factory.is_empty());
    assert!(node.factory.registry().is_empty());
    assert!(node.opener.stores().iter().all(|s| s.close_calls() == 1));
    assert_matches!(
        node.factory.get_or_create("three", 0).await,
        Err(StrataError::Closed { .. })
    );
}

#[tokio::test]
async fn failed_open_leaves_nothing_behind() {
    let node = single_node();
    node.opener.fail_next_open(StoreError::Backend {
        reason: "disk full".into(),
    });

    assert_matches!(
        node.factory.get_or_create("broken", 0).await,
        Err(StrataError::Storage { .. })
    );
    assert!(node.factory.is_empty());
    assert!(node.factory.registry().is_empty());

    // The next attempt succeeds
    node.factory.get_or_create("broken", 0).await.unwrap();
    node.factory.close().await;
}
