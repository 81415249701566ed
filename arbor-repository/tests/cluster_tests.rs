//! Two wrappers joined by an in-process cluster bus.
//!
//! Each node has its own repository and cache. The tests build the same
//! tree on both, settle the bus, and then check which remote writes flush
//! which local cache entries.

use std::sync::Arc;
use std::time::Duration;

use arbor_cluster::{ClusterRole, InMemoryClusterBus};
use arbor_core::{Acl, CacheConfig, RepositoryConfig};
use arbor_repository::LockingCacheControlRepositoryWrapper;
use arbor_storage::Repository;
use arbor_test_utils::{
    docs_tree, init_tracing, path, token, warm, ContentSource, MockRepository, RecordingCache,
    RepoPath,
};

const SETTLE: Duration = Duration::from_secs(5);

struct Node {
    cache: Arc<RecordingCache>,
    wrapper: Arc<LockingCacheControlRepositoryWrapper>,
}

fn node(bus: &Arc<InMemoryClusterBus>, id: &str) -> Node {
    let cache = Arc::new(RecordingCache::new(CacheConfig::default()));
    let repo = Arc::new(MockRepository::new().with_cache(cache.clone()));
    let config = RepositoryConfig::default()
        .with_lock_timeout(SETTLE)
        .with_cluster(id);
    let transport = bus.join(id).unwrap();
    let wrapper = LockingCacheControlRepositoryWrapper::new(repo, cache.clone(), config)
        .with_cluster(transport)
        .unwrap();
    Node {
        cache,
        wrapper: Arc::new(wrapper),
    }
}

fn attached(bus: &Arc<InMemoryClusterBus>, id: &str) -> Node {
    let n = node(bus, id);
    bus.attach(id, n.wrapper.clone()).unwrap();
    n
}

/// Two attached nodes with `/docs` built and warmed on both.
fn pair() -> (Arc<InMemoryClusterBus>, Node, Node) {
    init_tracing();
    let bus = InMemoryClusterBus::new();
    let a = attached(&bus, "node-a");
    let b = attached(&bus, "node-b");
    for n in [&a, &b] {
        docs_tree(&*n.wrapper, &token("alice")).unwrap();
    }
    assert!(bus.wait_idle(SETTLE));
    for n in [&a, &b] {
        warm(&*n.wrapper, &token("alice"), &watched()).unwrap();
        n.cache.clear_flushes();
    }
    (bus, a, b)
}

fn watched() -> Vec<RepoPath> {
    vec![
        path("/docs"),
        path("/docs/a.txt"),
        path("/docs/sub"),
        path("/docs/sub/b.txt"),
    ]
}

#[test]
fn test_replica_flushes_remote_write_scope() {
    let (bus, a, b) = pair();
    bus.set_role("node-a", ClusterRole::Primary).unwrap();
    bus.set_role("node-b", ClusterRole::Replica).unwrap();
    assert!(bus.wait_idle(SETTLE));

    a.wrapper
        .delete(&token("alice"), &path("/docs/sub"), false)
        .unwrap();
    assert!(bus.wait_idle(SETTLE));

    let expected = vec![(path("/docs"), false), (path("/docs/sub"), true)];
    assert_eq!(b.cache.flushes(), expected);
    assert!(!b.cache.contains(&path("/docs/sub/b.txt")));
    assert!(b.cache.contains(&path("/docs/a.txt")));
    // The replica's own store never saw the delete.
    assert!(b.wrapper.exists(&token("alice"), &path("/docs/sub")).unwrap());
}

#[test]
fn test_primary_ignores_remote_write() {
    let (bus, a, b) = pair();
    bus.set_role("node-a", ClusterRole::Primary).unwrap();
    bus.set_role("node-b", ClusterRole::Replica).unwrap();
    assert!(bus.wait_idle(SETTLE));

    b.wrapper
        .delete(&token("alice"), &path("/docs/sub"), false)
        .unwrap();
    assert!(bus.wait_idle(SETTLE));

    assert!(a.cache.flushes().is_empty());
    for p in watched() {
        assert!(a.cache.contains(&p), "{p} was flushed on the primary");
    }
    assert_eq!(a.wrapper.role(), Some(ClusterRole::Primary));
}

#[test]
fn test_unassigned_role_flushes_like_a_replica() {
    let (bus, a, b) = pair();
    assert_eq!(b.wrapper.role(), None);

    a.wrapper
        .store_acl(&token("alice"), &path("/docs"), Acl::new().grant("bob", "read"))
        .unwrap();
    assert!(bus.wait_idle(SETTLE));

    assert_eq!(b.cache.flushes(), vec![(path("/docs"), true)]);
    for p in watched() {
        assert!(!b.cache.contains(&p));
    }
}

#[test]
fn test_writer_does_not_flush_twice() {
    let (bus, a, _b) = pair();

    a.wrapper
        .create_document(
            &token("alice"),
            &path("/docs/c.txt"),
            ContentSource::bytes("gamma"),
        )
        .unwrap();
    assert!(bus.wait_idle(SETTLE));

    // Only the local flush; the node's own announcement is not looped back.
    assert_eq!(a.cache.flushes(), vec![(path("/docs"), false)]);
}

#[test]
fn test_every_write_is_announced_once_per_scope() {
    let (bus, a, _b) = pair();
    let before = bus.stats();

    a.wrapper
        .move_resource(&token("alice"), &path("/docs/a.txt"), &path("/docs/sub/a.txt"), false)
        .unwrap();
    assert!(bus.wait_idle(SETTLE));

    // Scopes: /docs, /docs/a.txt (subtree), /docs/sub, /docs/sub/a.txt (subtree).
    let after = bus.stats();
    assert_eq!(after.sent - before.sent, 4);
    assert_eq!(after.delivered - before.delivered, 4);
    assert_eq!(after.dropped, before.dropped);
}

#[test]
fn test_role_assigned_before_attach_is_delivered() {
    init_tracing();
    let bus = InMemoryClusterBus::new();
    let n = node(&bus, "node-c");
    bus.set_role("node-c", ClusterRole::Primary).unwrap();
    assert_eq!(n.wrapper.role(), None);

    bus.attach("node-c", n.wrapper.clone()).unwrap();
    assert!(bus.wait_idle(SETTLE));
    assert_eq!(n.wrapper.role(), Some(ClusterRole::Primary));

    bus.set_role("node-c", ClusterRole::Replica).unwrap();
    assert!(bus.wait_idle(SETTLE));
    assert_eq!(n.wrapper.role(), Some(ClusterRole::Replica));
}

#[test]
fn test_detached_node_stops_flushing() {
    let (bus, a, b) = pair();
    bus.detach("node-b").unwrap();

    a.wrapper
        .delete(&token("alice"), &path("/docs/a.txt"), false)
        .unwrap();
    assert!(bus.wait_idle(SETTLE));

    assert!(b.cache.flushes().is_empty());
    assert!(bus.stats().dropped > 0);
}

#[test]
fn test_disabled_clustering_sends_nothing() {
    init_tracing();
    let bus = InMemoryClusterBus::new();
    let cache = Arc::new(RecordingCache::new(CacheConfig::default()));
    let repo = Arc::new(MockRepository::new().with_cache(cache.clone()));
    let wrapper = LockingCacheControlRepositoryWrapper::new(repo, cache, RepositoryConfig::default())
        .with_cluster(bus.join("node-d").unwrap())
        .unwrap();
    let _peer = attached(&bus, "node-e");

    wrapper
        .create_collection(&token("alice"), &path("/quiet"))
        .unwrap();
    assert!(bus.wait_idle(SETTLE));
    assert_eq!(bus.stats().sent, 0);
}
