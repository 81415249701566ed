//! Concurrency tests for the locking wrapper.
//!
//! Delays injected into the recording delegate widen the race windows so
//! that overlapping calls would be visible in the call records.

use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use arbor_core::{ArborError, LockError, LockMode, RepositoryError};
use arbor_repository::LockingCacheControlRepositoryWrapper;
use arbor_storage::Repository;
use arbor_test_utils::{docs_tree, path, token, warm, ContentSource, RepoPath};

#[path = "support/harness.rs"]
mod test_harness;
use test_harness::{harness, harness_with, test_config};

fn wait_until_locked(wrapper: &LockingCacheControlRepositoryWrapper, p: &RepoPath) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !wrapper.lock_manager().is_locked(p) {
        assert!(Instant::now() < deadline, "{p} was never locked");
        thread::sleep(Duration::from_millis(1));
    }
}

fn is_not_found(err: &ArborError) -> bool {
    matches!(err.as_repository(), Some(RepositoryError::NotFound { .. }))
}

#[test]
fn test_writes_sharing_a_path_never_overlap() {
    let h = harness();
    docs_tree(&*h.wrapper, &token("alice")).unwrap();
    h.delegate.set_delay("create_document", Duration::from_millis(20));
    h.reset_recordings();

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let wrapper = h.wrapper.clone();
            thread::spawn(move || {
                let uri = path(&format!("/docs/new-{i}.txt"));
                wrapper
                    .create_document(&token("alice"), &uri, ContentSource::bytes("x"))
                    .unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // Every create locks the shared parent /docs exclusively.
    let calls = h.delegate.calls_for("create_document");
    assert_eq!(calls.len(), 4);
    for (i, a) in calls.iter().enumerate() {
        for b in &calls[i + 1..] {
            assert!(!a.overlaps(b), "{} overlapped {}", a.path, b.path);
        }
    }
    assert_eq!(h.delegate.peak_concurrency(), 1);
    assert!(h.wrapper.lock_manager().held_paths().is_empty());
}

#[test]
fn test_writes_on_disjoint_paths_run_in_parallel() {
    let h = harness();
    let t = token("alice");
    h.wrapper.create_collection(&t, &path("/left")).unwrap();
    h.wrapper.create_collection(&t, &path("/right")).unwrap();
    h.delegate.set_delay("create_collection", Duration::from_millis(100));
    h.reset_recordings();

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = ["/left/x", "/right/x"]
        .into_iter()
        .map(|uri| {
            let wrapper = h.wrapper.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                wrapper.create_collection(&token("alice"), &path(uri)).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let calls = h.delegate.calls_for("create_collection");
    assert_eq!(calls.len(), 2);
    assert!(calls[0].overlaps(&calls[1]));
}

#[test]
fn test_shared_reads_run_concurrently() {
    let h = harness();
    docs_tree(&*h.wrapper, &token("alice")).unwrap();
    h.delegate.set_delay("retrieve", Duration::from_millis(50));
    h.reset_recordings();
    let before = h.wrapper.lock_manager().stats();

    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let wrapper = h.wrapper.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                wrapper
                    .retrieve(&token("alice"), &path("/docs/a.txt"), false)
                    .unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(h.delegate.peak_concurrency() > 1);
    let after = h.wrapper.lock_manager().stats();
    assert_eq!(after.contended, before.contended);
    assert_eq!(after.acquisitions - before.acquisitions, 4);
}

#[test]
fn test_writer_blocks_readers_until_flushed() {
    let h = harness();
    let t = token("alice");
    docs_tree(&*h.wrapper, &t).unwrap();
    warm(&*h.wrapper, &t, &[path("/docs/sub"), path("/docs/sub/b.txt")]).unwrap();
    h.delegate.set_delay("delete", Duration::from_millis(150));
    h.reset_recordings();

    let writer = {
        let wrapper = h.wrapper.clone();
        thread::spawn(move || wrapper.delete(&token("alice"), &path("/docs/sub"), false))
    };
    wait_until_locked(&h.wrapper, &path("/docs/sub/b.txt"));

    let err = h
        .wrapper
        .retrieve(&t, &path("/docs/sub/b.txt"), false)
        .unwrap_err();
    assert!(is_not_found(&err));
    writer.join().unwrap().unwrap();

    let delete = &h.delegate.calls_for("delete")[0];
    let read = &h.delegate.calls_for("retrieve")[0];
    assert!(read.entered >= delete.exited);
}

#[test]
fn test_move_never_leaves_stale_source_in_cache() {
    let h = harness();
    let t = token("alice");
    docs_tree(&*h.wrapper, &t).unwrap();
    warm(&*h.wrapper, &t, &[path("/docs/a.txt")]).unwrap();
    h.delegate.set_delay("move", Duration::from_millis(100));

    let mover = {
        let wrapper = h.wrapper.clone();
        thread::spawn(move || {
            wrapper.move_resource(
                &token("alice"),
                &path("/docs/a.txt"),
                &path("/docs/b.txt"),
                false,
            )
        })
    };
    wait_until_locked(&h.wrapper, &path("/docs/a.txt"));

    // Blocks behind the move, then misses the flushed cache entry.
    let err = h.wrapper.retrieve(&t, &path("/docs/a.txt"), false).unwrap_err();
    assert!(is_not_found(&err));
    mover.join().unwrap().unwrap();

    assert!(is_not_found(
        &h.wrapper.retrieve(&t, &path("/docs/a.txt"), false).unwrap_err()
    ));
    let moved = h.wrapper.retrieve(&t, &path("/docs/b.txt"), false).unwrap();
    assert_eq!(moved.uri, path("/docs/b.txt"));
}

#[test]
fn test_racing_reads_see_before_or_after_move() {
    let h = harness();
    let t = token("alice");
    h.wrapper.create_collection(&t, &path("/docs")).unwrap();

    for i in 0..20 {
        let src = path(&format!("/docs/src-{i}"));
        let dest = path(&format!("/docs/dest-{i}"));
        h.wrapper
            .create_document(&t, &src, ContentSource::bytes("body"))
            .unwrap();
        warm(&*h.wrapper, &t, &[src.clone()]).unwrap();

        let reader = {
            let wrapper = h.wrapper.clone();
            let src = src.clone();
            thread::spawn(move || wrapper.retrieve(&token("alice"), &src, false))
        };
        h.wrapper.move_resource(&t, &src, &dest, false).unwrap();

        match reader.join().unwrap() {
            Ok(resource) => assert_eq!(resource.uri, src),
            Err(e) => assert!(is_not_found(&e), "unexpected error {e}"),
        }
        assert!(is_not_found(
            &h.wrapper.retrieve(&t, &src, false).unwrap_err()
        ));
    }
}

#[test]
fn test_opposite_direction_moves_do_not_deadlock() {
    let h = harness();
    let t = token("alice");
    for uri in ["/a", "/b"] {
        h.wrapper.create_collection(&t, &path(uri)).unwrap();
    }
    h.wrapper
        .create_document(&t, &path("/a/f"), ContentSource::bytes("f"))
        .unwrap();
    h.wrapper
        .create_document(&t, &path("/b/g"), ContentSource::bytes("g"))
        .unwrap();

    let shuttle = |from: &'static str, to: &'static str, name: &'static str| {
        let wrapper = h.wrapper.clone();
        thread::spawn(move || {
            let t = token("alice");
            let there = path(&format!("{to}/{name}"));
            let back = path(&format!("{from}/{name}"));
            for _ in 0..50 {
                wrapper.move_resource(&t, &back, &there, false).unwrap();
                wrapper.move_resource(&t, &there, &back, false).unwrap();
            }
        })
    };
    let left = shuttle("/a", "/b", "f");
    let right = shuttle("/b", "/a", "g");
    left.join().unwrap();
    right.join().unwrap();

    assert!(h.wrapper.exists(&t, &path("/a/f")).unwrap());
    assert!(h.wrapper.exists(&t, &path("/b/g")).unwrap());
    assert_eq!(h.wrapper.lock_manager().table_size(), 0);
}

#[test]
fn test_lock_timeout_skips_delegate() {
    let h = harness_with(test_config().with_lock_timeout(Duration::from_millis(50)));
    let t = token("alice");
    h.wrapper.create_collection(&t, &path("/docs")).unwrap();
    h.reset_recordings();

    let (held_tx, held_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let holder = {
        let wrapper = h.wrapper.clone();
        thread::spawn(move || {
            let guard = wrapper
                .lock_manager()
                .lock([path("/docs")], LockMode::Exclusive)
                .unwrap();
            held_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            drop(guard);
        })
    };
    held_rx.recv().unwrap();

    let err = h
        .wrapper
        .create_collection(&t, &path("/docs/x"))
        .unwrap_err();
    assert!(matches!(
        err,
        ArborError::Lock(LockError::Timeout { ref path, .. }) if path.as_str() == "/docs"
    ));
    assert!(h.delegate.calls_for("create_collection").is_empty());
    assert!(h.cache.flushes().is_empty());
    assert!(h.transport.sent().is_empty());

    release_tx.send(()).unwrap();
    holder.join().unwrap();
    assert!(h.wrapper.lock_manager().held_paths().is_empty());
    h.wrapper.create_collection(&t, &path("/docs/x")).unwrap();
}

#[test]
fn test_panicking_holder_releases_locks() {
    let h = harness();
    let t = token("alice");
    h.wrapper.create_collection(&t, &path("/docs")).unwrap();

    let wrapper = h.wrapper.clone();
    let result = thread::spawn(move || {
        let _held = wrapper
            .lock_manager()
            .lock([path("/docs")], LockMode::Exclusive)
            .unwrap();
        panic!("holder exploded");
    })
    .join();
    assert!(result.is_err());

    assert!(h.wrapper.lock_manager().held_paths().is_empty());
    h.wrapper.create_collection(&t, &path("/docs/after")).unwrap();
}
