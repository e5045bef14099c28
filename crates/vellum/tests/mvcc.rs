//! Concurrency and isolation tests: single writer, many readers, snapshots
//! pinned by the active transaction registry.
//!
//! The engine promises that a read transaction observes exactly the state of
//! its snapshot commit, no matter how many commits, flushes, or syncs happen
//! while it is open. These tests pin snapshots at awkward moments and check
//! the promise holds.

// Test code is allowed to use unwrap for simplicity
#![allow(clippy::unwrap_used, clippy::expect_used)]

use vellum::{Environment, registry::ActiveTransactionRegistry};

/// Helper: commit `value` under `key` in its own write transaction.
fn commit_value(env: &Environment, tree: &str, key: &[u8], value: &[u8]) {
    let mut txn = env.write().unwrap();
    txn.open_tree(tree).unwrap().insert(key, value).unwrap();
    txn.commit().unwrap();
}

// ============================================================================
// Serial writers
// ============================================================================

/// Twenty serial read-modify-write transactions increment a counter. Every
/// increment must build on the previous commit, so none may be lost.
#[test]
fn test_serial_increments_lose_no_updates() {
    let dir = tempfile::tempdir().unwrap();
    let env = Environment::create(dir.path()).unwrap();

    let mut txn = env.write().unwrap();
    txn.create_tree("counters").unwrap().insert(b"hits", &0u64.to_le_bytes()).unwrap();
    txn.commit().unwrap();

    for _ in 0..20 {
        let mut txn = env.write().unwrap();
        let mut tree = txn.open_tree("counters").unwrap();
        let current = tree
            .get(b"hits")
            .unwrap()
            .map_or(0, |v| u64::from_le_bytes(v.try_into().unwrap()));
        tree.insert(b"hits", &(current + 1).to_le_bytes()).unwrap();
        txn.commit().unwrap();
    }

    let txn = env.read().unwrap();
    let hits = txn.tree("counters").unwrap().get(b"hits").unwrap().unwrap();
    assert_eq!(u64::from_le_bytes(hits.try_into().unwrap()), 20);
    assert_eq!(env.stats().committed_transaction, 21);
}

// ============================================================================
// Snapshot pinning
// ============================================================================

/// Three readers opened after three different commits each keep seeing the
/// version that was current at their snapshot, while a fresh reader sees
/// the latest.
#[test]
fn test_readers_pin_distinct_versions() {
    let dir = tempfile::tempdir().unwrap();
    let env = Environment::create(dir.path()).unwrap();

    let mut txn = env.write().unwrap();
    txn.create_tree("doc").unwrap().insert(b"body", b"v1").unwrap();
    txn.commit().unwrap();
    let r1 = env.read().unwrap();

    commit_value(&env, "doc", b"body", b"v2");
    let r2 = env.read().unwrap();

    commit_value(&env, "doc", b"body", b"v3");
    let r3 = env.read().unwrap();

    assert_eq!(r1.tree("doc").unwrap().get(b"body").unwrap().as_deref(), Some(b"v1".as_slice()));
    assert_eq!(r2.tree("doc").unwrap().get(b"body").unwrap().as_deref(), Some(b"v2".as_slice()));
    assert_eq!(r3.tree("doc").unwrap().get(b"body").unwrap().as_deref(), Some(b"v3".as_slice()));

    let fresh = env.read().unwrap();
    assert_eq!(fresh.tree("doc").unwrap().get(b"body").unwrap().as_deref(), Some(b"v3".as_slice()));
    assert!(r1.snapshot() < r2.snapshot() && r2.snapshot() < r3.snapshot());
}

/// A reader pinned at an old snapshot limits how far a flush may advance,
/// and keeps reading its version even after the data file has been synced
/// past everything the flush was allowed to take.
#[test]
fn test_pinned_reader_survives_flush_and_sync() {
    let dir = tempfile::tempdir().unwrap();
    let env = Environment::create(dir.path()).unwrap();

    let mut txn = env.write().unwrap();
    txn.create_tree("doc").unwrap().insert(b"body", b"v1").unwrap();
    txn.commit().unwrap();
    commit_value(&env, "doc", b"body", b"v2");
    commit_value(&env, "doc", b"body", b"v3");

    // Pinned at commit 3; its registration caps the flush boundary at 2.
    let pinned = env.read().unwrap();
    assert_eq!(pinned.snapshot(), 3);

    commit_value(&env, "doc", b"body", b"v4");
    commit_value(&env, "doc", b"body", b"v5");

    env.sync().unwrap();
    let stats = env.stats();
    assert_eq!(stats.committed_transaction, 5);
    assert_eq!(
        stats.synced_transaction, 2,
        "flush must stop below the oldest active transaction"
    );

    assert_eq!(
        pinned.tree("doc").unwrap().get(b"body").unwrap().as_deref(),
        Some(b"v3".as_slice()),
        "pinned reader must still see its snapshot after the sync"
    );
    let fresh = env.read().unwrap();
    assert_eq!(fresh.tree("doc").unwrap().get(b"body").unwrap().as_deref(), Some(b"v5".as_slice()));
    drop(fresh);

    drop(pinned);
    env.sync().unwrap();
    assert_eq!(env.stats().synced_transaction, 5, "boundary lifts once the reader is gone");
}

/// Registered transactions show up in the environment stats and disappear
/// when their transactions end.
#[test]
fn test_active_transactions_tracked_in_stats() {
    let dir = tempfile::tempdir().unwrap();
    let env = Environment::create(dir.path()).unwrap();
    assert_eq!(env.stats().active_transactions, 0);

    let r1 = env.read().unwrap();
    let r2 = env.read().unwrap();
    assert_eq!(env.stats().active_transactions, 2);

    let w = env.write().unwrap();
    assert_eq!(env.stats().active_transactions, 3, "the writer registers its own id too");

    drop(w);
    drop(r1);
    assert_eq!(env.stats().active_transactions, 1);
    drop(r2);
    assert_eq!(env.stats().active_transactions, 0);
}

// ============================================================================
// Registry contract
// ============================================================================

/// The registry reports the minimum of all registered ids, independent of
/// registration order, and handles removal in any order.
#[test]
fn test_registry_oldest_is_minimum_of_active_ids() {
    let registry = ActiveTransactionRegistry::new();
    assert_eq!(registry.oldest(), None);
    assert_eq!(registry.oldest_transaction(), 0);

    let h5 = registry.add(5);
    let h3 = registry.add(3);
    let h9 = registry.add(9);
    assert_eq!(registry.oldest(), Some(3));
    assert_eq!(registry.active_count(), 3);
    assert!(registry.contains(3));

    assert!(registry.try_remove(3, h3));
    assert_eq!(registry.oldest(), Some(5));

    assert!(registry.try_remove(9, h9));
    assert_eq!(registry.oldest(), Some(5));

    assert!(registry.try_remove(5, h5));
    assert_eq!(registry.oldest(), None);
    assert_eq!(registry.active_count(), 0);
}

// ============================================================================
// Cross-thread visibility
// ============================================================================

/// A writer thread commits paired keys that must always carry equal values.
/// Reader threads open snapshots concurrently and must never observe a
/// half-applied commit, no matter where the writer is.
#[test]
fn test_readers_never_observe_torn_commits() {
    let dir = tempfile::tempdir().unwrap();
    let env = Environment::create(dir.path()).unwrap();

    let mut txn = env.write().unwrap();
    let mut tree = txn.create_tree("pairs").unwrap();
    tree.insert(b"left", &0u32.to_le_bytes()).unwrap();
    tree.insert(b"right", &0u32.to_le_bytes()).unwrap();
    txn.commit().unwrap();

    std::thread::scope(|s| {
        s.spawn(|| {
            for i in 1..=50u32 {
                let mut txn = env.write().unwrap();
                let mut tree = txn.open_tree("pairs").unwrap();
                tree.insert(b"left", &i.to_le_bytes()).unwrap();
                tree.insert(b"right", &i.to_le_bytes()).unwrap();
                txn.commit().unwrap();
            }
        });

        for _ in 0..3 {
            s.spawn(|| {
                for _ in 0..200 {
                    let txn = env.read().unwrap();
                    let tree = txn.tree("pairs").unwrap();
                    let left = tree.get(b"left").unwrap();
                    let right = tree.get(b"right").unwrap();
                    assert_eq!(left, right, "snapshot observed a half-applied commit");
                }
            });
        }
    });

    let txn = env.read().unwrap();
    let tree = txn.tree("pairs").unwrap();
    assert_eq!(tree.get(b"left").unwrap().as_deref(), Some(50u32.to_le_bytes().as_slice()));
    assert_eq!(tree.get(b"right").unwrap().as_deref(), Some(50u32.to_le_bytes().as_slice()));
}
