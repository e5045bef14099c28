//! Storage engine benchmarks.
//!
//! These benchmarks measure the hot paths of the engine: single-key lookups
//! as the tree deepens, commit throughput under safe and lazy durability,
//! overflow value handling, and a mixed read/write workload. Results feed
//! into regression detection.

#![allow(clippy::expect_used, missing_docs)]

use std::{hint::black_box, time::Duration};

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use tempfile::TempDir;
use vellum::Environment;

// =============================================================================
// Helpers
// =============================================================================

/// Populate tree "bench" with `count` sequential key-value pairs in batches.
fn populate(env: &Environment, count: usize, batch_size: usize) {
    for batch_start in (0..count).step_by(batch_size) {
        let batch_end = (batch_start + batch_size).min(count);
        let mut txn = env.write().expect("write txn");
        let mut tree = txn.create_tree("bench").expect("open tree");
        for i in batch_start..batch_end {
            let key = format!("key-{i:08}").into_bytes();
            let value = format!("value-{i}").into_bytes();
            tree.insert(&key, &value).expect("insert");
        }
        txn.commit().expect("commit");
    }
}

// =============================================================================
// Single-Key Lookups
// =============================================================================

/// Benchmark point lookups at various dataset sizes.
///
/// Measures tree traversal cost as the tree grows deeper, including the
/// per-snapshot journal translation lookups.
fn bench_point_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine/point_lookup");
    group.throughput(Throughput::Elements(1));

    for entry_count in [1_000, 10_000, 100_000] {
        let temp_dir = TempDir::new().expect("create temp dir");
        let env = Environment::create(temp_dir.path()).expect("create environment");
        populate(&env, entry_count, 10_000);

        group.bench_with_input(
            BenchmarkId::new("sequential", format!("{}k", entry_count / 1000)),
            &entry_count,
            |b, &entry_count| {
                let mut counter = 0usize;
                b.iter(|| {
                    counter = (counter + 1) % entry_count;
                    let key = format!("key-{counter:08}").into_bytes();
                    let txn = env.read().expect("read txn");
                    let result = txn.tree("bench").expect("tree").get(&key);
                    black_box(result)
                });
            },
        );
    }

    group.finish();
}

/// Benchmark missing-key lookups (worst case: full tree descent, not found).
fn bench_missing_key_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine/missing_key");
    group.throughput(Throughput::Elements(1));

    let temp_dir = TempDir::new().expect("create temp dir");
    let env = Environment::create(temp_dir.path()).expect("create environment");
    populate(&env, 10_000, 1000);

    group.bench_function("10k_entries", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let key = format!("missing-{counter}").into_bytes();
            let txn = env.read().expect("read txn");
            let result = txn.tree("bench").expect("tree").get(&key);
            black_box(result)
        });
    });

    group.finish();
}

// =============================================================================
// Insertions
// =============================================================================

/// Benchmark sequential inserts with one safe commit per batch: every
/// iteration pays a journal write plus fsync.
fn bench_batch_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine/batch_insert");

    for batch_size in [10, 100, 1000] {
        group.throughput(Throughput::Elements(batch_size as u64));

        group.bench_with_input(
            BenchmarkId::new("size", batch_size),
            &batch_size,
            |b, &batch_size| {
                let temp_dir = TempDir::new().expect("create temp dir");
                let env = Environment::create(temp_dir.path()).expect("create environment");

                let mut counter = 0u64;
                b.iter(|| {
                    let mut txn = env.write().expect("write txn");
                    let mut tree = txn.create_tree("bench").expect("open tree");
                    for _ in 0..batch_size {
                        counter += 1;
                        let key = format!("key-{counter:012}").into_bytes();
                        let value = format!("val-{counter}").into_bytes();
                        tree.insert(&key, &value).expect("insert");
                    }
                    txn.commit().expect("commit");
                });
            },
        );
    }

    group.finish();
}

/// Benchmark lazy-commit insert throughput: the journal entry stays in the
/// shared buffer, so no fsync sits on the commit path.
fn bench_insert_lazy(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine/insert_lazy");
    group.throughput(Throughput::Elements(100));

    group.bench_function("batch_100", |b| {
        let temp_dir = TempDir::new().expect("create temp dir");
        let env = Environment::create(temp_dir.path()).expect("create environment");

        let mut counter = 0u64;
        b.iter(|| {
            let mut txn = env.write().expect("write txn");
            let mut tree = txn.create_tree("bench").expect("open tree");
            for _ in 0..100 {
                counter += 1;
                let key = format!("key-{counter:012}").into_bytes();
                let value = format!("val-{counter}").into_bytes();
                tree.insert(&key, &value).expect("insert");
            }
            txn.commit_lazy().expect("commit");
        });
    });

    group.finish();
}

// =============================================================================
// Overflow Values
// =============================================================================

/// Benchmark writing 64 KiB values: each lands in an overflow chain and
/// dominates the journal entry for its commit.
fn bench_overflow_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine/overflow");
    group.throughput(Throughput::Bytes(64 * 1024));

    group.bench_function("write_64k", |b| {
        let temp_dir = TempDir::new().expect("create temp dir");
        let env = Environment::create(temp_dir.path()).expect("create environment");
        let value = vec![0xA5u8; 64 * 1024];

        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let key = format!("blob-{counter:08}").into_bytes();
            let mut txn = env.write().expect("write txn");
            txn.create_tree("blobs").expect("open tree").insert(&key, &value).expect("insert");
            txn.commit().expect("commit");
        });
    });

    group.bench_function("read_64k", |b| {
        let temp_dir = TempDir::new().expect("create temp dir");
        let env = Environment::create(temp_dir.path()).expect("create environment");
        let value = vec![0xA5u8; 64 * 1024];
        for i in 0..64u64 {
            let key = format!("blob-{i:08}").into_bytes();
            let mut txn = env.write().expect("write txn");
            txn.create_tree("blobs").expect("open tree").insert(&key, &value).expect("insert");
            txn.commit().expect("commit");
        }

        let mut counter = 0u64;
        b.iter(|| {
            counter = (counter + 1) % 64;
            let key = format!("blob-{counter:08}").into_bytes();
            let txn = env.read().expect("read txn");
            let result = txn.tree("blobs").expect("tree").get(&key);
            black_box(result)
        });
    });

    group.finish();
}

// =============================================================================
// Mixed Workload
// =============================================================================

/// Benchmark a mixed read/write workload (90% reads, 10% writes).
fn bench_mixed_workload(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine/mixed_workload");
    group.throughput(Throughput::Elements(100));

    let temp_dir = TempDir::new().expect("create temp dir");
    let env = Environment::create(temp_dir.path()).expect("create environment");
    populate(&env, 10_000, 1000);

    group.bench_function("90r_10w", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            // 90 reads
            for i in 0..90u64 {
                let key = format!("key-{:08}", (counter + i) % 10_000).into_bytes();
                let txn = env.read().expect("read txn");
                let _ = txn.tree("bench").expect("tree").get(&key);
            }

            // 10 writes in a single transaction
            let mut txn = env.write().expect("write txn");
            let mut tree = txn.create_tree("bench").expect("open tree");
            for _ in 0..10 {
                counter += 1;
                let key = format!("mixed-{counter:012}").into_bytes();
                let value = format!("val-{counter}").into_bytes();
                tree.insert(&key, &value).expect("insert");
            }
            txn.commit().expect("commit");

            black_box(counter)
        });
    });

    group.finish();
}

// =============================================================================
// Criterion Configuration
// =============================================================================

criterion_group! {
    name = lookup_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(5))
        .sample_size(100);
    targets = bench_point_lookup, bench_missing_key_lookup
}

criterion_group! {
    name = insert_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(5))
        .sample_size(50);
    targets = bench_batch_insert, bench_insert_lazy
}

criterion_group! {
    name = overflow_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(20);
    targets = bench_overflow_write
}

criterion_group! {
    name = mixed_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(5))
        .sample_size(50);
    targets = bench_mixed_workload
}

criterion_main!(lookup_benches, insert_benches, overflow_benches, mixed_benches);
