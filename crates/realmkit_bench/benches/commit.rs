//! Commit and notification benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use realmkit_bench::{generate_items, item_schema};
use realmkit_core::{get_shared_realm, OpenConfig, SharedRealm};
use tempfile::TempDir;

fn open(dir: &TempDir, sync_on_commit: bool) -> SharedRealm {
    let config = OpenConfig::new(dir.path().join("bench.realm"))
        .schema(item_schema(), 1)
        .sync_on_commit(sync_on_commit);
    get_shared_realm(config).unwrap()
}

/// Benchmark commits of growing batch sizes.
fn bench_batch_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit/batch");

    for batch_size in [1, 10, 100].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            batch_size,
            |b, &batch_size| {
                let dir = TempDir::new().unwrap();
                let realm = open(&dir, false);
                let items = generate_items(batch_size, 64);

                b.iter(|| {
                    realm
                        .transaction(|g| {
                            let table = g.table_mut("Item")?;
                            for item in &items {
                                table.insert(black_box(item))?;
                            }
                            Ok(())
                        })
                        .unwrap();
                });
            },
        );
    }
    group.finish();
}

/// Benchmark a single-row commit with and without fsync.
fn bench_sync_on_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit/sync");
    let items = generate_items(1, 64);

    for sync in [false, true] {
        group.bench_with_input(BenchmarkId::from_parameter(sync), &sync, |b, &sync| {
            let dir = TempDir::new().unwrap();
            let realm = open(&dir, sync);
            b.iter(|| {
                realm
                    .transaction(|g| g.table_mut("Item")?.insert(&items[0]))
                    .unwrap();
            });
        });
    }
    group.finish();
}

/// Benchmark a commit fanned out to other handles, then picked up with
/// `refresh` by one of them.
fn bench_commit_notify(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit/notify");
    let items = generate_items(1, 64);

    for listeners in [1, 8, 32].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(listeners),
            listeners,
            |b, &listeners| {
                let dir = TempDir::new().unwrap();
                let writer = open(&dir, false);
                let config = writer.config().clone().cache(false);
                let others: Vec<SharedRealm> = (0..listeners)
                    .map(|_| get_shared_realm(config.clone()).unwrap())
                    .collect();

                b.iter(|| {
                    writer
                        .transaction(|g| g.table_mut("Item")?.insert(&items[0]))
                        .unwrap();
                    black_box(others[0].refresh().unwrap());
                    for other in &others {
                        other.pending_commit_notices().unwrap();
                    }
                });
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_batch_commit,
    bench_sync_on_commit,
    bench_commit_notify
);
criterion_main!(benches);
