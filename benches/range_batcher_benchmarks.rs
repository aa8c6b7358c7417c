//! Range batcher and enqueue throughput over the in-memory adapters.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use futures::TryStreamExt;
use std::sync::Arc;
use tokio::runtime::Runtime;

use batched_migrations::config::SchedulingConfig;
use batched_migrations::database::InMemoryStore;
use batched_migrations::models::{BatchRange, ColumnKind, MigrationJobSpec};
use batched_migrations::orchestration::{EnqueueOptions, JobEnqueuer};
use batched_migrations::{InMemoryJobQueue, InMemoryLedger, RangeBatcher, Relation};

fn seeded_store(rows: i64) -> Arc<InMemoryStore> {
    let store = InMemoryStore::new();
    store.create_table("users", &[("id", ColumnKind::Integer)]);
    store
        .insert_ids("users", "id", 1..=rows)
        .expect("seed rows");
    Arc::new(store)
}

fn benchmark_keyset_batches(c: &mut Criterion) {
    let runtime = Runtime::new().expect("tokio runtime");
    let mut group = c.benchmark_group("keyset_batches");

    for rows in [1_000_i64, 10_000, 100_000] {
        let batcher = RangeBatcher::new(seeded_store(rows));
        let relation = Relation::table("users");

        group.bench_with_input(BenchmarkId::from_parameter(rows), &rows, |b, _| {
            b.iter(|| {
                runtime.block_on(async {
                    let ranges: Vec<BatchRange> = batcher
                        .batches(&relation, "id", 1_000)
                        .await
                        .expect("batch stream")
                        .try_collect()
                        .await
                        .expect("ranges");
                    black_box(ranges)
                })
            });
        });
    }

    group.finish();
}

fn benchmark_enqueue(c: &mut Criterion) {
    let runtime = Runtime::new().expect("tokio runtime");
    let batcher = RangeBatcher::new(seeded_store(50_000));
    let relation = Relation::table("users");

    c.bench_function("enqueue_50_ranges_untracked", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let enqueuer = JobEnqueuer::new(
                    Arc::new(InMemoryJobQueue::new("background_migration")),
                    Arc::new(InMemoryLedger::new()),
                    SchedulingConfig::default(),
                );
                let spec = MigrationJobSpec::new("BackfillUserState", "users", "id").with_batch_size(1_000);
                let ranges = batcher
                    .batches(&relation, "id", spec.batch_size)
                    .await
                    .expect("batch stream");
                let result = enqueuer
                    .enqueue(&spec, ranges, EnqueueOptions::untracked())
                    .await
                    .expect("enqueue");
                black_box(result.submitted())
            })
        });
    });
}

criterion_group!(benches, benchmark_keyset_batches, benchmark_enqueue);
criterion_main!(benches);
