use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use serde_json::json;

use maternal_sync::{
    core::store::SyncStore,
    mutation::MutationSpec,
    persist::{DurableCache, sqlite::SqliteCache},
    query::QueryCache,
    types::{MutationOp, TableName},
};

fn spec(i: u64) -> MutationSpec {
    MutationSpec::new(
        TableName::IntakeLogs,
        MutationOp::Create,
        json!({ "medicationId": format!("med-{}", i % 12), "takenAt": i }),
    )
}

fn bench_enqueue(c: &mut Criterion) {
    c.bench_function("store_enqueue_10k", |b| {
        b.iter(|| {
            let mut store = SyncStore::new();
            for i in 0..10_000u64 {
                let _ = store.queue_mutation(spec(i));
            }
        });
    });
}

fn bench_replay_cycle(c: &mut Criterion) {
    c.bench_function("store_sync_cycle_5k", |b| {
        b.iter(|| {
            let mut store = SyncStore::new();
            for i in 0..5_000u64 {
                let _ = store.queue_mutation(spec(i));
            }
            store.begin_pass();
            for m in store.pending_in_order() {
                store.mark_syncing(m.id);
                store.remove_mutation(m.id);
                store.bump_entity_sync(m.table);
            }
            let _ = store.finish_pass();
        });
    });
}

fn bench_pending_order(c: &mut Criterion) {
    let mut group = c.benchmark_group("pending_in_order");
    for n in [100u64, 1_000, 10_000] {
        let mut store = SyncStore::new();
        for i in 0..n {
            let _ = store.queue_mutation(spec(i));
        }
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| {
                let _ = store.pending_in_order();
            });
        });
    }
    group.finish();
}

fn bench_sync_state_write(c: &mut Criterion) {
    let cache: Arc<dyn DurableCache> = Arc::new(SqliteCache::open_in_memory().expect("open sqlite"));
    let mut store = SyncStore::new();
    for i in 0..1_000u64 {
        let _ = store.queue_mutation(spec(i));
    }
    let snapshot = store.export_snapshot();

    c.bench_function("save_sync_state_1k", |b| {
        b.iter(|| {
            cache.save_sync_state(&snapshot).expect("save");
        });
    });
}

fn bench_invalidate(c: &mut Criterion) {
    let cache: Arc<dyn DurableCache> = Arc::new(SqliteCache::open_in_memory().expect("open sqlite"));
    let queries = QueryCache::new(cache);

    c.bench_function("invalidate_table_200", |b| {
        b.iter(|| {
            for i in 0..200u64 {
                let key = QueryCache::key_for("medications.byBooklet", &json!({ "bookletId": i }));
                queries.write(&key, &json!([i]), i);
            }
            queries.invalidate_table(TableName::Medications);
        });
    });
}

criterion_group!(
    benches,
    bench_enqueue,
    bench_replay_cycle,
    bench_pending_order,
    bench_sync_state_write,
    bench_invalidate
);
criterion_main!(benches);
