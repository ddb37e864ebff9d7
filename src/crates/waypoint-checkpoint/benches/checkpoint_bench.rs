use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::sync::Arc;
use waypoint_checkpoint::{
    CheckpointDraft, Checkpointer, DistributedCheckpointer, DistributedConfig, InMemoryStore,
    LocalCheckpointer, StateValues,
};

fn draft() -> CheckpointDraft {
    let mut state = StateValues::new();
    state.insert("count".to_string(), json!(1));
    state.insert("items".to_string(), json!(["a", "b", "c"]));
    CheckpointDraft::new(state)
}

fn local_save_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("local checkpoint save", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let saver = LocalCheckpointer::new();
                saver
                    .save("bench-thread", black_box(draft()), None)
                    .await
                    .unwrap();
            })
        });
    });
}

fn local_load_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let saver = LocalCheckpointer::new();
    runtime.block_on(async {
        let mut prev = None;
        for _ in 0..100 {
            saver.save("bench-thread", draft(), prev).await.unwrap();
            prev = Some(prev.map_or(0, |p| p + 1));
        }
    });

    c.bench_function("local checkpoint load latest", |b| {
        b.iter(|| {
            runtime.block_on(async {
                saver.load(black_box("bench-thread"), None).await.unwrap();
            })
        });
    });
}

fn distributed_save_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("distributed checkpoint save", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let saver = DistributedCheckpointer::new(
                    Arc::new(InMemoryStore::new()),
                    DistributedConfig::new().with_worker_id("bench"),
                );
                saver
                    .save("bench-thread", black_box(draft()), None)
                    .await
                    .unwrap();
            })
        });
    });
}

criterion_group!(
    benches,
    local_save_benchmark,
    local_load_benchmark,
    distributed_save_benchmark
);
criterion_main!(benches);
