//! Multi-worker tests for the distributed checkpointer
//!
//! Several `DistributedCheckpointer`s sharing one `InMemoryStore` stand in for
//! worker processes talking to the same storage service.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use waypoint_checkpoint::{
    CheckpointDraft, CheckpointError, Checkpointer, DistributedCheckpointer, DistributedConfig,
    InMemoryStore, StateValues,
};

fn worker(store: &Arc<InMemoryStore>, id: &str, ttl: Duration) -> DistributedCheckpointer {
    DistributedCheckpointer::new(
        store.clone(),
        DistributedConfig::new().with_worker_id(id).with_lease_ttl(ttl),
    )
}

fn draft(step: &str) -> CheckpointDraft {
    let mut state = StateValues::new();
    state.insert("last".to_string(), json!(step));
    CheckpointDraft::new(state)
}

#[tokio::test]
async fn test_live_lease_blocks_other_worker() {
    let store = Arc::new(InMemoryStore::new());
    let a = worker(&store, "worker-a", Duration::from_secs(30));
    let b = worker(&store, "worker-b", Duration::from_secs(30));

    a.save("order-1", draft("validate"), None).await.unwrap();

    let err = b.save("order-1", draft("charge"), Some(0)).await.unwrap_err();
    match err {
        CheckpointError::LeaseConflict { holder, .. } => assert_eq!(holder, "worker-a"),
        other => panic!("expected lease conflict, got {other}"),
    }

    // Nothing was written by the rejected worker
    assert_eq!(a.list("order-1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_expired_lease_is_taken_over() {
    let store = Arc::new(InMemoryStore::new());
    let a = worker(&store, "worker-a", Duration::from_millis(50));
    let b = worker(&store, "worker-b", Duration::from_secs(30));

    a.save("order-1", draft("validate"), None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // b resumes from a's last checkpoint
    let latest = b.load("order-1", None).await.unwrap();
    b.save("order-1", draft("charge"), Some(latest.step_index))
        .await
        .unwrap();

    let lease = b.current_lease("order-1").await.unwrap().unwrap();
    assert_eq!(lease.worker_id, "worker-b");

    // a comes back with a stale view and is fenced off
    assert!(matches!(
        a.save("order-1", draft("late"), Some(0)).await,
        Err(CheckpointError::LeaseConflict { .. })
    ));
}

#[tokio::test]
async fn test_stale_expected_step_conflicts_for_lease_holder() {
    let store = Arc::new(InMemoryStore::new());
    let a = worker(&store, "worker-a", Duration::from_secs(30));

    a.save("t", draft("s0"), None).await.unwrap();
    a.save("t", draft("s1"), Some(0)).await.unwrap();

    let err = a.save("t", draft("dup"), Some(0)).await.unwrap_err();
    assert!(matches!(
        err,
        CheckpointError::VersionConflict {
            expected: Some(0),
            actual: Some(1),
            ..
        }
    ));
}

#[tokio::test]
async fn test_concurrent_saves_same_worker_single_winner() {
    let store = Arc::new(InMemoryStore::new());
    let a = worker(&store, "worker-a", Duration::from_secs(30));
    a.save("t", draft("s0"), None).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let cp = a.clone();
        handles.push(tokio::spawn(async move {
            cp.save("t", draft(&format!("racer-{i}")), Some(0)).await
        }));
    }

    let mut ok = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(CheckpointError::VersionConflict { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(ok, 1);
    let steps: Vec<u64> = a
        .list("t")
        .await
        .unwrap()
        .iter()
        .map(|c| c.step_index)
        .collect();
    assert_eq!(steps, vec![0, 1]);
}

#[tokio::test]
async fn test_delete_clears_history_and_lease() {
    let store = Arc::new(InMemoryStore::new());
    let a = worker(&store, "worker-a", Duration::from_secs(30));
    let b = worker(&store, "worker-b", Duration::from_secs(30));

    a.save("t", draft("s0"), None).await.unwrap();
    a.delete("t").await.unwrap();

    assert!(store.is_empty());
    // With the lease gone another worker may start the thread over
    b.save("t", draft("fresh"), None).await.unwrap();
}

#[tokio::test]
async fn test_search_by_record_field() {
    let store = Arc::new(InMemoryStore::new());
    let a = worker(&store, "worker-a", Duration::from_secs(30));

    for prev in [None, Some(0), Some(1)] {
        a.save("t", draft("s"), prev).await.unwrap();
    }

    let mut filter = std::collections::HashMap::new();
    filter.insert("step_index".to_string(), json!(1));
    let found = a.search("t", &filter).await.unwrap();

    assert_eq!(found.len(), 1);
    assert_eq!(found[0].step_index, 1);
    assert_eq!(found[0].version, 2);
}

#[tokio::test]
async fn test_renew_and_release() {
    let store = Arc::new(InMemoryStore::new());
    let a = worker(&store, "worker-a", Duration::from_secs(5));
    let b = worker(&store, "worker-b", Duration::from_secs(5));

    let lease = a.acquire_lease("t").await.unwrap().unwrap();
    let renewed = a.renew_lease(&lease).await.unwrap();
    assert!(renewed.expires_at >= lease.expires_at);
    assert_eq!(renewed.acquired_at, lease.acquired_at);

    a.release_lease(&renewed).await.unwrap();
    assert!(b.acquire_lease("t").await.unwrap().is_some());
}
