//! Property tests: whatever sequence of saves is attempted, a thread's
//! history stays contiguous from step 0 and versions increase by one.

use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use waypoint_checkpoint::{
    CheckpointDraft, Checkpointer, DistributedCheckpointer, DistributedConfig, InMemoryStore,
    LocalCheckpointer, StateValues,
};

fn draft(n: usize) -> CheckpointDraft {
    let mut state = StateValues::new();
    state.insert("n".to_string(), json!(n));
    CheckpointDraft::new(state)
}

/// Apply saves with arbitrary (often stale) expectations, then check the
/// resulting history.
async fn check_contiguous(checkpointer: &dyn Checkpointer, expectations: &[Option<u64>]) {
    let mut accepted = 0u64;
    for (i, expected) in expectations.iter().enumerate() {
        let before = checkpointer.latest("t").await.unwrap().map(|c| c.step_index);
        let result = checkpointer.save("t", draft(i), *expected).await;
        assert_eq!(result.is_ok(), before == *expected);
        if result.is_ok() {
            accepted += 1;
        }
    }

    let history = checkpointer.list("t").await.unwrap();
    assert_eq!(history.len() as u64, accepted);
    for (position, checkpoint) in history.iter().enumerate() {
        assert_eq!(checkpoint.step_index, position as u64);
        assert_eq!(checkpoint.version, position as u64 + 1);
    }
}

fn expectations() -> impl Strategy<Value = Vec<Option<u64>>> {
    prop::collection::vec(prop::option::of(0u64..6), 1..24)
}

proptest! {
    #[test]
    fn local_history_is_contiguous(expected in expectations()) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(check_contiguous(&LocalCheckpointer::new(), &expected));
    }

    #[test]
    fn distributed_history_is_contiguous(expected in expectations()) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let checkpointer = DistributedCheckpointer::new(
            Arc::new(InMemoryStore::new()),
            DistributedConfig::new().with_worker_id("prop"),
        );
        runtime.block_on(check_contiguous(&checkpointer, &expected));
    }
}
