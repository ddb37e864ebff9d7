//! Property tests for run history and state snapshots

use proptest::prelude::*;
use serde_json::{json, Value};
use std::sync::Arc;
use waypoint_core::middleware::MiddlewareChain;
use waypoint_core::{
    Chain, InvokeOptions, LocalCheckpointer, Route, RunContext, Runtime, State, StepContext,
};

fn loop_chain(iterations: i64) -> Arc<Chain> {
    Arc::new(
        Chain::builder("loop")
            .step_fn("tick", |_input: Value, ctx: StepContext| async move {
                Ok(ctx
                    .state()
                    .update("ticks", |v| json!(v.and_then(Value::as_i64).unwrap_or(0) + 1)))
            })
            .step_fn("tock", |input: Value, _ctx: StepContext| async move { Ok(input) })
            .route("tick", move |state| {
                if state.get_i64("ticks").unwrap_or(0) < iterations {
                    Route::goto("tick")
                } else {
                    Route::Next
                }
            })
            .build()
            .unwrap(),
    )
}

#[derive(Debug, Clone)]
enum Op {
    Set(String, i64),
    Delete(String),
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    let key = prop::sample::select(vec!["a", "b", "c", "d"]).prop_map(str::to_string);
    let op = prop_oneof![
        (key.clone(), any::<i64>()).prop_map(|(k, v)| Op::Set(k, v)),
        key.prop_map(Op::Delete),
    ];
    prop::collection::vec(op, 0..20)
}

fn apply(state: &State, ops: &[Op]) {
    for op in ops {
        match op {
            Op::Set(key, value) => {
                state.set(key.clone(), json!(value));
            }
            Op::Delete(key) => {
                state.delete(key);
            }
        }
    }
}

proptest! {
    #[test]
    fn routing_loop_history_is_contiguous(iterations in 1i64..12) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (outcome, history) = rt.block_on(async {
            let runtime = Runtime::new(Arc::new(LocalCheckpointer::new()), MiddlewareChain::new());
            let outcome = runtime
                .invoke(
                    &RunContext::for_thread("loop"),
                    loop_chain(iterations),
                    json!(null),
                    InvokeOptions::default(),
                )
                .await
                .unwrap();
            (outcome, runtime.history("loop").await.unwrap())
        });

        prop_assert_eq!(outcome.output(), Some(&json!(iterations)));
        prop_assert_eq!(history.len() as i64, iterations + 1);
        for (position, checkpoint) in history.iter().enumerate() {
            prop_assert_eq!(checkpoint.step_index, position as u64);
        }
        prop_assert!(history.last().unwrap().is_completed());
        prop_assert!(history[..history.len() - 1].iter().all(|c| !c.is_completed()));
    }

    #[test]
    fn snapshots_are_isolated_from_later_writes(before in ops(), after in ops()) {
        let state = State::new();
        apply(&state, &before);

        let snapshot = state.snapshot();
        let frozen = snapshot.to_json();
        apply(&state, &after);
        prop_assert_eq!(snapshot.to_json(), frozen.clone());

        state.restore(&snapshot);
        prop_assert_eq!(state.to_json(), frozen);
    }
}
