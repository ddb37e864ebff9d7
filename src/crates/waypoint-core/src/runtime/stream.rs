//! Step events of a streamed run

use super::{RunOutcome, RunStatus};
use crate::chain::ChainStatus;
use crate::error::RuntimeError;
use crate::interrupt::InterruptDescriptor;
use futures::stream::Stream;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// One event of a streamed run
///
/// Step events carry the committed step's output. The last event has
/// `done` set and carries either the final output, the pending interrupt
/// or the error that ended the run.
#[derive(Debug, Clone, PartialEq)]
pub struct StepEvent {
    pub thread_id: String,

    /// Step index of the checkpoint this event refers to
    pub step_index: Option<u64>,

    /// Chain step name
    pub step: Option<String>,

    pub output: Option<Value>,

    pub error: Option<RuntimeError>,

    pub interrupt: Option<InterruptDescriptor>,

    /// Last event of the stream
    pub done: bool,

    /// Chain state machine position when the event was produced
    pub chain_status: ChainStatus,
}

impl StepEvent {
    pub(crate) fn step(thread_id: &str, step_index: u64, step: &str, output: Value) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            step_index: Some(step_index),
            step: Some(step.to_string()),
            output: Some(output),
            error: None,
            interrupt: None,
            done: false,
            chain_status: ChainStatus::Pending,
        }
    }

    pub(crate) fn finished(outcome: &RunOutcome) -> Self {
        match outcome {
            RunOutcome::Completed {
                thread_id,
                output,
                step_index,
            } => Self {
                thread_id: thread_id.clone(),
                step_index: Some(*step_index),
                step: None,
                output: Some(output.clone()),
                error: None,
                interrupt: None,
                done: true,
                chain_status: ChainStatus::Completed,
            },
            RunOutcome::Interrupted(descriptor) => Self::paused(descriptor.clone()),
        }
    }

    pub(crate) fn paused(descriptor: InterruptDescriptor) -> Self {
        Self {
            thread_id: descriptor.thread_id.clone(),
            step_index: Some(descriptor.step_index),
            step: descriptor.step.clone(),
            output: None,
            error: None,
            interrupt: Some(descriptor),
            done: true,
            chain_status: ChainStatus::Pending,
        }
    }

    pub(crate) fn failed(thread_id: &str, last_step: Option<u64>, error: RuntimeError) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            step_index: last_step,
            step: None,
            output: None,
            error: Some(error),
            interrupt: None,
            done: true,
            chain_status: ChainStatus::Failed,
        }
    }

    pub(crate) fn with_chain_status(mut self, status: ChainStatus) -> Self {
        self.chain_status = status;
        self
    }

    /// How the run ended, for the final event
    pub fn status(&self) -> Option<RunStatus> {
        if !self.done {
            None
        } else if self.error.is_some() {
            Some(RunStatus::Failed)
        } else if self.interrupt.is_some() {
            Some(RunStatus::Interrupted)
        } else {
            Some(RunStatus::Completed)
        }
    }
}

type EventStream = Pin<Box<dyn Stream<Item = StepEvent> + Send>>;

/// Pull-driven stream of [`StepEvent`]s
///
/// Optionally keeps the last `history` events for later inspection.
pub struct RunStream {
    thread_id: String,
    events: EventStream,
    history: Arc<Mutex<VecDeque<StepEvent>>>,
    capacity: usize,
}

impl std::fmt::Debug for RunStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunStream")
            .field("thread_id", &self.thread_id)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl RunStream {
    pub(crate) fn new(thread_id: String, events: EventStream, capacity: usize) -> Self {
        Self {
            thread_id,
            events,
            history: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Thread the run executes in
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// Retained events, oldest first
    pub fn history(&self) -> Vec<StepEvent> {
        self.history.lock().iter().cloned().collect()
    }

    fn remember(&self, event: &StepEvent) {
        if self.capacity == 0 {
            return;
        }
        let mut history = self.history.lock();
        if history.len() == self.capacity {
            history.pop_front();
        }
        history.push_back(event.clone());
    }
}

impl Stream for RunStream {
    type Item = StepEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.events.as_mut().poll_next(cx);
        if let Poll::Ready(Some(event)) = &polled {
            self.remember(event);
        }
        polled
    }
}
