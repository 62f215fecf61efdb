//! Lifecycle callback port.
//!
//! Consumers observe a run through `RunCallbacks`. Every hook has a default
//! empty body, and the runner invokes hooks fire-and-forget: a panicking
//! callback is caught and logged, never allowed to abort execution.

use std::panic::{AssertUnwindSafe, catch_unwind};

use uuid::Uuid;

use weft_types::generation::Generation;
use weft_types::task::Task;

/// Lifecycle hooks fired by the task runner.
///
/// Implementations must be cheap or hand off to their own channel: hooks are
/// called inline on the runner's execution path.
#[allow(unused_variables)]
pub trait RunCallbacks: Send + Sync {
    /// A task was materialized and persisted.
    fn task_create(&self, task: &Task) {}

    /// A sequence is about to run its steps.
    fn sequence_start(&self, task_id: Uuid, sequence_id: Uuid, index: usize) {}

    /// Every step in the sequence completed.
    fn sequence_complete(&self, task_id: Uuid, sequence_id: Uuid, index: usize) {}

    /// At least one step in the sequence failed; subsequent sequences will
    /// be skipped.
    fn sequence_fail(&self, task_id: Uuid, sequence_id: Uuid, index: usize) {}

    /// A sequence was never reached because an earlier one failed. Fired
    /// once per skipped sequence.
    fn sequence_skip(&self, task_id: Uuid, sequence_id: Uuid, index: usize) {}

    /// A generation reached completed.
    fn generation_complete(&self, generation: &Generation) {}

    /// A generation reached failed.
    fn generation_error(&self, generation: &Generation) {}

    /// The run finished; fired before the final queue flush.
    fn task_complete(&self, task_id: Uuid) {}
}

/// No-op callbacks for callers that don't observe the run.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallbacks;

impl RunCallbacks for NoopCallbacks {}

/// Invoke a callback fire-and-forget, containing any panic.
pub(crate) fn fire<F: FnOnce()>(hook: &'static str, f: F) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::warn!(hook, "run callback panicked; continuing");
    }
}
