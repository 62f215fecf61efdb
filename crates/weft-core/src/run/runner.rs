//! Task runner: sequence-ordered execution with intra-sequence concurrency.
//!
//! Sequences run strictly in planned order; steps inside a sequence run
//! concurrently via `tokio::JoinSet` with no ordering guarantee among them.
//! A failed step fails its sequence and halts scheduling: every sequence
//! never reached fires `sequence_skip`, one call per skipped sequence.
//!
//! Step start carries an idempotency guard: the generation is re-fetched and
//! only promoted created -> queued once; a concurrent duplicate invocation
//! is a no-op. On overall completion the patch queues are flushed before the
//! run is considered durably recorded.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use tokio::task::JoinSet;
use uuid::Uuid;

use weft_types::error::StoreError;
use weft_types::generation::TransitionError;
use weft_types::patch::Patch;
use weft_types::task::{SequenceStatus, StepStatus, Task, TaskStatus, TokenUsage};

use crate::callback::{fire, RunCallbacks};
use crate::planner::PlannedTask;
use crate::provider::GenerationProvider;
use crate::queue::{GenerationIndexQueue, PatchQueue};
use crate::run::dispatcher::{DispatchError, StepDispatcher, StepOutcome};
use crate::run::executor::StepProgress;
use crate::storage::{StorageBackend, TaskStore};

// ---------------------------------------------------------------------------
// Errors / outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("generation missing: {0}")]
    GenerationMissing(Uuid),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("step task join error: {0}")]
    Join(String),
}

/// Result of the step-start idempotency guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller won the created -> queued transition.
    Claimed,
    /// Another invocation already owns the generation; caller is a no-op.
    AlreadyStarted,
}

// ---------------------------------------------------------------------------
// TaskRunner
// ---------------------------------------------------------------------------

/// Executes a planned task to its terminal status.
pub struct TaskRunner<S, P, C>
where
    S: StorageBackend + 'static,
    P: GenerationProvider + 'static,
    C: RunCallbacks,
{
    store: TaskStore<S>,
    patches: Arc<PatchQueue<S>>,
    index: Arc<GenerationIndexQueue<S>>,
    dispatcher: Arc<StepDispatcher<S, P>>,
    callbacks: Arc<C>,
    /// In-process claim set backing the idempotency guard.
    claims: DashMap<Uuid, ()>,
}

impl<S, P, C> TaskRunner<S, P, C>
where
    S: StorageBackend + 'static,
    P: GenerationProvider + 'static,
    C: RunCallbacks,
{
    pub fn new(
        store: TaskStore<S>,
        patches: Arc<PatchQueue<S>>,
        index: Arc<GenerationIndexQueue<S>>,
        dispatcher: Arc<StepDispatcher<S, P>>,
        callbacks: Arc<C>,
    ) -> Self {
        Self {
            store,
            patches,
            index,
            dispatcher,
            callbacks,
            claims: DashMap::new(),
        }
    }

    /// Persist a planned task: generation documents first, then the task
    /// document and workspace index, then the `task_create` hook.
    pub async fn persist(&self, planned: &PlannedTask) -> Result<(), RunnerError> {
        for generation in &planned.generations {
            self.store.put_generation(generation).await?;
        }
        self.store.put_task(&planned.task).await?;
        self.store
            .append_task_index(planned.task.workspace_id, planned.task.id)
            .await?;

        let callbacks = Arc::clone(&self.callbacks);
        let task = planned.task.clone();
        fire("task_create", move || callbacks.task_create(&task));
        Ok(())
    }

    /// Run a planned task to completion and return the final persisted task.
    pub async fn run(&self, planned: PlannedTask) -> Result<Task, RunnerError> {
        self.persist(&planned).await?;

        let task = planned.task;
        let workspace_id = task.workspace_id;
        let task_id = task.id;
        let run_start = Instant::now();

        tracing::info!(
            task_id = %task_id,
            workspace_id = %workspace_id,
            sequences = task.sequences.len(),
            "starting task run"
        );

        self.patches.enqueue_all(
            workspace_id,
            task_id,
            [
                Patch::set("status", status_json(TaskStatus::InProgress)),
                Patch::set("updatedAt", now_json()),
            ],
        );

        let mut halted: Option<TaskStatus> = None;

        for (sequence_index, sequence) in task.sequences.iter().enumerate() {
            if halted.is_some() {
                self.skip_sequence(workspace_id, task_id, sequence_index, sequence)
                    .await?;
                continue;
            }

            let status = self
                .run_sequence(workspace_id, task_id, sequence_index, sequence)
                .await?;
            match status {
                SequenceStatus::Completed => {}
                SequenceStatus::Failed => halted = Some(TaskStatus::Failed),
                SequenceStatus::Cancelled => halted = Some(TaskStatus::Cancelled),
                // run_sequence only classifies terminal outcomes.
                SequenceStatus::Created
                | SequenceStatus::InProgress
                | SequenceStatus::Skipped => {}
            }
        }

        let final_status = halted.unwrap_or(TaskStatus::Completed);
        self.patches.enqueue_all(
            workspace_id,
            task_id,
            [
                Patch::set("status", status_json(final_status)),
                Patch::set("durationMs", run_start.elapsed().as_millis() as u64),
                Patch::set("updatedAt", now_json()),
            ],
        );

        let callbacks = Arc::clone(&self.callbacks);
        fire("task_complete", move || callbacks.task_complete(task_id));

        // Synchronization point: the run is durably recorded only after the
        // queues drain.
        self.patches.flush().await;
        self.index.flush().await;

        tracing::info!(task_id = %task_id, status = ?final_status, "task run finished");

        self.store
            .get_task(workspace_id, task_id)
            .await?
            .ok_or(StoreError::NotFound)
            .map_err(RunnerError::Store)
    }

    // -----------------------------------------------------------------------
    // Sequence execution
    // -----------------------------------------------------------------------

    async fn run_sequence(
        &self,
        workspace_id: Uuid,
        task_id: Uuid,
        sequence_index: usize,
        sequence: &weft_types::task::Sequence,
    ) -> Result<SequenceStatus, RunnerError> {
        let sequence_id = sequence.id;
        let sequence_start = Instant::now();

        let callbacks = Arc::clone(&self.callbacks);
        fire("sequence_start", move || {
            callbacks.sequence_start(task_id, sequence_id, sequence_index)
        });
        self.patches.enqueue(
            workspace_id,
            task_id,
            Patch::set(
                sequence_path(sequence_index, "status"),
                status_json(SequenceStatus::InProgress),
            ),
        );

        tracing::debug!(
            task_id = %task_id,
            sequence = sequence_index,
            steps = sequence.steps.len(),
            "processing sequence"
        );

        // Claim every step, then run the claimed ones concurrently with no
        // ordering guarantee among them.
        let mut waits = JoinSet::new();
        for (step_index, step) in sequence.steps.iter().enumerate() {
            let progress = StepProgress {
                task_id,
                sequence_index,
                step_index,
            };

            match self.claim_step(workspace_id, step.generation_id).await? {
                ClaimOutcome::Claimed => {
                    self.patches.enqueue_all(
                        workspace_id,
                        task_id,
                        [
                            Patch::increment("steps.queued", 1),
                            Patch::set(
                                format!(
                                    "sequences.{sequence_index}.steps.{step_index}.status"
                                ),
                                status_json(StepStatus::Queued),
                            ),
                        ],
                    );
                    let dispatcher = Arc::clone(&self.dispatcher);
                    let generation_id = step.generation_id;
                    waits.spawn(async move {
                        dispatcher
                            .dispatch(workspace_id, generation_id, Some(progress))
                            .await
                    });
                }
                ClaimOutcome::AlreadyStarted => {
                    // Duplicate invocation: don't re-execute, but still wait
                    // for the owner's terminal state to classify the sequence.
                    tracing::warn!(
                        generation_id = %step.generation_id,
                        "step already started; waiting for terminal state"
                    );
                    let dispatcher = Arc::clone(&self.dispatcher);
                    let generation_id = step.generation_id;
                    let content = self
                        .store
                        .get_generation(workspace_id, generation_id)
                        .await?
                        .ok_or(RunnerError::GenerationMissing(generation_id))?
                        .context()
                        .operation_node
                        .content
                        .clone();
                    waits.spawn(async move {
                        dispatcher
                            .wait_terminal(
                                workspace_id,
                                generation_id,
                                crate::run::dispatcher::route(&content),
                            )
                            .await
                    });
                }
            }
        }

        let mut outcomes: Vec<StepOutcome> = Vec::new();
        while let Some(joined) = waits.join_next().await {
            let outcome = joined.map_err(|e| RunnerError::Join(e.to_string()))??;
            self.fire_generation_hooks(&outcome);
            outcomes.push(outcome);
        }

        // Classify: any failure fails the sequence; cancellation halts too.
        let status = if outcomes.iter().any(StepOutcome::is_failure) {
            SequenceStatus::Failed
        } else if outcomes
            .iter()
            .any(|o| matches!(o, StepOutcome::Cancelled { .. }))
        {
            SequenceStatus::Cancelled
        } else {
            SequenceStatus::Completed
        };

        let mut usage = TokenUsage::default();
        for outcome in &outcomes {
            if let weft_types::generation::Generation::Completed {
                usage: generation_usage,
                ..
            } = outcome.generation()
            {
                usage.add(generation_usage);
            }
        }

        self.patches.enqueue_all(
            workspace_id,
            task_id,
            [
                Patch::set(
                    sequence_path(sequence_index, "status"),
                    status_json(status),
                ),
                Patch::set(
                    sequence_path(sequence_index, "durationMs"),
                    sequence_start.elapsed().as_millis() as u64,
                ),
                Patch::set(
                    sequence_path(sequence_index, "usage"),
                    serde_json::to_value(usage).unwrap_or_default(),
                ),
            ],
        );

        let callbacks = Arc::clone(&self.callbacks);
        match status {
            SequenceStatus::Failed => fire("sequence_fail", move || {
                callbacks.sequence_fail(task_id, sequence_id, sequence_index)
            }),
            SequenceStatus::Completed => fire("sequence_complete", move || {
                callbacks.sequence_complete(task_id, sequence_id, sequence_index)
            }),
            _ => {}
        }

        // Sequence boundary: the next sequence resolves upstream outputs
        // through the node index, so its pending entries must be durable
        // before any downstream step starts.
        self.index.flush().await;

        Ok(status)
    }

    /// Mark a never-reached sequence skipped and cancel its generations.
    async fn skip_sequence(
        &self,
        workspace_id: Uuid,
        task_id: Uuid,
        sequence_index: usize,
        sequence: &weft_types::task::Sequence,
    ) -> Result<(), RunnerError> {
        let sequence_id = sequence.id;
        let callbacks = Arc::clone(&self.callbacks);
        fire("sequence_skip", move || {
            callbacks.sequence_skip(task_id, sequence_id, sequence_index)
        });

        self.patches.enqueue(
            workspace_id,
            task_id,
            Patch::set(
                sequence_path(sequence_index, "status"),
                status_json(SequenceStatus::Skipped),
            ),
        );

        for (step_index, step) in sequence.steps.iter().enumerate() {
            self.patches.enqueue_all(
                workspace_id,
                task_id,
                [
                    Patch::increment("steps.cancelled", 1),
                    Patch::set(
                        format!("sequences.{sequence_index}.steps.{step_index}.status"),
                        status_json(StepStatus::Cancelled),
                    ),
                ],
            );

            // The generations were never claimed; cancel their documents so
            // later readers see a terminal state.
            if let Some(generation) = self
                .store
                .get_generation(workspace_id, step.generation_id)
                .await?
            {
                if !generation.is_terminal() {
                    let cancelled = generation.into_cancelled(Utc::now())?;
                    self.store.put_generation(&cancelled).await?;
                }
            }
        }

        tracing::debug!(
            task_id = %task_id,
            sequence = sequence_index,
            "sequence skipped"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Step-start idempotency guard
    // -----------------------------------------------------------------------

    /// Promote a generation created -> queued exactly once.
    ///
    /// Re-fetches the persisted generation and rejects the promotion when it
    /// is no longer created (duplicate runner invocation); an in-process
    /// claim set resolves same-process races deterministically.
    pub async fn claim_step(
        &self,
        workspace_id: Uuid,
        generation_id: Uuid,
    ) -> Result<ClaimOutcome, RunnerError> {
        if self.claims.insert(generation_id, ()).is_some() {
            return Ok(ClaimOutcome::AlreadyStarted);
        }

        let generation = self
            .store
            .get_generation(workspace_id, generation_id)
            .await?
            .ok_or(RunnerError::GenerationMissing(generation_id))?;

        match generation.status() {
            weft_types::generation::GenerationStatus::Created => {
                let queued = generation.into_queued(Utc::now())?;
                self.store.put_generation(&queued).await?;
                Ok(ClaimOutcome::Claimed)
            }
            _ => Ok(ClaimOutcome::AlreadyStarted),
        }
    }

    fn fire_generation_hooks(&self, outcome: &StepOutcome) {
        let callbacks = Arc::clone(&self.callbacks);
        match outcome {
            StepOutcome::Completed { generation }
            | StepOutcome::CompletedWithWarning { generation } => {
                let generation = generation.clone();
                fire("generation_complete", move || {
                    callbacks.generation_complete(&generation)
                });
            }
            StepOutcome::Failed { generation } => {
                let generation = generation.clone();
                fire("generation_error", move || {
                    callbacks.generation_error(&generation)
                });
            }
            StepOutcome::Cancelled { .. } => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn sequence_path(index: usize, leaf: &str) -> String {
    format!("sequences.{index}.{leaf}")
}

fn status_json(status: impl serde::Serialize) -> serde_json::Value {
    serde_json::to_value(status).unwrap_or_default()
}

fn now_json() -> serde_json::Value {
    serde_json::to_value(Utc::now()).unwrap_or_default()
}
