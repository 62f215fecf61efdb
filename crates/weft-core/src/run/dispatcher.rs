//! Step dispatcher: routes an operation to its execution path and waits for
//! the terminal state.
//!
//! For generation-producing routes the dispatcher spawns the executor and
//! then polls the *persisted* generation at a fixed interval (reference 1s)
//! rather than awaiting a push channel. Polling decouples execution progress
//! from the dispatching process's own lifetime: a restarted runner can wait
//! on a generation claimed before the restart.
//!
//! A terminal failed generation is reported upward as a result value, not an
//! error -- the failure-vs-retry decision belongs to the caller.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use weft_types::error::StoreError;
use weft_types::generation::{Generation, GenerationStatus};
use weft_types::graph::NodeContent;

use crate::provider::GenerationProvider;
use crate::run::executor::{ExecuteError, GenerationExecutor, StepProgress};
use crate::storage::{StorageBackend, TaskStore};

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// Execution path for an operation node's content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepRoute {
    /// Invoke the content-generation capability.
    Provider,
    /// Resolve a trigger to its configured payload.
    TriggerResolution,
    /// Boundary markers: complete immediately, no capability call.
    NoOp,
    /// Source nodes cannot back a step; executing one is a configuration
    /// failure surfaced as a failed generation.
    Incompatible,
}

/// Route a content type to its execution path.
///
/// Exhaustive over the closed content-type set: adding a node type fails
/// compilation here, not at runtime.
pub fn route(content: &NodeContent) -> StepRoute {
    match content {
        NodeContent::TextGenerator { .. }
        | NodeContent::ImageGenerator { .. }
        | NodeContent::Action { .. }
        | NodeContent::Query { .. }
        | NodeContent::DataQuery { .. } => StepRoute::Provider,
        NodeContent::Trigger { .. } => StepRoute::TriggerResolution,
        NodeContent::AppEntry { .. } | NodeContent::End => StepRoute::NoOp,
        NodeContent::Text { .. } | NodeContent::File { .. } => StepRoute::Incompatible,
    }
}

// ---------------------------------------------------------------------------
// StepOutcome
// ---------------------------------------------------------------------------

/// Terminal classification of one dispatched step.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Completed { generation: Generation },
    /// Completed, but the provider returned no outputs.
    CompletedWithWarning { generation: Generation },
    /// The generation failed; carried as a value, never thrown.
    Failed { generation: Generation },
    Cancelled { generation: Generation },
}

impl StepOutcome {
    pub fn generation(&self) -> &Generation {
        match self {
            StepOutcome::Completed { generation }
            | StepOutcome::CompletedWithWarning { generation }
            | StepOutcome::Failed { generation }
            | StepOutcome::Cancelled { generation } => generation,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, StepOutcome::Failed { .. })
    }
}

/// Infrastructure errors while dispatching.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("generation not found: {0}")]
    GenerationNotFound(Uuid),
}

// ---------------------------------------------------------------------------
// StepDispatcher
// ---------------------------------------------------------------------------

/// Routes steps and waits for their generations to become terminal.
pub struct StepDispatcher<S: StorageBackend + 'static, P: GenerationProvider + 'static> {
    store: TaskStore<S>,
    executor: Arc<GenerationExecutor<S, P>>,
    poll_interval: Duration,
}

impl<S: StorageBackend + 'static, P: GenerationProvider + 'static> StepDispatcher<S, P> {
    pub fn new(
        store: TaskStore<S>,
        executor: Arc<GenerationExecutor<S, P>>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            executor,
            poll_interval,
        }
    }

    /// Spawn execution for a queued generation and wait for its terminal
    /// state by polling storage.
    pub async fn dispatch(
        &self,
        workspace_id: Uuid,
        generation_id: Uuid,
        progress: Option<StepProgress>,
    ) -> Result<StepOutcome, DispatchError> {
        // Verify the generation exists before committing to a poll loop.
        let generation = self
            .store
            .get_generation(workspace_id, generation_id)
            .await?
            .ok_or(DispatchError::GenerationNotFound(generation_id))?;
        let step_route = route(&generation.context().operation_node.content);

        // Execution is detached: its completion is observed through storage,
        // not through this join handle.
        let executor = Arc::clone(&self.executor);
        tokio::spawn(async move {
            if let Err(error) = executor.execute(workspace_id, generation_id, progress).await {
                tracing::error!(
                    generation_id = %generation_id,
                    %error,
                    "generation execution aborted on infrastructure error"
                );
            }
        });

        self.wait_terminal(workspace_id, generation_id, step_route)
            .await
    }

    /// Poll the persisted generation until it is terminal. Usable on its own
    /// when another process owns execution.
    pub async fn wait_terminal(
        &self,
        workspace_id: Uuid,
        generation_id: Uuid,
        step_route: StepRoute,
    ) -> Result<StepOutcome, DispatchError> {
        loop {
            if let Some(generation) = self
                .store
                .get_generation(workspace_id, generation_id)
                .await?
            {
                match generation.status() {
                    GenerationStatus::Completed => {
                        let empty = matches!(
                            &generation,
                            Generation::Completed { outputs, .. } if outputs.is_empty()
                        );
                        return Ok(if empty && step_route == StepRoute::Provider {
                            StepOutcome::CompletedWithWarning { generation }
                        } else {
                            StepOutcome::Completed { generation }
                        });
                    }
                    GenerationStatus::Failed => {
                        return Ok(StepOutcome::Failed { generation });
                    }
                    GenerationStatus::Cancelled => {
                        return Ok(StepOutcome::Cancelled { generation });
                    }
                    GenerationStatus::Created
                    | GenerationStatus::Queued
                    | GenerationStatus::Running => {}
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
