//! Task execution: runner, dispatcher, generation executor, and resolution.
//!
//! - `runner` -- sequence-ordered execution, intra-sequence concurrency,
//!   short-circuit and skip semantics
//! - `dispatcher` -- content-type routing and poll-until-terminal waits
//! - `executor` -- the generation state machine and provider invocation
//! - `resolve` -- `{{nodeId:outputId}}` placeholder resolution
//!
//! `Engine` wires the pieces together around one storage backend.

pub mod dispatcher;
pub mod executor;
pub mod resolve;
pub mod runner;

use std::sync::Arc;
use std::time::Duration;

use weft_types::config::EngineConfig;
use weft_types::task::Task;

use crate::callback::RunCallbacks;
use crate::planner::PlannedTask;
use crate::provider::GenerationProvider;
use crate::queue::{GenerationIndexQueue, PatchQueue};
use crate::run::dispatcher::StepDispatcher;
use crate::run::executor::GenerationExecutor;
use crate::run::runner::{RunnerError, TaskRunner};
use crate::secret::SecretDecrypter;
use crate::storage::{StorageBackend, TaskStore};

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// One fully wired engine instance: store, queues, executor, dispatcher,
/// runner. Owns its queue timers; call [`Engine::shutdown`] when done.
pub struct Engine<S, P, C>
where
    S: StorageBackend + 'static,
    P: GenerationProvider + 'static,
    C: RunCallbacks,
{
    store: TaskStore<S>,
    patches: Arc<PatchQueue<S>>,
    index: Arc<GenerationIndexQueue<S>>,
    runner: TaskRunner<S, P, C>,
}

impl<S, P, C> Engine<S, P, C>
where
    S: StorageBackend + 'static,
    P: GenerationProvider + 'static,
    C: RunCallbacks,
{
    pub fn new(
        backend: S,
        provider: P,
        decrypter: Arc<dyn SecretDecrypter>,
        callbacks: C,
        config: &EngineConfig,
    ) -> Self {
        let store = TaskStore::new(backend);
        let patches = Arc::new(PatchQueue::new(store.clone(), config));
        let index = Arc::new(GenerationIndexQueue::new(store.clone(), config));
        let executor = Arc::new(GenerationExecutor::new(
            store.clone(),
            Arc::new(provider),
            decrypter,
            Arc::clone(&patches),
            Arc::clone(&index),
        ));
        let dispatcher = Arc::new(StepDispatcher::new(
            store.clone(),
            executor,
            Duration::from_millis(config.poll_interval_ms.max(1)),
        ));
        let runner = TaskRunner::new(
            store.clone(),
            Arc::clone(&patches),
            Arc::clone(&index),
            dispatcher,
            Arc::new(callbacks),
        );

        Self {
            store,
            patches,
            index,
            runner,
        }
    }

    pub fn store(&self) -> &TaskStore<S> {
        &self.store
    }

    pub fn runner(&self) -> &TaskRunner<S, P, C> {
        &self.runner
    }

    /// Run a planned task to its terminal status.
    pub async fn run(&self, planned: PlannedTask) -> Result<Task, RunnerError> {
        self.runner.run(planned).await
    }

    /// Patch batches dropped after retry exhaustion.
    pub fn dropped_patch_batches(&self) -> u64 {
        self.patches.dropped_batches()
    }

    /// Stop queue timers and flush remaining writes.
    pub async fn shutdown(&self) {
        self.patches.shutdown().await;
        self.index.shutdown().await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
