//! Generation executor: drives one generation through its lifecycle.
//!
//! The executor claims a queued generation (persisting Running immediately so
//! a crash leaves visible evidence), resolves its inputs, invokes the
//! content-generation capability, and persists the terminal state exactly
//! once. Progress counters flow through the patch queue; the generation
//! document itself is written directly because the executor is its sole
//! writer while running.
//!
//! Cancellation is cooperative: an external canceller writes a cancelled
//! generation document, and the executor observes it by re-reading persisted
//! status at stream-chunk boundaries (or at the call boundary for
//! non-streaming providers). There is no forced termination; partial
//! transcript writes already flushed remain as-is.

use std::sync::Arc;

use chrono::Utc;
use futures_util::StreamExt;
use uuid::Uuid;

use weft_types::error::StoreError;
use weft_types::generation::{
    Generation, GenerationError, GenerationOutput, GenerationStatus, TranscriptChunk,
    TransitionError,
};
use weft_types::graph::NodeContent;
use weft_types::patch::Patch;
use weft_types::task::{StepStatus, TokenUsage};

use crate::provider::{
    GenerationProvider, GenerationRequest, MessagePart, MessageRole, ProviderEvent, ProviderReply,
    RawUsage, ResolvedMessage, ToolBinding,
};
use crate::queue::{GenerationIndexQueue, PatchQueue};
use crate::run::resolve::{resolve_placeholders, resolve_value_strings};
use crate::secret::SecretDecrypter;
use crate::storage::{LatestGenerationEntry, StorageBackend, TaskStore};

// ---------------------------------------------------------------------------
// StepProgress
// ---------------------------------------------------------------------------

/// Where a generation's step lives inside its task document. Drives the
/// patch paths for progress accounting.
#[derive(Debug, Clone, Copy)]
pub struct StepProgress {
    pub task_id: Uuid,
    pub sequence_index: usize,
    pub step_index: usize,
}

impl StepProgress {
    fn step_path(&self, leaf: &str) -> String {
        format!(
            "sequences.{}.steps.{}.{}",
            self.sequence_index, self.step_index, leaf
        )
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Infrastructure errors from executing a generation. Provider and secret
/// failures are *states* (a failed generation), never this error.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("generation not found: {0}")]
    GenerationNotFound(Uuid),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

// ---------------------------------------------------------------------------
// GenerationExecutor
// ---------------------------------------------------------------------------

/// Drives generations from queued to a terminal state.
pub struct GenerationExecutor<S: StorageBackend + 'static, P: GenerationProvider> {
    store: TaskStore<S>,
    provider: Arc<P>,
    decrypter: Arc<dyn SecretDecrypter>,
    patches: Arc<PatchQueue<S>>,
    index: Arc<GenerationIndexQueue<S>>,
}

impl<S: StorageBackend + 'static, P: GenerationProvider> GenerationExecutor<S, P> {
    pub fn new(
        store: TaskStore<S>,
        provider: Arc<P>,
        decrypter: Arc<dyn SecretDecrypter>,
        patches: Arc<PatchQueue<S>>,
        index: Arc<GenerationIndexQueue<S>>,
    ) -> Self {
        Self {
            store,
            provider,
            decrypter,
            patches,
            index,
        }
    }

    /// Execute one queued generation to a terminal state.
    ///
    /// A generation that is not queued is returned unchanged: terminal
    /// generations are immutable, and created/running ones belong to another
    /// claimant.
    pub async fn execute(
        &self,
        workspace_id: Uuid,
        generation_id: Uuid,
        progress: Option<StepProgress>,
    ) -> Result<Generation, ExecuteError> {
        let generation = self
            .store
            .get_generation(workspace_id, generation_id)
            .await?
            .ok_or(ExecuteError::GenerationNotFound(generation_id))?;

        if generation.status() != GenerationStatus::Queued {
            tracing::debug!(
                generation_id = %generation_id,
                status = ?generation.status(),
                "generation not claimable; leaving untouched"
            );
            return Ok(generation);
        }

        // Claim: persist Running immediately for crash visibility.
        let running = generation.into_running(Utc::now())?;
        self.store.put_generation(&running).await?;
        self.emit(workspace_id, progress, |p| {
            vec![
                Patch::decrement("steps.queued", 1),
                Patch::increment("steps.inProgress", 1),
                Patch::set(p.step_path("status"), status_value(StepStatus::Running)),
            ]
        });

        tracing::info!(
            generation_id = %generation_id,
            node = running.context().operation_node.name.as_str(),
            kind = running.context().operation_node.content.kind(),
            "generation running"
        );

        self.run_operation(workspace_id, running, progress).await
    }

    /// Route the running generation by its operation node's content type.
    ///
    /// Exhaustive over the closed content-type set: a new node type fails
    /// here at compile time.
    async fn run_operation(
        &self,
        workspace_id: Uuid,
        running: Generation,
        progress: Option<StepProgress>,
    ) -> Result<Generation, ExecuteError> {
        let node = running.context().operation_node.clone();
        match &node.content {
            NodeContent::TextGenerator { instructions, model }
            | NodeContent::ImageGenerator { instructions, model } => {
                let prompt =
                    resolve_placeholders(&self.store, running.context(), instructions).await?;
                let mut parts = vec![MessagePart::Text { text: prompt.text }];
                parts.extend(prompt.attachments);
                let request = GenerationRequest {
                    generation_id: running.id(),
                    node: node.clone(),
                    messages: vec![
                        ResolvedMessage {
                            role: MessageRole::System,
                            parts: vec![MessagePart::Text {
                                text: format!("You are executing the '{}' operation.", node.name),
                            }],
                        },
                        ResolvedMessage {
                            role: MessageRole::User,
                            parts,
                        },
                    ],
                    model: Some(model.clone()),
                    tools: vec![],
                };
                self.invoke_provider(workspace_id, running, request, progress)
                    .await
            }

            NodeContent::Action {
                action_name,
                parameters,
                credential,
            } => {
                let credential = match credential {
                    Some(encrypted) => match self.decrypter.decrypt(&encrypted.ciphertext) {
                        Ok(plaintext) => Some(plaintext),
                        Err(error) => {
                            return self
                                .fail(
                                    workspace_id,
                                    running,
                                    GenerationError::new("SecretError", error.to_string()),
                                    progress,
                                )
                                .await;
                        }
                    },
                    None => None,
                };
                let parameters =
                    resolve_value_strings(&self.store, running.context(), parameters).await?;
                let request = GenerationRequest {
                    generation_id: running.id(),
                    node: node.clone(),
                    messages: vec![ResolvedMessage::user_text(format!(
                        "Execute action '{action_name}'."
                    ))],
                    model: None,
                    tools: vec![ToolBinding {
                        action_name: action_name.clone(),
                        parameters,
                        credential,
                    }],
                };
                self.invoke_provider(workspace_id, running, request, progress)
                    .await
            }

            NodeContent::Query { query } => {
                let prompt = resolve_placeholders(&self.store, running.context(), query).await?;
                let request = GenerationRequest {
                    generation_id: running.id(),
                    node: node.clone(),
                    messages: vec![ResolvedMessage::user_text(prompt.text)],
                    model: None,
                    tools: vec![],
                };
                self.invoke_provider(workspace_id, running, request, progress)
                    .await
            }

            NodeContent::DataQuery { source, query } => {
                let prompt = resolve_placeholders(&self.store, running.context(), query).await?;
                let request = GenerationRequest {
                    generation_id: running.id(),
                    node: node.clone(),
                    messages: vec![ResolvedMessage::user_text(format!(
                        "[{source}] {}",
                        prompt.text
                    ))],
                    model: None,
                    tools: vec![],
                };
                self.invoke_provider(workspace_id, running, request, progress)
                    .await
            }

            // Trigger resolution: the configured payload is the output.
            NodeContent::Trigger { payload } => {
                let outputs = vec![GenerationOutput::Source {
                    value: payload.clone(),
                }];
                self.complete(
                    workspace_id,
                    running,
                    outputs,
                    RawUsage::default(),
                    false,
                    progress,
                )
                .await
            }

            // Boundary markers complete as no-ops.
            NodeContent::AppEntry { .. } | NodeContent::End => {
                self.complete(
                    workspace_id,
                    running,
                    vec![],
                    RawUsage::default(),
                    false,
                    progress,
                )
                .await
            }

            // Source nodes never back a step; reaching here is a
            // configuration incompatible with execution.
            NodeContent::Text { .. } | NodeContent::File { .. } => {
                self.fail(
                    workspace_id,
                    running,
                    GenerationError::new(
                        "IncompatibleNode",
                        format!(
                            "node '{}' of type '{}' cannot back a generation",
                            node.name,
                            node.content.kind()
                        ),
                    ),
                    progress,
                )
                .await
            }
        }
    }

    // -----------------------------------------------------------------------
    // Provider invocation
    // -----------------------------------------------------------------------

    async fn invoke_provider(
        &self,
        workspace_id: Uuid,
        running: Generation,
        request: GenerationRequest,
        progress: Option<StepProgress>,
    ) -> Result<Generation, ExecuteError> {
        if self.provider.supports_streaming() {
            self.invoke_streaming(workspace_id, running, request, progress)
                .await
        } else {
            let reply = self.provider.generate(request).await;

            // Step-boundary cancellation check: a cancel written while the
            // provider ran wins over the reply.
            if let Some(cancelled) = self.observed_cancellation(workspace_id, running.id()).await? {
                return self
                    .acknowledge_cancellation(workspace_id, cancelled, progress)
                    .await;
            }

            match reply {
                Ok(ProviderReply { outputs, usage }) => {
                    self.complete(workspace_id, running, outputs, usage, true, progress)
                        .await
                }
                Err(error) => {
                    self.fail(
                        workspace_id,
                        running,
                        GenerationError::new("ProviderError", error.to_string()),
                        progress,
                    )
                    .await
                }
            }
        }
    }

    async fn invoke_streaming(
        &self,
        workspace_id: Uuid,
        mut running: Generation,
        request: GenerationRequest,
        progress: Option<StepProgress>,
    ) -> Result<Generation, ExecuteError> {
        let mut stream = self.provider.stream(request);
        let mut outputs: Vec<GenerationOutput> = Vec::new();
        let mut usage = RawUsage::default();
        let mut streamed_text = String::new();

        while let Some(event) = stream.next().await {
            match event {
                Ok(ProviderEvent::TextDelta { text }) => {
                    // Chunk boundary: observe cancellation before writing.
                    if let Some(cancelled) =
                        self.observed_cancellation(workspace_id, running.id()).await?
                    {
                        drop(stream); // abandon the open provider call
                        return self
                            .acknowledge_cancellation(workspace_id, cancelled, progress)
                            .await;
                    }
                    streamed_text.push_str(&text);
                    running.push_transcript(TranscriptChunk {
                        text,
                        at: Utc::now(),
                    })?;
                    self.store.put_generation(&running).await?;
                }
                Ok(ProviderEvent::Output(output)) => outputs.push(output),
                Ok(ProviderEvent::Usage(reported)) => usage = reported,
                Ok(ProviderEvent::Done) => break,
                Err(error) => {
                    return self
                        .fail(
                            workspace_id,
                            running,
                            GenerationError::new("ProviderError", error.to_string()),
                            progress,
                        )
                        .await;
                }
            }
        }

        // A stream that only produced deltas still yields a text output.
        if outputs.is_empty() && !streamed_text.is_empty() {
            outputs.push(GenerationOutput::GeneratedText {
                text: streamed_text,
            });
        }

        self.complete(workspace_id, running, outputs, usage, true, progress)
            .await
    }

    /// Re-read the persisted generation; `Some` if a canceller got there.
    async fn observed_cancellation(
        &self,
        workspace_id: Uuid,
        generation_id: Uuid,
    ) -> Result<Option<Generation>, ExecuteError> {
        let persisted = self.store.get_generation(workspace_id, generation_id).await?;
        Ok(persisted.filter(|g| g.status() == GenerationStatus::Cancelled))
    }

    /// Account for an externally written cancellation. The cancelled document
    /// is already terminal; only the progress counters need updating.
    async fn acknowledge_cancellation(
        &self,
        workspace_id: Uuid,
        cancelled: Generation,
        progress: Option<StepProgress>,
    ) -> Result<Generation, ExecuteError> {
        tracing::info!(
            generation_id = %cancelled.id(),
            "cancellation observed at chunk boundary"
        );
        self.emit(workspace_id, progress, |p| {
            vec![
                Patch::decrement("steps.inProgress", 1),
                Patch::increment("steps.cancelled", 1),
                Patch::set(p.step_path("status"), status_value(StepStatus::Cancelled)),
            ]
        });
        Ok(cancelled)
    }

    // -----------------------------------------------------------------------
    // Terminal transitions (persisted exactly once)
    // -----------------------------------------------------------------------

    async fn complete(
        &self,
        workspace_id: Uuid,
        running: Generation,
        outputs: Vec<GenerationOutput>,
        raw_usage: RawUsage,
        provider_backed: bool,
        progress: Option<StepProgress>,
    ) -> Result<Generation, ExecuteError> {
        let (usage, clamped) = TokenUsage::sanitize(raw_usage.input_tokens, raw_usage.output_tokens);
        let empty_reply = provider_backed && outputs.is_empty();
        let node_id = running.context().operation_node.id;
        let started_at = match &running {
            Generation::Running { started_at, .. } => *started_at,
            _ => running.created_at(),
        };

        let completed_at = Utc::now();
        let completed = running.into_completed(completed_at, outputs, usage)?;
        self.store.put_generation(&completed).await?;
        self.index.record(
            workspace_id,
            node_id,
            LatestGenerationEntry {
                generation_id: completed.id(),
                completed_at,
            },
        );

        let duration_ms = (completed_at - started_at).num_milliseconds().max(0) as u64;
        let generation_id = completed.id();
        self.emit(workspace_id, progress, |p| {
            let mut batch = vec![
                Patch::decrement("steps.inProgress", 1),
                Patch::increment(
                    if empty_reply {
                        "steps.warning"
                    } else {
                        "steps.completed"
                    },
                    1,
                ),
                Patch::set(p.step_path("status"), status_value(StepStatus::Completed)),
                Patch::set(p.step_path("durationMs"), duration_ms),
                Patch::set(
                    p.step_path("usage"),
                    serde_json::to_value(usage).unwrap_or_default(),
                ),
                Patch::increment("usage.inputTokens", usage.input_tokens as i64),
                Patch::increment("usage.outputTokens", usage.output_tokens as i64),
            ];
            if clamped {
                batch.push(Patch::push(
                    "annotations",
                    format!("usage clamped for generation {generation_id}"),
                ));
            }
            if empty_reply {
                batch.push(Patch::push(
                    "annotations",
                    format!("generation {generation_id} completed with no outputs"),
                ));
            }
            batch
        });

        tracing::info!(
            generation_id = %generation_id,
            duration_ms,
            empty_reply,
            "generation completed"
        );
        Ok(completed)
    }

    async fn fail(
        &self,
        workspace_id: Uuid,
        running: Generation,
        error: GenerationError,
        progress: Option<StepProgress>,
    ) -> Result<Generation, ExecuteError> {
        let failed = running.into_failed(Utc::now(), error.clone())?;
        self.store.put_generation(&failed).await?;

        self.emit(workspace_id, progress, |p| {
            vec![
                Patch::decrement("steps.inProgress", 1),
                Patch::increment("steps.failed", 1),
                Patch::set(p.step_path("status"), status_value(StepStatus::Failed)),
            ]
        });

        tracing::warn!(
            generation_id = %failed.id(),
            error_name = error.name.as_str(),
            error_message = error.message.as_str(),
            "generation failed"
        );
        Ok(failed)
    }

    /// Enqueue progress patches when the generation belongs to a task step.
    fn emit<F>(&self, workspace_id: Uuid, progress: Option<StepProgress>, build: F)
    where
        F: FnOnce(&StepProgress) -> Vec<Patch>,
    {
        if let Some(p) = progress {
            self.patches.enqueue_all(workspace_id, p.task_id, build(&p));
        }
    }
}

fn status_value(status: StepStatus) -> serde_json::Value {
    serde_json::to_value(status).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderError;
    use crate::secret::{SecretDecrypter, SecretError};
    use crate::test_support::MemBackend;
    use futures_util::Stream;
    use secrecy::SecretString;
    use serde_json::json;
    use std::pin::Pin;
    use tokio::sync::Notify;
    use weft_types::config::EngineConfig;
    use weft_types::generation::{GenerationContext, RunOrigin};
    use weft_types::graph::{EncryptedCredential, Node};
    use weft_types::task::OriginKind;

    // -----------------------------------------------------------------------
    // Test doubles
    // -----------------------------------------------------------------------

    /// Provider with canned behavior per test.
    struct FakeProvider {
        reply: Result<ProviderReply, ProviderError>,
        streaming: bool,
        /// Chunks emitted as TextDelta events when streaming.
        chunks: Vec<String>,
        /// When set, the stream waits on this gate before the second chunk.
        gate: Option<Arc<Notify>>,
    }

    impl FakeProvider {
        fn text(reply_text: &str) -> Self {
            Self {
                reply: Ok(ProviderReply {
                    outputs: vec![GenerationOutput::GeneratedText {
                        text: reply_text.to_string(),
                    }],
                    usage: RawUsage {
                        input_tokens: 10.0,
                        output_tokens: 5.0,
                    },
                }),
                streaming: false,
                chunks: vec![],
                gate: None,
            }
        }
    }

    impl GenerationProvider for FakeProvider {
        fn name(&self) -> &str {
            "fake"
        }

        fn supports_streaming(&self) -> bool {
            self.streaming
        }

        async fn generate(
            &self,
            _request: GenerationRequest,
        ) -> Result<ProviderReply, ProviderError> {
            match &self.reply {
                Ok(reply) => Ok(reply.clone()),
                Err(error) => Err(ProviderError::Provider(error.to_string())),
            }
        }

        fn stream(
            &self,
            _request: GenerationRequest,
        ) -> Pin<Box<dyn Stream<Item = Result<ProviderEvent, ProviderError>> + Send + 'static>>
        {
            let chunks = self.chunks.clone();
            let gate = self.gate.clone();
            Box::pin(futures_util::stream::unfold(
                (0usize, chunks, gate),
                |(i, chunks, gate)| async move {
                    if i == 1 {
                        if let Some(gate) = &gate {
                            gate.notified().await;
                        }
                    }
                    if i < chunks.len() {
                        let event = ProviderEvent::TextDelta {
                            text: chunks[i].clone(),
                        };
                        Some((Ok(event), (i + 1, chunks, gate)))
                    } else if i == chunks.len() {
                        Some((Ok(ProviderEvent::Done), (i + 1, chunks, gate)))
                    } else {
                        None
                    }
                },
            ))
        }
    }

    struct FixedDecrypter {
        fail: bool,
    }

    impl SecretDecrypter for FixedDecrypter {
        fn decrypt(&self, _ciphertext: &[u8]) -> Result<SecretString, SecretError> {
            if self.fail {
                Err(SecretError::DecryptionFailed)
            } else {
                Ok(SecretString::from("plaintext-token"))
            }
        }
    }

    struct Fixture {
        store: TaskStore<MemBackend>,
        patches: Arc<PatchQueue<MemBackend>>,
        index: Arc<GenerationIndexQueue<MemBackend>>,
        workspace_id: Uuid,
        task_id: Uuid,
    }

    async fn fixture(provider: FakeProvider, fail_decrypt: bool) -> (Fixture, GenerationExecutor<MemBackend, FakeProvider>) {
        let config = EngineConfig {
            flush_interval_ms: 5,
            poll_interval_ms: 10,
            patch_retry_limit: 3,
        };
        let store = TaskStore::new(MemBackend::new());
        let patches = Arc::new(PatchQueue::new(store.clone(), &config));
        let index = Arc::new(GenerationIndexQueue::new(store.clone(), &config));
        let workspace_id = Uuid::now_v7();
        let task_id = Uuid::now_v7();

        // A one-step task document for progress patches to land in.
        store
            .set_task_json(
                workspace_id,
                task_id,
                &json!({
                    "steps": { "queued": 0, "inProgress": 0, "completed": 0,
                               "warning": 0, "failed": 0, "cancelled": 0 },
                    "usage": { "inputTokens": 0, "outputTokens": 0 },
                    "sequences": [ { "steps": [ { "status": "created" } ] } ],
                    "annotations": [],
                }),
            )
            .await
            .unwrap();

        let executor = GenerationExecutor::new(
            store.clone(),
            Arc::new(provider),
            Arc::new(FixedDecrypter { fail: fail_decrypt }),
            Arc::clone(&patches),
            Arc::clone(&index),
        );
        (
            Fixture {
                store,
                patches,
                index,
                workspace_id,
                task_id,
            },
            executor,
        )
    }

    fn queued_generation(workspace_id: Uuid, task_id: Uuid, content: NodeContent) -> Generation {
        let context = GenerationContext {
            operation_node: Node {
                id: Uuid::now_v7(),
                name: "op".to_string(),
                content,
            },
            source_nodes: vec![],
            connections: vec![],
            inputs: vec![],
            origin: RunOrigin {
                kind: OriginKind::Api,
                workspace_id,
                task_id: Some(task_id),
            },
        };
        Generation::created(Uuid::now_v7(), context, Utc::now())
            .into_queued(Utc::now())
            .unwrap()
    }

    fn progress(task_id: Uuid) -> StepProgress {
        StepProgress {
            task_id,
            sequence_index: 0,
            step_index: 0,
        }
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn query_completes_and_indexes() {
        let (fx, executor) = fixture(FakeProvider::text("answer"), false).await;
        let generation = queued_generation(
            fx.workspace_id,
            fx.task_id,
            NodeContent::Query {
                query: "how many".to_string(),
            },
        );
        let node_id = generation.context().operation_node.id;
        fx.store.put_generation(&generation).await.unwrap();

        let result = executor
            .execute(fx.workspace_id, generation.id(), Some(progress(fx.task_id)))
            .await
            .unwrap();
        assert_eq!(result.status(), GenerationStatus::Completed);

        fx.patches.flush().await;
        fx.index.flush().await;

        let doc = fx
            .store
            .get_task_json(fx.workspace_id, fx.task_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc["steps"]["completed"], 1);
        // Claim incremented inProgress, terminal decremented it back.
        assert_eq!(doc["steps"]["inProgress"], 0);
        assert_eq!(doc["sequences"][0]["steps"][0]["status"], "completed");
        assert_eq!(doc["usage"]["inputTokens"], 10);

        let entry = fx
            .store
            .get_latest_generation(fx.workspace_id, node_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.generation_id, result.id());

        fx.patches.shutdown().await;
        fx.index.shutdown().await;
    }

    #[tokio::test]
    async fn usage_is_sanitized_and_annotated() {
        let provider = FakeProvider {
            reply: Ok(ProviderReply {
                outputs: vec![GenerationOutput::GeneratedText {
                    text: "x".to_string(),
                }],
                usage: RawUsage {
                    input_tokens: -3.0,
                    output_tokens: 7.9,
                },
            }),
            streaming: false,
            chunks: vec![],
            gate: None,
        };
        let (fx, executor) = fixture(provider, false).await;
        let generation = queued_generation(
            fx.workspace_id,
            fx.task_id,
            NodeContent::Query {
                query: "q".to_string(),
            },
        );
        fx.store.put_generation(&generation).await.unwrap();

        let result = executor
            .execute(fx.workspace_id, generation.id(), Some(progress(fx.task_id)))
            .await
            .unwrap();
        match &result {
            Generation::Completed { usage, .. } => {
                assert_eq!(usage.input_tokens, 0);
                assert_eq!(usage.output_tokens, 7);
            }
            _ => panic!("expected completed"),
        }

        fx.patches.flush().await;
        let doc = fx
            .store
            .get_task_json(fx.workspace_id, fx.task_id)
            .await
            .unwrap()
            .unwrap();
        let annotations = doc["annotations"].as_array().unwrap();
        assert!(annotations.iter().any(|a| {
            a.as_str().unwrap().contains("usage clamped")
        }));
        fx.patches.shutdown().await;
        fx.index.shutdown().await;
    }

    #[tokio::test]
    async fn empty_provider_reply_counts_as_warning() {
        let provider = FakeProvider {
            reply: Ok(ProviderReply {
                outputs: vec![],
                usage: RawUsage::default(),
            }),
            streaming: false,
            chunks: vec![],
            gate: None,
        };
        let (fx, executor) = fixture(provider, false).await;
        let generation = queued_generation(
            fx.workspace_id,
            fx.task_id,
            NodeContent::Query {
                query: "q".to_string(),
            },
        );
        fx.store.put_generation(&generation).await.unwrap();

        executor
            .execute(fx.workspace_id, generation.id(), Some(progress(fx.task_id)))
            .await
            .unwrap();
        fx.patches.flush().await;

        let doc = fx
            .store
            .get_task_json(fx.workspace_id, fx.task_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc["steps"]["warning"], 1);
        assert_eq!(doc["steps"]["completed"], 0);
        fx.patches.shutdown().await;
        fx.index.shutdown().await;
    }

    // -----------------------------------------------------------------------
    // Failures are states
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn provider_error_becomes_failed_generation() {
        let provider = FakeProvider {
            reply: Err(ProviderError::Provider("rate limited".to_string())),
            streaming: false,
            chunks: vec![],
            gate: None,
        };
        let (fx, executor) = fixture(provider, false).await;
        let generation = queued_generation(
            fx.workspace_id,
            fx.task_id,
            NodeContent::Query {
                query: "q".to_string(),
            },
        );
        fx.store.put_generation(&generation).await.unwrap();

        let result = executor
            .execute(fx.workspace_id, generation.id(), Some(progress(fx.task_id)))
            .await
            .unwrap();
        match &result {
            Generation::Failed { error, .. } => {
                assert_eq!(error.name, "ProviderError");
                assert!(error.message.contains("rate limited"));
            }
            _ => panic!("expected failed"),
        }

        fx.patches.flush().await;
        let doc = fx
            .store
            .get_task_json(fx.workspace_id, fx.task_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc["steps"]["failed"], 1);
        fx.patches.shutdown().await;
        fx.index.shutdown().await;
    }

    #[tokio::test]
    async fn undecryptable_secret_becomes_failed_generation() {
        let (fx, executor) = fixture(FakeProvider::text("unused"), true).await;
        let generation = queued_generation(
            fx.workspace_id,
            fx.task_id,
            NodeContent::Action {
                action_name: "post-message".to_string(),
                parameters: json!({}),
                credential: Some(EncryptedCredential {
                    ciphertext: vec![1, 2, 3],
                }),
            },
        );
        fx.store.put_generation(&generation).await.unwrap();

        let result = executor
            .execute(fx.workspace_id, generation.id(), Some(progress(fx.task_id)))
            .await
            .unwrap();
        match &result {
            Generation::Failed { error, .. } => assert_eq!(error.name, "SecretError"),
            _ => panic!("expected failed"),
        }
        fx.patches.shutdown().await;
        fx.index.shutdown().await;
    }

    #[tokio::test]
    async fn source_node_is_incompatible() {
        let (fx, executor) = fixture(FakeProvider::text("unused"), false).await;
        let generation = queued_generation(
            fx.workspace_id,
            fx.task_id,
            NodeContent::Text {
                text: "static".to_string(),
            },
        );
        fx.store.put_generation(&generation).await.unwrap();

        let result = executor
            .execute(fx.workspace_id, generation.id(), None)
            .await
            .unwrap();
        match &result {
            Generation::Failed { error, .. } => assert_eq!(error.name, "IncompatibleNode"),
            _ => panic!("expected failed"),
        }
        fx.patches.shutdown().await;
        fx.index.shutdown().await;
    }

    // -----------------------------------------------------------------------
    // Claim guard
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn non_queued_generation_left_untouched() {
        let (fx, executor) = fixture(FakeProvider::text("unused"), false).await;
        let created = Generation::created(
            Uuid::now_v7(),
            queued_generation(
                fx.workspace_id,
                fx.task_id,
                NodeContent::Query {
                    query: "q".to_string(),
                },
            )
            .context()
            .clone(),
            Utc::now(),
        );
        fx.store.put_generation(&created).await.unwrap();

        let result = executor
            .execute(fx.workspace_id, created.id(), None)
            .await
            .unwrap();
        assert_eq!(result.status(), GenerationStatus::Created);
        fx.patches.shutdown().await;
        fx.index.shutdown().await;
    }

    // -----------------------------------------------------------------------
    // Trigger resolution
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn trigger_resolves_to_payload_output() {
        let (fx, executor) = fixture(FakeProvider::text("unused"), false).await;
        let generation = queued_generation(
            fx.workspace_id,
            fx.task_id,
            NodeContent::Trigger {
                payload: json!({"ref": "main"}),
            },
        );
        fx.store.put_generation(&generation).await.unwrap();

        let result = executor
            .execute(fx.workspace_id, generation.id(), Some(progress(fx.task_id)))
            .await
            .unwrap();
        match &result {
            Generation::Completed { outputs, .. } => {
                assert_eq!(outputs.len(), 1);
                assert!(matches!(
                    &outputs[0],
                    GenerationOutput::Source { value } if value["ref"] == "main"
                ));
            }
            _ => panic!("expected completed"),
        }
        // A trigger resolution with no outputs from a provider is not a warning.
        fx.patches.flush().await;
        let doc = fx
            .store
            .get_task_json(fx.workspace_id, fx.task_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc["steps"]["warning"], 0);
        assert_eq!(doc["steps"]["completed"], 1);
        fx.patches.shutdown().await;
        fx.index.shutdown().await;
    }

    // -----------------------------------------------------------------------
    // Streaming and cooperative cancellation
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn streaming_writes_transcript_and_synthesizes_text_output() {
        let provider = FakeProvider {
            reply: Err(ProviderError::Provider("unused".to_string())),
            streaming: true,
            chunks: vec!["hel".to_string(), "lo".to_string()],
            gate: None,
        };
        let (fx, executor) = fixture(provider, false).await;
        let generation = queued_generation(
            fx.workspace_id,
            fx.task_id,
            NodeContent::TextGenerator {
                instructions: "say hello".to_string(),
                model: weft_types::graph::ModelConfig {
                    provider: "fake".to_string(),
                    model: "fake-1".to_string(),
                    temperature: None,
                    max_output_tokens: None,
                },
            },
        );
        fx.store.put_generation(&generation).await.unwrap();

        let result = executor
            .execute(fx.workspace_id, generation.id(), None)
            .await
            .unwrap();
        match &result {
            Generation::Completed { outputs, .. } => {
                assert!(matches!(
                    &outputs[0],
                    GenerationOutput::GeneratedText { text } if text == "hello"
                ));
            }
            _ => panic!("expected completed"),
        }
        fx.patches.shutdown().await;
        fx.index.shutdown().await;
    }

    #[tokio::test]
    async fn cancellation_observed_mid_stream() {
        let gate = Arc::new(Notify::new());
        let provider = FakeProvider {
            reply: Err(ProviderError::Provider("unused".to_string())),
            streaming: true,
            chunks: vec!["first".to_string(), "second".to_string()],
            gate: Some(Arc::clone(&gate)),
        };
        let (fx, executor) = fixture(provider, false).await;
        let generation = queued_generation(
            fx.workspace_id,
            fx.task_id,
            NodeContent::Query {
                query: "q".to_string(),
            },
        );
        let generation_id = generation.id();
        fx.store.put_generation(&generation).await.unwrap();

        let store = fx.store.clone();
        let workspace_id = fx.workspace_id;
        let task_id = fx.task_id;
        let run = tokio::spawn(async move {
            executor
                .execute(workspace_id, generation_id, Some(progress(task_id)))
                .await
        });

        // Wait until the first chunk is persisted, then cancel out-of-band.
        loop {
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            if let Some(Generation::Running { transcript, .. }) = fx
                .store
                .get_generation(workspace_id, generation_id)
                .await
                .unwrap()
            {
                if !transcript.is_empty() {
                    break;
                }
            }
        }
        let current = store
            .get_generation(workspace_id, generation_id)
            .await
            .unwrap()
            .unwrap();
        let cancelled = current.into_cancelled(Utc::now()).unwrap();
        store.put_generation(&cancelled).await.unwrap();
        gate.notify_one();

        let result = run.await.unwrap().unwrap();
        assert_eq!(result.status(), GenerationStatus::Cancelled);

        // The persisted document stays cancelled; the partial transcript that
        // was already flushed is untouched by the executor.
        let persisted = store
            .get_generation(workspace_id, generation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(persisted.status(), GenerationStatus::Cancelled);
        fx.patches.shutdown().await;
        fx.index.shutdown().await;
    }
}
