//! Generation types: the stateful unit of model/tool work backing a step.
//!
//! A `Generation` is a tagged union keyed by `status`, advancing monotonically
//! created -> queued -> running -> {completed | failed | cancelled}
//! (cancellation may also preempt running). Transition methods consume the
//! value, so an illegal transition is a `TransitionError`, never a silently
//! regressed document. Once terminal, a generation is immutable to all readers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::graph::{Connection, Node};
use crate::task::{OriginKind, TokenUsage};

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Where a generation's run originated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOrigin {
    pub kind: OriginKind,
    pub workspace_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
}

/// An externally supplied parameter value (app-entry inputs).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalInput {
    pub key: String,
    pub value: serde_json::Value,
}

/// Resolved inputs for a generation: the operation node, its upstream
/// sources, the connections that join them, and the run origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationContext {
    pub operation_node: Node,
    pub source_nodes: Vec<Node>,
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub inputs: Vec<ExternalInput>,
    pub origin: RunOrigin,
}

// ---------------------------------------------------------------------------
// Outputs / error / transcript
// ---------------------------------------------------------------------------

/// Typed output produced by a completed generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum GenerationOutput {
    GeneratedText { text: String },
    GeneratedImage { blob_path: String, mime_type: String },
    Reasoning { text: String },
    Source { value: serde_json::Value },
    QueryResult { value: serde_json::Value },
    DataQueryResult { value: serde_json::Value },
}

/// Structured error carried by a failed generation. Never empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationError {
    /// Short machine-readable error name (e.g. "ProviderError").
    pub name: String,
    /// Human-readable message.
    pub message: String,
}

impl GenerationError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// One streamed text delta in a running generation's live transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptChunk {
    pub text: String,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Flat status view of a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GenerationStatus {
    Created,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl GenerationStatus {
    /// Monotonic rank: a generation observed at rank N is never later
    /// observed below N. All terminal states share the top rank.
    pub fn rank(&self) -> u8 {
        match self {
            GenerationStatus::Created => 0,
            GenerationStatus::Queued => 1,
            GenerationStatus::Running => 2,
            GenerationStatus::Completed
            | GenerationStatus::Failed
            | GenerationStatus::Cancelled => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 3
    }
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

/// The stateful unit of model/tool work backing a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum Generation {
    Created {
        id: Uuid,
        context: GenerationContext,
        created_at: DateTime<Utc>,
    },
    Queued {
        id: Uuid,
        context: GenerationContext,
        created_at: DateTime<Utc>,
        queued_at: DateTime<Utc>,
    },
    Running {
        id: Uuid,
        context: GenerationContext,
        created_at: DateTime<Utc>,
        started_at: DateTime<Utc>,
        /// Live transcript, appended at stream-chunk boundaries.
        transcript: Vec<TranscriptChunk>,
    },
    Completed {
        id: Uuid,
        context: GenerationContext,
        created_at: DateTime<Utc>,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        outputs: Vec<GenerationOutput>,
        usage: TokenUsage,
    },
    Failed {
        id: Uuid,
        context: GenerationContext,
        created_at: DateTime<Utc>,
        failed_at: DateTime<Utc>,
        error: GenerationError,
    },
    Cancelled {
        id: Uuid,
        context: GenerationContext,
        created_at: DateTime<Utc>,
        cancelled_at: DateTime<Utc>,
    },
}

/// An attempted status transition that would regress or re-terminate.
#[derive(Debug, thiserror::Error)]
#[error("illegal generation transition: {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: GenerationStatus,
    pub to: GenerationStatus,
}

impl Generation {
    /// Seed a fresh generation at status created.
    pub fn created(id: Uuid, context: GenerationContext, at: DateTime<Utc>) -> Self {
        Generation::Created {
            id,
            context,
            created_at: at,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Generation::Created { id, .. }
            | Generation::Queued { id, .. }
            | Generation::Running { id, .. }
            | Generation::Completed { id, .. }
            | Generation::Failed { id, .. }
            | Generation::Cancelled { id, .. } => *id,
        }
    }

    pub fn context(&self) -> &GenerationContext {
        match self {
            Generation::Created { context, .. }
            | Generation::Queued { context, .. }
            | Generation::Running { context, .. }
            | Generation::Completed { context, .. }
            | Generation::Failed { context, .. }
            | Generation::Cancelled { context, .. } => context,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Generation::Created { created_at, .. }
            | Generation::Queued { created_at, .. }
            | Generation::Running { created_at, .. }
            | Generation::Completed { created_at, .. }
            | Generation::Failed { created_at, .. }
            | Generation::Cancelled { created_at, .. } => *created_at,
        }
    }

    pub fn status(&self) -> GenerationStatus {
        match self {
            Generation::Created { .. } => GenerationStatus::Created,
            Generation::Queued { .. } => GenerationStatus::Queued,
            Generation::Running { .. } => GenerationStatus::Running,
            Generation::Completed { .. } => GenerationStatus::Completed,
            Generation::Failed { .. } => GenerationStatus::Failed,
            Generation::Cancelled { .. } => GenerationStatus::Cancelled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    fn illegal(&self, to: GenerationStatus) -> TransitionError {
        TransitionError {
            from: self.status(),
            to,
        }
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// created -> queued.
    pub fn into_queued(self, at: DateTime<Utc>) -> Result<Self, TransitionError> {
        match self {
            Generation::Created {
                id,
                context,
                created_at,
            } => Ok(Generation::Queued {
                id,
                context,
                created_at,
                queued_at: at,
            }),
            other => Err(other.illegal(GenerationStatus::Queued)),
        }
    }

    /// queued -> running. Records `started_at` and an empty transcript.
    pub fn into_running(self, at: DateTime<Utc>) -> Result<Self, TransitionError> {
        match self {
            Generation::Queued {
                id,
                context,
                created_at,
                ..
            } => Ok(Generation::Running {
                id,
                context,
                created_at,
                started_at: at,
                transcript: Vec::new(),
            }),
            other => Err(other.illegal(GenerationStatus::Running)),
        }
    }

    /// running -> completed.
    pub fn into_completed(
        self,
        at: DateTime<Utc>,
        outputs: Vec<GenerationOutput>,
        usage: TokenUsage,
    ) -> Result<Self, TransitionError> {
        match self {
            Generation::Running {
                id,
                context,
                created_at,
                started_at,
                ..
            } => Ok(Generation::Completed {
                id,
                context,
                created_at,
                started_at,
                completed_at: at,
                outputs,
                usage,
            }),
            other => Err(other.illegal(GenerationStatus::Completed)),
        }
    }

    /// running -> failed. Pre-running failures go through the planner or the
    /// runner, which never hand a created/queued generation to a provider.
    pub fn into_failed(
        self,
        at: DateTime<Utc>,
        error: GenerationError,
    ) -> Result<Self, TransitionError> {
        match self {
            Generation::Running {
                id,
                context,
                created_at,
                ..
            } => Ok(Generation::Failed {
                id,
                context,
                created_at,
                failed_at: at,
                error,
            }),
            other => Err(other.illegal(GenerationStatus::Failed)),
        }
    }

    /// Any non-terminal state -> cancelled.
    pub fn into_cancelled(self, at: DateTime<Utc>) -> Result<Self, TransitionError> {
        match self {
            Generation::Created {
                id,
                context,
                created_at,
            }
            | Generation::Queued {
                id,
                context,
                created_at,
                ..
            }
            | Generation::Running {
                id,
                context,
                created_at,
                ..
            } => Ok(Generation::Cancelled {
                id,
                context,
                created_at,
                cancelled_at: at,
            }),
            other => Err(other.illegal(GenerationStatus::Cancelled)),
        }
    }

    /// Append a transcript chunk to a running generation.
    pub fn push_transcript(&mut self, chunk: TranscriptChunk) -> Result<(), TransitionError> {
        match self {
            Generation::Running { transcript, .. } => {
                transcript.push(chunk);
                Ok(())
            }
            other => Err(other.illegal(GenerationStatus::Running)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeContent;

    fn sample_context() -> GenerationContext {
        GenerationContext {
            operation_node: Node {
                id: Uuid::now_v7(),
                name: "generate".to_string(),
                content: NodeContent::Query {
                    query: "select 1".to_string(),
                },
            },
            source_nodes: vec![],
            connections: vec![],
            inputs: vec![],
            origin: RunOrigin {
                kind: OriginKind::Api,
                workspace_id: Uuid::now_v7(),
                task_id: None,
            },
        }
    }

    fn fresh() -> Generation {
        Generation::created(Uuid::now_v7(), sample_context(), Utc::now())
    }

    // -----------------------------------------------------------------------
    // Happy-path lifecycle
    // -----------------------------------------------------------------------

    #[test]
    fn full_lifecycle_to_completed() {
        let generation = fresh()
            .into_queued(Utc::now())
            .unwrap()
            .into_running(Utc::now())
            .unwrap()
            .into_completed(
                Utc::now(),
                vec![GenerationOutput::GeneratedText {
                    text: "done".to_string(),
                }],
                TokenUsage::default(),
            )
            .unwrap();
        assert_eq!(generation.status(), GenerationStatus::Completed);
        assert!(generation.is_terminal());
    }

    #[test]
    fn running_initializes_empty_transcript() {
        let generation = fresh()
            .into_queued(Utc::now())
            .unwrap()
            .into_running(Utc::now())
            .unwrap();
        match &generation {
            Generation::Running { transcript, .. } => assert!(transcript.is_empty()),
            _ => panic!("expected running"),
        }
    }

    // -----------------------------------------------------------------------
    // Monotonicity: illegal transitions are rejected
    // -----------------------------------------------------------------------

    #[test]
    fn created_cannot_run_directly() {
        let err = fresh().into_running(Utc::now()).unwrap_err();
        assert_eq!(err.from, GenerationStatus::Created);
        assert_eq!(err.to, GenerationStatus::Running);
    }

    #[test]
    fn terminal_states_reject_all_transitions() {
        let cancelled = fresh().into_cancelled(Utc::now()).unwrap();
        assert!(cancelled.clone().into_queued(Utc::now()).is_err());
        assert!(cancelled.into_cancelled(Utc::now()).is_err());
    }

    #[test]
    fn status_rank_is_monotone_along_lifecycle() {
        let mut generation = fresh();
        let mut last_rank = generation.status().rank();
        for next in [
            fresh().into_queued(Utc::now()).unwrap().status(),
            GenerationStatus::Running,
            GenerationStatus::Failed,
        ] {
            assert!(next.rank() >= last_rank);
            last_rank = next.rank();
        }
        generation = generation.into_queued(Utc::now()).unwrap();
        assert!(generation.status().rank() > GenerationStatus::Created.rank());
    }

    #[test]
    fn cancellation_preempts_running() {
        let generation = fresh()
            .into_queued(Utc::now())
            .unwrap()
            .into_running(Utc::now())
            .unwrap()
            .into_cancelled(Utc::now())
            .unwrap();
        assert_eq!(generation.status(), GenerationStatus::Cancelled);
    }

    // -----------------------------------------------------------------------
    // Transcript
    // -----------------------------------------------------------------------

    #[test]
    fn transcript_appends_only_while_running() {
        let mut generation = fresh()
            .into_queued(Utc::now())
            .unwrap()
            .into_running(Utc::now())
            .unwrap();
        generation
            .push_transcript(TranscriptChunk {
                text: "partial".to_string(),
                at: Utc::now(),
            })
            .unwrap();
        match &generation {
            Generation::Running { transcript, .. } => assert_eq!(transcript.len(), 1),
            _ => panic!("expected running"),
        }

        let mut queued = fresh().into_queued(Utc::now()).unwrap();
        assert!(
            queued
                .push_transcript(TranscriptChunk {
                    text: "x".to_string(),
                    at: Utc::now(),
                })
                .is_err()
        );
    }

    // -----------------------------------------------------------------------
    // Serde
    // -----------------------------------------------------------------------

    #[test]
    fn generation_serializes_with_status_tag() {
        let generation = fresh();
        let json = serde_json::to_value(&generation).unwrap();
        assert_eq!(json["status"], "created");

        let roundtrip: Generation = serde_json::from_value(json).unwrap();
        assert_eq!(roundtrip.status(), GenerationStatus::Created);
    }

    #[test]
    fn output_tags_are_kebab_case() {
        let output = GenerationOutput::DataQueryResult {
            value: serde_json::json!({"rows": 3}),
        };
        let json = serde_json::to_string(&output).unwrap();
        assert!(json.contains("\"type\":\"data-query-result\""));
    }

    #[test]
    fn failed_carries_structured_error() {
        let generation = fresh()
            .into_queued(Utc::now())
            .unwrap()
            .into_running(Utc::now())
            .unwrap()
            .into_failed(
                Utc::now(),
                GenerationError::new("ProviderError", "rate limited"),
            )
            .unwrap();
        match &generation {
            Generation::Failed { error, .. } => {
                assert_eq!(error.name, "ProviderError");
                assert!(!error.message.is_empty());
            }
            _ => panic!("expected failed"),
        }
    }
}
