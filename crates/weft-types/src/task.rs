//! Task aggregate types for Weft.
//!
//! A `Task` is one execution instance of a workspace subgraph. Its sequences
//! are dependency levels produced by the planner; each step inside a sequence
//! records the execution of one operation node and references exactly one
//! `Generation`.
//!
//! These structs serialize to camelCase because the serialized form *is* the
//! persisted task document: patch paths like `steps.completed` or
//! `status` address fields of this JSON shape directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Overall status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    Created,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

/// Status of a single sequence (dependency level).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SequenceStatus {
    Created,
    InProgress,
    Completed,
    Failed,
    /// Never reached because an earlier sequence failed.
    Skipped,
    Cancelled,
}

/// Status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepStatus {
    Created,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

// ---------------------------------------------------------------------------
// Origin / starter
// ---------------------------------------------------------------------------

/// Where a run was initiated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OriginKind {
    Studio,
    Api,
    Stage,
    GithubApp,
}

/// How a task was triggered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStarter {
    pub origin: OriginKind,
    /// The trigger or app-entry node the run entered through, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_node_id: Option<Uuid>,
}

// ---------------------------------------------------------------------------
// Usage
// ---------------------------------------------------------------------------

/// Token usage accumulated by a task, sequence, or step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Build a usage record from raw provider-reported counts.
    ///
    /// Providers occasionally report negative or fractional token counts;
    /// both components are clamped to non-negative integers. Returns the
    /// sanitized usage and whether anything was actually clamped.
    pub fn sanitize(input_tokens: f64, output_tokens: f64) -> (Self, bool) {
        let clamp = |raw: f64| -> (u64, bool) {
            if raw.is_nan() || raw < 0.0 {
                (0, true)
            } else {
                (raw.trunc() as u64, raw.fract() != 0.0)
            }
        };
        let (input, in_clamped) = clamp(input_tokens);
        let (output, out_clamped) = clamp(output_tokens);
        (
            Self {
                input_tokens: input,
                output_tokens: output,
            },
            in_clamped || out_clamped,
        )
    }

    /// Accumulate another usage record into this one.
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

// ---------------------------------------------------------------------------
// Step counts
// ---------------------------------------------------------------------------

/// Step-count summary kept on the task document.
///
/// Mutated exclusively through increment/decrement patches so that concurrent
/// steps never lose updates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepCounts {
    pub queued: u32,
    pub in_progress: u32,
    pub completed: u32,
    /// Completed, but with a non-fatal anomaly (e.g. empty provider output).
    pub warning: u32,
    pub failed: u32,
    pub cancelled: u32,
}

impl StepCounts {
    /// Total number of steps accounted for.
    pub fn total(&self) -> u32 {
        self.queued + self.in_progress + self.completed + self.warning + self.failed
            + self.cancelled
    }
}

// ---------------------------------------------------------------------------
// Step / Sequence / Task
// ---------------------------------------------------------------------------

/// One operation node's execution record within a sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// UUIDv7 step id.
    pub id: Uuid,
    /// Name of the operation node this step executes.
    pub name: String,
    /// The node this step executes.
    pub node_id: Uuid,
    pub status: StepStatus,
    /// The single generation backing this step. Immutable after creation.
    pub generation_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub usage: TokenUsage,
}

/// One dependency level: steps with no data dependency on each other.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sequence {
    /// UUIDv7 sequence id.
    pub id: Uuid,
    pub status: SequenceStatus,
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub usage: TokenUsage,
}

/// Aggregate root for one execution of a workspace subgraph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// UUIDv7 task id.
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub status: TaskStatus,
    pub starter: TaskStarter,
    /// Sequences in dependency order.
    pub sequences: Vec<Sequence>,
    /// Step-count summary across all sequences.
    pub steps: StepCounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub usage: TokenUsage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Free-form notes recorded during execution (clamped usage, drops).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<String>,
}

impl Task {
    /// Find a step anywhere in the task by its id.
    pub fn step(&self, step_id: Uuid) -> Option<&Step> {
        self.sequences
            .iter()
            .flat_map(|s| s.steps.iter())
            .find(|s| s.id == step_id)
    }

    /// Whether the task has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Usage sanitization
    // -----------------------------------------------------------------------

    #[test]
    fn sanitize_passes_clean_counts_through() {
        let (usage, clamped) = TokenUsage::sanitize(120.0, 48.0);
        assert_eq!(usage.input_tokens, 120);
        assert_eq!(usage.output_tokens, 48);
        assert!(!clamped);
    }

    #[test]
    fn sanitize_clamps_negative_to_zero() {
        let (usage, clamped) = TokenUsage::sanitize(-5.0, 10.0);
        assert_eq!(usage.input_tokens, 0);
        assert_eq!(usage.output_tokens, 10);
        assert!(clamped);
    }

    #[test]
    fn sanitize_truncates_fractional() {
        let (usage, clamped) = TokenUsage::sanitize(10.7, 3.2);
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 3);
        assert!(clamped);
    }

    #[test]
    fn sanitize_handles_nan() {
        let (usage, clamped) = TokenUsage::sanitize(f64::NAN, 1.0);
        assert_eq!(usage.input_tokens, 0);
        assert!(clamped);
    }

    #[test]
    fn usage_accumulates() {
        let mut total = TokenUsage::default();
        total.add(&TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
        });
        total.add(&TokenUsage {
            input_tokens: 1,
            output_tokens: 2,
        });
        assert_eq!(total.input_tokens, 11);
        assert_eq!(total.output_tokens, 7);
    }

    // -----------------------------------------------------------------------
    // Serde wire shape
    // -----------------------------------------------------------------------

    #[test]
    fn step_counts_serialize_camel_case() {
        let counts = StepCounts {
            in_progress: 2,
            completed: 1,
            ..Default::default()
        };
        let json = serde_json::to_value(&counts).unwrap();
        assert_eq!(json["inProgress"], 2);
        assert_eq!(json["completed"], 1);
        assert!(json.get("in_progress").is_none());
    }

    #[test]
    fn task_status_values_are_camel_case() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::InProgress).unwrap(),
            "\"inProgress\""
        );
        assert_eq!(
            serde_json::to_string(&SequenceStatus::Skipped).unwrap(),
            "\"skipped\""
        );
    }

    #[test]
    fn origin_kind_is_kebab_case() {
        assert_eq!(
            serde_json::to_string(&OriginKind::GithubApp).unwrap(),
            "\"github-app\""
        );
    }

    #[test]
    fn step_counts_total() {
        let counts = StepCounts {
            queued: 1,
            in_progress: 2,
            completed: 3,
            warning: 1,
            failed: 1,
            cancelled: 0,
        };
        assert_eq!(counts.total(), 8);
    }

    #[test]
    fn task_step_lookup() {
        let step = Step {
            id: Uuid::now_v7(),
            name: "generate".to_string(),
            node_id: Uuid::now_v7(),
            status: StepStatus::Created,
            generation_id: Uuid::now_v7(),
            duration_ms: None,
            usage: TokenUsage::default(),
        };
        let task = Task {
            id: Uuid::now_v7(),
            workspace_id: Uuid::now_v7(),
            status: TaskStatus::Created,
            starter: TaskStarter {
                origin: OriginKind::Studio,
                entry_node_id: None,
            },
            sequences: vec![Sequence {
                id: Uuid::now_v7(),
                status: SequenceStatus::Created,
                steps: vec![step.clone()],
                duration_ms: None,
                usage: TokenUsage::default(),
            }],
            steps: StepCounts::default(),
            duration_ms: None,
            usage: TokenUsage::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            annotations: vec![],
        };
        assert_eq!(task.step(step.id).unwrap().name, "generate");
        assert!(task.step(Uuid::now_v7()).is_none());
        assert!(!task.is_terminal());
    }
}
