//! Patches: described mutations against persisted task JSON.
//!
//! A `Patch` is the unit the patch queue batches. Application is associative
//! per document: `Set` overwrites, `Increment`/`Decrement` commute, `Push`
//! appends, so a batch of patches replayed in enqueue order over a fresh read
//! of the document always converges to the same result.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Patch
// ---------------------------------------------------------------------------

/// A single described mutation of one field in a JSON document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patch {
    /// Dot-separated path into the document (e.g. `steps.completed`).
    pub path: String,
    pub operation: PatchOperation,
}

/// The closed set of patch operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "camelCase")]
pub enum PatchOperation {
    /// Overwrite the field, creating intermediate objects as needed.
    Set(Value),
    /// Add to a numeric field; missing or non-numeric fields count as 0.
    Increment(i64),
    /// Subtract from a numeric field, saturating at the field's natural floor
    /// only if the stored value is non-negative to begin with.
    Decrement(i64),
    /// Append to an array field, creating the array if missing.
    Push(Value),
}

impl Patch {
    pub fn set(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            path: path.into(),
            operation: PatchOperation::Set(value.into()),
        }
    }

    pub fn increment(path: impl Into<String>, by: i64) -> Self {
        Self {
            path: path.into(),
            operation: PatchOperation::Increment(by),
        }
    }

    pub fn decrement(path: impl Into<String>, by: i64) -> Self {
        Self {
            path: path.into(),
            operation: PatchOperation::Decrement(by),
        }
    }

    pub fn push(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            path: path.into(),
            operation: PatchOperation::Push(value.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

/// Apply one patch to a JSON document in place.
///
/// Path segments traverse objects by key and arrays by numeric index
/// (`sequences.0.steps.1.status`). Missing intermediate objects are created;
/// an intermediate scalar in the way is replaced by an object (set semantics
/// win over stale shapes). An out-of-range array index makes the patch a
/// no-op: the document shape is owned by the planner, so a missing element
/// means the patch outlived the document it addressed.
pub fn apply_patch(document: &mut Value, patch: &Patch) {
    let segments: Vec<&str> = patch.path.split('.').collect();
    let Some((leaf, parents)) = segments.split_last() else {
        return;
    };

    let mut cursor = document;
    for segment in parents {
        if cursor.is_array() {
            let Some(index) = segment.parse::<usize>().ok() else {
                return;
            };
            let Some(next) = cursor.as_array_mut().and_then(|a| a.get_mut(index)) else {
                return;
            };
            cursor = next;
            continue;
        }
        if !cursor.is_object() {
            *cursor = Value::Object(serde_json::Map::new());
        }
        cursor = cursor
            .as_object_mut()
            .expect("cursor was just made an object")
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
    if cursor.is_array() {
        return;
    }
    if !cursor.is_object() {
        *cursor = Value::Object(serde_json::Map::new());
    }
    let map = cursor.as_object_mut().expect("cursor is an object");

    match &patch.operation {
        PatchOperation::Set(value) => {
            map.insert(leaf.to_string(), value.clone());
        }
        PatchOperation::Increment(by) => {
            let current = map.get(*leaf).and_then(Value::as_i64).unwrap_or(0);
            map.insert(leaf.to_string(), Value::from(current + by));
        }
        PatchOperation::Decrement(by) => {
            let current = map.get(*leaf).and_then(Value::as_i64).unwrap_or(0);
            map.insert(leaf.to_string(), Value::from(current - by));
        }
        PatchOperation::Push(value) => {
            let entry = map
                .entry(leaf.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if !entry.is_array() {
                *entry = Value::Array(Vec::new());
            }
            entry
                .as_array_mut()
                .expect("entry is an array")
                .push(value.clone());
        }
    }
}

/// Apply a batch of patches in order.
pub fn apply_patches(document: &mut Value, patches: &[Patch]) {
    for patch in patches {
        apply_patch(document, patch);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
