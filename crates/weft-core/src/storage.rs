//! Storage port and the typed task store facade.
//!
//! `StorageBackend` is the only durability capability the engine assumes: an
//! at-least-once JSON/blob key-value store with no cross-key transactions.
//! Implementations live in weft-infra. `TaskStore` layers the engine's key
//! layout and typed serialization on top of a backend.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use chrono::{DateTime, Utc};
use weft_types::error::StoreError;
use weft_types::generation::Generation;
use weft_types::task::Task;

// ---------------------------------------------------------------------------
// StorageBackend port
// ---------------------------------------------------------------------------

/// Trait for durable JSON/blob key-value storage.
///
/// Uses RPITIT (native async fn in traits, Rust 2024 edition).
/// Implementations live in weft-infra.
pub trait StorageBackend: Send + Sync {
    /// Get a JSON document by key. Returns None if the key does not exist.
    fn get_json(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<Value>, StoreError>> + Send;

    /// Set a JSON document (upsert).
    fn set_json(
        &self,
        key: &str,
        value: &Value,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Whether a key exists.
    fn exists(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<bool, StoreError>> + Send;

    /// Get raw blob bytes by key. Returns None if the key does not exist.
    fn get_blob(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<Vec<u8>>, StoreError>> + Send;

    /// Set raw blob bytes (upsert).
    fn set_blob(
        &self,
        key: &str,
        bytes: &[u8],
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Delete a key. No-op if the key does not exist.
    fn delete(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;
}

// ---------------------------------------------------------------------------
// Key layout
// ---------------------------------------------------------------------------

/// Key for a task document.
pub fn task_key(workspace_id: Uuid, task_id: Uuid) -> String {
    format!("workspaces/{workspace_id}/tasks/{task_id}.json")
}

/// Key for the per-workspace task index.
pub fn task_index_key(workspace_id: Uuid) -> String {
    format!("workspaces/{workspace_id}/tasks/index.json")
}

/// Key for a generation document.
pub fn generation_key(workspace_id: Uuid, generation_id: Uuid) -> String {
    format!("workspaces/{workspace_id}/generations/{generation_id}.json")
}

/// Key for a node's latest-completed-generation index entry.
pub fn node_index_key(workspace_id: Uuid, node_id: Uuid) -> String {
    format!("workspaces/{workspace_id}/nodes/{node_id}/latest-generation.json")
}

// ---------------------------------------------------------------------------
// Index entries
// ---------------------------------------------------------------------------

/// The latest completed generation recorded for a node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestGenerationEntry {
    pub generation_id: Uuid,
    pub completed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// TaskStore
// ---------------------------------------------------------------------------

/// Typed facade over a `StorageBackend` with the engine's key layout.
///
/// Cheap to clone; all clones share the same backend.
pub struct TaskStore<S: StorageBackend> {
    backend: Arc<S>,
}

impl<S: StorageBackend> Clone for TaskStore<S> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<S: StorageBackend> TaskStore<S> {
    pub fn new(backend: S) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    pub fn from_arc(backend: Arc<S>) -> Self {
        Self { backend }
    }

    /// Access the underlying backend (blob reads for file attachments).
    pub fn backend(&self) -> &S {
        &self.backend
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    pub async fn get_task(
        &self,
        workspace_id: Uuid,
        task_id: Uuid,
    ) -> Result<Option<Task>, StoreError> {
        match self.backend.get_json(&task_key(workspace_id, task_id)).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    pub async fn put_task(&self, task: &Task) -> Result<(), StoreError> {
        let value = serde_json::to_value(task)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.backend
            .set_json(&task_key(task.workspace_id, task.id), &value)
            .await
    }

    /// Raw task JSON, for the patch queue's read-modify-write cycle.
    pub async fn get_task_json(
        &self,
        workspace_id: Uuid,
        task_id: Uuid,
    ) -> Result<Option<Value>, StoreError> {
        self.backend.get_json(&task_key(workspace_id, task_id)).await
    }

    pub async fn set_task_json(
        &self,
        workspace_id: Uuid,
        task_id: Uuid,
        value: &Value,
    ) -> Result<(), StoreError> {
        self.backend
            .set_json(&task_key(workspace_id, task_id), value)
            .await
    }

    // -----------------------------------------------------------------------
    // Workspace task index
    // -----------------------------------------------------------------------

    /// All task ids recorded for a workspace, oldest first.
    pub async fn list_task_ids(&self, workspace_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        match self.backend.get_json(&task_index_key(workspace_id)).await? {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(Vec::new()),
        }
    }

    /// Append a task id to the workspace index.
    pub async fn append_task_index(
        &self,
        workspace_id: Uuid,
        task_id: Uuid,
    ) -> Result<(), StoreError> {
        let mut ids = self.list_task_ids(workspace_id).await?;
        if !ids.contains(&task_id) {
            ids.push(task_id);
        }
        let value = serde_json::to_value(&ids)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.backend
            .set_json(&task_index_key(workspace_id), &value)
            .await
    }

    // -----------------------------------------------------------------------
    // Generations
    // -----------------------------------------------------------------------

    pub async fn get_generation(
        &self,
        workspace_id: Uuid,
        generation_id: Uuid,
    ) -> Result<Option<Generation>, StoreError> {
        match self
            .backend
            .get_json(&generation_key(workspace_id, generation_id))
            .await?
        {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    pub async fn put_generation(&self, generation: &Generation) -> Result<(), StoreError> {
        let workspace_id = generation.context().origin.workspace_id;
        let value = serde_json::to_value(generation)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.backend
            .set_json(&generation_key(workspace_id, generation.id()), &value)
            .await
    }

    // -----------------------------------------------------------------------
    // Node generation index
    // -----------------------------------------------------------------------

    pub async fn get_latest_generation(
        &self,
        workspace_id: Uuid,
        node_id: Uuid,
    ) -> Result<Option<LatestGenerationEntry>, StoreError> {
        match self
            .backend
            .get_json(&node_index_key(workspace_id, node_id))
            .await?
        {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    pub async fn set_latest_generation(
        &self,
        workspace_id: Uuid,
        node_id: Uuid,
        entry: &LatestGenerationEntry,
    ) -> Result<(), StoreError> {
        let value = serde_json::to_value(entry)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.backend
            .set_json(&node_index_key(workspace_id, node_id), &value)
            .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
