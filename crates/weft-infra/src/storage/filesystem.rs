//! Local filesystem storage backend.
//!
//! Implements the `StorageBackend` trait from `weft-core` with documents and
//! blobs stored under a base directory, one file per key. Writes go to a
//! temporary sibling first and are renamed into place, so a crashed write
//! never leaves a half-written document behind.

use std::path::{Path, PathBuf};

use serde_json::Value;
use uuid::Uuid;

use weft_core::storage::StorageBackend;
use weft_types::error::StoreError;

/// Filesystem-backed JSON/blob store.
///
/// Key layout maps directly to paths: key `workspaces/{ws}/tasks/{id}.json`
/// lands at `{base_dir}/workspaces/{ws}/tasks/{id}.json`.
pub struct FsStore {
    base_dir: PathBuf,
}

impl FsStore {
    /// Create a store rooted at `base_dir`. The directory is created lazily
    /// on first write.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.base_dir.join(key)
    }

    /// Write bytes atomically: temp sibling + rename.
    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Io(e.to_string()))?;
        }
        let temp = path.with_extension(format!("tmp-{}", Uuid::now_v7()));
        tokio::fs::write(&temp, bytes)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        tokio::fs::rename(&temp, path)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    async fn read_optional(&self, path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(StoreError::Io(error.to_string())),
        }
    }
}

impl StorageBackend for FsStore {
    async fn get_json(&self, key: &str) -> Result<Option<Value>, StoreError> {
        match self.read_optional(&self.path_for(key)).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    async fn set_json(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.write_atomic(&self.path_for(key), &bytes).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        tokio::fs::try_exists(self.path_for(key))
            .await
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    async fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.read_optional(&self.path_for(key)).await
    }

    async fn set_blob(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.write_atomic(&self.path_for(key), bytes).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(StoreError::Io(error.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn json_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());

        let value = json!({ "status": "created", "steps": { "completed": 0 } });
        store.set_json("workspaces/w/tasks/t.json", &value).await.unwrap();

        let loaded = store.get_json("workspaces/w/tasks/t.json").await.unwrap();
        assert_eq!(loaded, Some(value));
        assert!(store.exists("workspaces/w/tasks/t.json").await.unwrap());
    }

    #[tokio::test]
    async fn missing_key_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        assert_eq!(store.get_json("nowhere.json").await.unwrap(), None);
        assert!(!store.exists("nowhere.json").await.unwrap());
    }

    #[tokio::test]
    async fn blob_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());

        store.set_blob("blobs/img.png", &[1, 2, 3]).await.unwrap();
        let loaded = store.get_blob("blobs/img.png").await.unwrap().unwrap();
        assert_eq!(loaded, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn overwrite_replaces_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());

        store.set_json("doc.json", &json!({"v": 1})).await.unwrap();
        store.set_json("doc.json", &json!({"v": 2})).await.unwrap();
        let loaded = store.get_json("doc.json").await.unwrap().unwrap();
        assert_eq!(loaded["v"], 2);
    }

    #[tokio::test]
    async fn no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        store.set_json("a/b/doc.json", &json!({})).await.unwrap();

        let mut entries = tokio::fs::read_dir(dir.path().join("a/b")).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["doc.json"]);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        store.set_json("doc.json", &json!({})).await.unwrap();
        store.delete("doc.json").await.unwrap();
        store.delete("doc.json").await.unwrap();
        assert!(!store.exists("doc.json").await.unwrap());
    }
}
