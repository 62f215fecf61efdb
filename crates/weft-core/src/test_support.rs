//! In-memory storage backend for engine tests, with failure injection.

use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use serde_json::Value;

use weft_types::error::StoreError;

use crate::storage::StorageBackend;

/// DashMap-backed `StorageBackend`. `fail_next_writes(n)` makes the next `n`
/// JSON writes fail, for exercising the queues' retry paths.
#[derive(Debug, Default)]
pub(crate) struct MemBackend {
    documents: DashMap<String, Value>,
    blobs: DashMap<String, Vec<u8>>,
    failing_writes: AtomicU32,
}

impl MemBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current > 0).then(|| current - 1)
            })
            .is_ok()
    }

    pub(crate) fn insert_blob(&self, key: &str, bytes: Vec<u8>) {
        self.blobs.insert(key.to_string(), bytes);
    }
}

impl StorageBackend for MemBackend {
    async fn get_json(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.documents.get(key).map(|entry| entry.clone()))
    }

    async fn set_json(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        if self.take_injected_failure() {
            return Err(StoreError::Io("injected write failure".to_string()));
        }
        self.documents.insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.documents.contains_key(key) || self.blobs.contains_key(key))
    }

    async fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.blobs.get(key).map(|entry| entry.clone()))
    }

    async fn set_blob(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.blobs.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.documents.remove(key);
        self.blobs.remove(key);
        Ok(())
    }
}
