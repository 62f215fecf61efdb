//! Coalescing patch queue for task-document progress writes.
//!
//! An in-memory map keyed by task id holds pending patches. A periodic timer
//! (reference cadence 50ms) drains the map; per key, one read-modify-write
//! cycle applies all pending patches. Patch application is associative per
//! key, so batching across one or many flush cycles converges to the same
//! document. Batches for different keys drain concurrently; at most one
//! write is in flight per key, and patches arriving mid-flight merge into
//! the next batch instead of blocking the producer.
//!
//! Retry policy: a failed write is requeued at the front of its key's
//! pending list with an incremented retry counter. After `patch_retry_limit`
//! total attempts the batch is dropped with an error-severity diagnostic and
//! a `dropped_batches` counter increment -- an explicit, acknowledged
//! best-effort policy, not silent data loss.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use weft_types::config::EngineConfig;
use weft_types::error::StoreError;
use weft_types::patch::{apply_patches, Patch};

use crate::storage::{StorageBackend, TaskStore};

// ---------------------------------------------------------------------------
// PatchQueue
// ---------------------------------------------------------------------------

/// The sole writer of task-progress JSON.
///
/// Owns its drain timer; construct one per engine instance and call
/// [`PatchQueue::shutdown`] when done. Must be created inside a tokio
/// runtime.
pub struct PatchQueue<S: StorageBackend + 'static> {
    inner: Arc<Inner<S>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

struct Inner<S: StorageBackend> {
    store: TaskStore<S>,
    retry_limit: u32,
    pending: DashMap<Uuid, PendingBatch>,
    in_flight: DashMap<Uuid, ()>,
    dropped_batches: AtomicU64,
}

struct PendingBatch {
    workspace_id: Uuid,
    patches: Vec<Patch>,
    /// Failed write attempts so far for the front of this batch.
    retries: u32,
}

impl<S: StorageBackend + 'static> PatchQueue<S> {
    /// Create the queue and start its drain timer.
    pub fn new(store: TaskStore<S>, config: &EngineConfig) -> Self {
        let inner = Arc::new(Inner {
            store,
            retry_limit: config.patch_retry_limit.max(1),
            pending: DashMap::new(),
            in_flight: DashMap::new(),
            dropped_batches: AtomicU64::new(0),
        });

        let timer = {
            let inner = Arc::clone(&inner);
            let period = Duration::from_millis(config.flush_interval_ms.max(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    drain_cycle(&inner).await;
                }
            })
        };

        Self {
            inner,
            timer: Mutex::new(Some(timer)),
        }
    }

    /// Queue one patch against a task document. Never blocks on storage.
    pub fn enqueue(&self, workspace_id: Uuid, task_id: Uuid, patch: Patch) {
        self.inner
            .pending
            .entry(task_id)
            .or_insert_with(|| PendingBatch {
                workspace_id,
                patches: Vec::new(),
                retries: 0,
            })
            .patches
            .push(patch);
    }

    /// Queue several patches atomically with respect to batching: they land
    /// in the same pending list in order.
    pub fn enqueue_all(
        &self,
        workspace_id: Uuid,
        task_id: Uuid,
        patches: impl IntoIterator<Item = Patch>,
    ) {
        let mut entry = self
            .inner
            .pending
            .entry(task_id)
            .or_insert_with(|| PendingBatch {
                workspace_id,
                patches: Vec::new(),
                retries: 0,
            });
        entry.patches.extend(patches);
    }

    /// Drain synchronously: run drain cycles, busy-waiting while any key is
    /// mid-flight, until no pending work remains. Called at task completion
    /// and on shutdown.
    pub async fn flush(&self) {
        loop {
            drain_cycle(&self.inner).await;
            if self.inner.pending.is_empty() && self.inner.in_flight.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Stop the timer and flush remaining work.
    pub async fn shutdown(&self) {
        if let Some(timer) = self.timer.lock().expect("timer lock").take() {
            timer.abort();
        }
        self.flush().await;
    }

    /// Number of keys with pending (not yet in-flight) patches.
    pub fn pending_keys(&self) -> usize {
        self.inner.pending.len()
    }

    /// Batches dropped after retry exhaustion since construction.
    pub fn dropped_batches(&self) -> u64 {
        self.inner.dropped_batches.load(Ordering::Relaxed)
    }
}

impl<S: StorageBackend + 'static> Drop for PatchQueue<S> {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.timer.lock() {
            if let Some(timer) = guard.take() {
                timer.abort();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Drain machinery
// ---------------------------------------------------------------------------

/// One drain cycle: take every key's pending batch and write them all,
/// concurrently across keys, sequentially per key.
async fn drain_cycle<S: StorageBackend + 'static>(inner: &Arc<Inner<S>>) {
    let keys: Vec<Uuid> = inner.pending.iter().map(|entry| *entry.key()).collect();
    if keys.is_empty() {
        return;
    }

    let mut writes = JoinSet::new();
    for task_id in keys {
        // One write in flight per key; losers pick the key up next cycle.
        if inner.in_flight.insert(task_id, ()).is_some() {
            continue;
        }
        let Some((_, batch)) = inner.pending.remove(&task_id) else {
            inner.in_flight.remove(&task_id);
            continue;
        };
        let inner = Arc::clone(inner);
        writes.spawn(async move {
            inner.write_batch(task_id, batch).await;
            inner.in_flight.remove(&task_id);
        });
    }
    while writes.join_next().await.is_some() {}
}

impl<S: StorageBackend + 'static> Inner<S> {
    /// Apply a batch through one read-modify-write cycle, requeueing on
    /// failure until the retry budget is spent.
    async fn write_batch(&self, task_id: Uuid, batch: PendingBatch) {
        match self.try_write(task_id, &batch).await {
            Ok(()) => {
                tracing::debug!(
                    task_id = %task_id,
                    patches = batch.patches.len(),
                    "patch batch applied"
                );
            }
            Err(error) => {
                let attempts = batch.retries + 1;
                if attempts >= self.retry_limit {
                    self.dropped_batches.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        task_id = %task_id,
                        patches = batch.patches.len(),
                        attempts,
                        %error,
                        "patch batch dropped after retry exhaustion"
                    );
                    return;
                }

                tracing::warn!(
                    task_id = %task_id,
                    attempts,
                    %error,
                    "patch batch write failed; requeueing"
                );
                // Requeue at the front so original ordering is preserved
                // ahead of patches that arrived mid-flight.
                use dashmap::mapref::entry::Entry;
                match self.pending.entry(task_id) {
                    Entry::Occupied(mut occupied) => {
                        let merged = occupied.get_mut();
                        let newer = std::mem::take(&mut merged.patches);
                        merged.patches = batch.patches;
                        merged.patches.extend(newer);
                        merged.retries = attempts;
                    }
                    Entry::Vacant(vacant) => {
                        vacant.insert(PendingBatch {
                            workspace_id: batch.workspace_id,
                            patches: batch.patches,
                            retries: attempts,
                        });
                    }
                }
            }
        }
    }

    async fn try_write(&self, task_id: Uuid, batch: &PendingBatch) -> Result<(), StoreError> {
        let mut document = self
            .store
            .get_task_json(batch.workspace_id, task_id)
            .await?
            .ok_or(StoreError::NotFound)?;
        apply_patches(&mut document, &batch.patches);
        self.store
            .set_task_json(batch.workspace_id, task_id, &document)
            .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemBackend;
    use serde_json::json;

    fn quick_config() -> EngineConfig {
        EngineConfig {
            flush_interval_ms: 5,
            poll_interval_ms: 10,
            patch_retry_limit: 3,
        }
    }

    async fn store_with_task(task_id: Uuid, workspace_id: Uuid) -> TaskStore<MemBackend> {
        let store = TaskStore::new(MemBackend::new());
        store
            .set_task_json(
                workspace_id,
                task_id,
                &json!({ "steps": { "completed": 0 }, "status": "created" }),
            )
            .await
            .unwrap();
        store
    }

    // -----------------------------------------------------------------------
    // Coalescing
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn two_increments_one_flush() {
        let workspace_id = Uuid::now_v7();
        let task_id = Uuid::now_v7();
        let store = store_with_task(task_id, workspace_id).await;
        let queue = PatchQueue::new(store.clone(), &quick_config());

        queue.enqueue(workspace_id, task_id, Patch::increment("steps.completed", 1));
        queue.enqueue(workspace_id, task_id, Patch::increment("steps.completed", 1));
        queue.flush().await;

        let doc = store.get_task_json(workspace_id, task_id).await.unwrap().unwrap();
        assert_eq!(doc["steps"]["completed"], 2);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn two_increments_two_flush_cycles() {
        let workspace_id = Uuid::now_v7();
        let task_id = Uuid::now_v7();
        let store = store_with_task(task_id, workspace_id).await;
        let queue = PatchQueue::new(store.clone(), &quick_config());

        queue.enqueue(workspace_id, task_id, Patch::increment("steps.completed", 1));
        queue.flush().await;
        queue.enqueue(workspace_id, task_id, Patch::increment("steps.completed", 1));
        queue.flush().await;

        let doc = store.get_task_json(workspace_id, task_id).await.unwrap().unwrap();
        assert_eq!(doc["steps"]["completed"], 2);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn timer_drains_without_explicit_flush() {
        let workspace_id = Uuid::now_v7();
        let task_id = Uuid::now_v7();
        let store = store_with_task(task_id, workspace_id).await;
        let queue = PatchQueue::new(store.clone(), &quick_config());

        queue.enqueue(workspace_id, task_id, Patch::set("status", "inProgress"));

        // Give the 5ms timer a few cycles.
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let doc = store.get_task_json(workspace_id, task_id).await.unwrap().unwrap();
            if doc["status"] == "inProgress" {
                queue.shutdown().await;
                return;
            }
        }
        panic!("timer never drained the queue");
    }

    #[tokio::test]
    async fn batches_for_different_keys_apply_independently() {
        let workspace_id = Uuid::now_v7();
        let task_a = Uuid::now_v7();
        let task_b = Uuid::now_v7();
        let store = store_with_task(task_a, workspace_id).await;
        store
            .set_task_json(workspace_id, task_b, &json!({ "steps": { "completed": 0 } }))
            .await
            .unwrap();
        let queue = PatchQueue::new(store.clone(), &quick_config());

        queue.enqueue(workspace_id, task_a, Patch::increment("steps.completed", 1));
        queue.enqueue(workspace_id, task_b, Patch::increment("steps.completed", 5));
        queue.flush().await;

        let a = store.get_task_json(workspace_id, task_a).await.unwrap().unwrap();
        let b = store.get_task_json(workspace_id, task_b).await.unwrap().unwrap();
        assert_eq!(a["steps"]["completed"], 1);
        assert_eq!(b["steps"]["completed"], 5);
        queue.shutdown().await;
    }

    // -----------------------------------------------------------------------
    // Retry and drop
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn transient_failure_retries_and_succeeds() {
        let workspace_id = Uuid::now_v7();
        let task_id = Uuid::now_v7();
        let store = store_with_task(task_id, workspace_id).await;
        store.backend().fail_next_writes(2);
        let queue = PatchQueue::new(store.clone(), &quick_config());

        queue.enqueue(workspace_id, task_id, Patch::increment("steps.completed", 1));
        queue.flush().await;

        let doc = store.get_task_json(workspace_id, task_id).await.unwrap().unwrap();
        assert_eq!(doc["steps"]["completed"], 1);
        assert_eq!(queue.dropped_batches(), 0);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn retry_exhaustion_drops_batch_and_counts() {
        let workspace_id = Uuid::now_v7();
        let task_id = Uuid::now_v7();
        let store = store_with_task(task_id, workspace_id).await;
        store.backend().fail_next_writes(10);
        let queue = PatchQueue::new(store.clone(), &quick_config());

        queue.enqueue(workspace_id, task_id, Patch::increment("steps.completed", 1));
        queue.flush().await;

        assert_eq!(queue.dropped_batches(), 1);
        let doc = store.get_task_json(workspace_id, task_id).await.unwrap().unwrap();
        // Acknowledged divergence: the increment is gone.
        assert_eq!(doc["steps"]["completed"], 0);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn mid_flight_patches_merge_into_next_batch() {
        let workspace_id = Uuid::now_v7();
        let task_id = Uuid::now_v7();
        let store = store_with_task(task_id, workspace_id).await;
        // First write fails, forcing a requeue; a patch enqueued before the
        // retry must land behind the requeued front.
        store.backend().fail_next_writes(1);
        let queue = PatchQueue::new(store.clone(), &quick_config());

        queue.enqueue(workspace_id, task_id, Patch::set("status", "inProgress"));
        // Enqueue more while the first batch may be mid-retry.
        queue.enqueue(workspace_id, task_id, Patch::set("status", "completed"));
        queue.flush().await;

        let doc = store.get_task_json(workspace_id, task_id).await.unwrap().unwrap();
        // Front-requeue keeps order: inProgress then completed.
        assert_eq!(doc["status"], "completed");
        assert_eq!(queue.dropped_batches(), 0);
        queue.shutdown().await;
    }
}
