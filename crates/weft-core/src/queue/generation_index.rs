//! Coalescing queue for the node generation index.
//!
//! Maintains each node's latest-completed-generation entry. Unlike task
//! patches, index mutations coalesce by overwrite: the newest completed
//! generation wins, so pending entries for the same node collapse to one.
//! Retry and drop policy match the patch queue.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use weft_types::config::EngineConfig;

use crate::storage::{LatestGenerationEntry, StorageBackend, TaskStore};

// ---------------------------------------------------------------------------
// GenerationIndexQueue
// ---------------------------------------------------------------------------

/// Coalesces latest-completed-generation index writes per (workspace, node).
pub struct GenerationIndexQueue<S: StorageBackend + 'static> {
    inner: Arc<Inner<S>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

struct Inner<S: StorageBackend> {
    store: TaskStore<S>,
    retry_limit: u32,
    pending: DashMap<(Uuid, Uuid), PendingEntry>,
    in_flight: DashMap<(Uuid, Uuid), ()>,
    dropped_entries: AtomicU64,
}

struct PendingEntry {
    entry: LatestGenerationEntry,
    retries: u32,
}

impl<S: StorageBackend + 'static> GenerationIndexQueue<S> {
    /// Create the queue and start its drain timer.
    pub fn new(store: TaskStore<S>, config: &EngineConfig) -> Self {
        let inner = Arc::new(Inner {
            store,
            retry_limit: config.patch_retry_limit.max(1),
            pending: DashMap::new(),
            in_flight: DashMap::new(),
            dropped_entries: AtomicU64::new(0),
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

    /// Record a completed generation for a node. The newest `completed_at`
    /// wins; stale records coalesce away without a write.
    pub fn record(&self, workspace_id: Uuid, node_id: Uuid, entry: LatestGenerationEntry) {
        self.inner
            .pending
            .entry((workspace_id, node_id))
            .and_modify(|pending| {
                if entry.completed_at >= pending.entry.completed_at {
                    pending.entry = entry;
                }
            })
            .or_insert(PendingEntry { entry, retries: 0 });
    }

    /// Drain synchronously, busy-waiting while any key is mid-flight.
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

    /// Index entries dropped after retry exhaustion since construction.
    pub fn dropped_entries(&self) -> u64 {
        self.inner.dropped_entries.load(Ordering::Relaxed)
    }
}

impl<S: StorageBackend + 'static> Drop for GenerationIndexQueue<S> {
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

async fn drain_cycle<S: StorageBackend + 'static>(inner: &Arc<Inner<S>>) {
    let keys: Vec<(Uuid, Uuid)> = inner.pending.iter().map(|entry| *entry.key()).collect();
    if keys.is_empty() {
        return;
    }

    let mut writes = JoinSet::new();
    for key in keys {
        if inner.in_flight.insert(key, ()).is_some() {
            continue;
        }
        let Some((_, pending)) = inner.pending.remove(&key) else {
            inner.in_flight.remove(&key);
            continue;
        };
        let inner = Arc::clone(inner);
        writes.spawn(async move {
            inner.write_entry(key, pending).await;
            inner.in_flight.remove(&key);
        });
    }
    while writes.join_next().await.is_some() {}
}

impl<S: StorageBackend + 'static> Inner<S> {
    async fn write_entry(&self, key: (Uuid, Uuid), pending: PendingEntry) {
        let (workspace_id, node_id) = key;
        match self
            .store
            .set_latest_generation(workspace_id, node_id, &pending.entry)
            .await
        {
            Ok(()) => {
                tracing::debug!(
                    node_id = %node_id,
                    generation_id = %pending.entry.generation_id,
                    "generation index updated"
                );
            }
            Err(error) => {
                let attempts = pending.retries + 1;
                if attempts >= self.retry_limit {
                    self.dropped_entries.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        node_id = %node_id,
                        attempts,
                        %error,
                        "generation index entry dropped after retry exhaustion"
                    );
                    return;
                }

                // A newer completion may have arrived mid-flight; keep the
                // freshest entry, but carry the retry count forward.
                self.pending
                    .entry(key)
                    .and_modify(|existing| {
                        if pending.entry.completed_at >= existing.entry.completed_at {
                            existing.entry = pending.entry;
                        }
                        existing.retries = attempts;
                    })
                    .or_insert(PendingEntry {
                        entry: pending.entry,
                        retries: attempts,
                    });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
