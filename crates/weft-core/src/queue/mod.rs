//! Write-coalescing persistence queues.
//!
//! Many in-flight generations emit one patch per status transition; the
//! storage backend may not tolerate per-event writes. These queues batch
//! pending mutations per aggregate key and drain them on a timer, one
//! read-modify-write cycle per key:
//! - `patch_queue` -- task-document patches keyed by task id
//! - `generation_index` -- latest-completed-generation entries keyed by node
//!
//! Both are explicitly constructed objects owning their own timer and map;
//! there is no module-scoped singleton.

pub mod generation_index;
pub mod patch_queue;

pub use generation_index::GenerationIndexQueue;
pub use patch_queue::PatchQueue;
