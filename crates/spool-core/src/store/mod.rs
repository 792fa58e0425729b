//! Task record storage.
//!
//! # 実装
//! - **MemoryTaskStore**: bounded LRU + TTL, process-local

mod memory;

pub use memory::MemoryTaskStore;

use async_trait::async_trait;

use crate::domain::{CancelOutcome, TaskId, TaskRecord, TaskStatus, TaskUpdate};
use crate::observability::StoreStats;

/// What a worker should do with an item it just dequeued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pickup {
    /// The record is now Processing.
    Started,
    /// The record was already terminal (typically cancelled while queued).
    Skip(TaskStatus),
    /// The record was evicted. The callback still runs; its updates are dropped.
    Missing,
}

/// TaskStore は task record の唯一の保管場所
///
/// # Design
/// - Every method is atomic with respect to the others.
/// - Reads hand out clones; callers never hold a reference into the store.
/// - `get`, `update`, `cancel` and `begin_processing` count as accesses for
///   LRU purposes. `list` and `stats` do not.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a fresh Queued record and return its id. May evict the least
    /// recently used record to stay within capacity.
    async fn create(&self, name: &str, partition: &str) -> TaskId;

    /// Apply a partial update. `false` when the task is unknown or the status
    /// change was refused.
    async fn update(&self, task_id: &TaskId, update: TaskUpdate) -> bool;

    async fn get(&self, task_id: &TaskId) -> Option<TaskRecord>;

    /// Most recently used first, filtered, at most `limit` entries.
    async fn list(
        &self,
        partition: Option<&str>,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Vec<TaskRecord>;

    /// Mark a non-terminal record Cancelled. `None` when the task is unknown.
    async fn cancel(&self, task_id: &TaskId) -> Option<CancelOutcome>;

    /// Transition a dequeued task to Processing unless it is already terminal.
    async fn begin_processing(&self, task_id: &TaskId) -> Pickup;

    /// Drop finished records older than the TTL; returns how many were removed.
    async fn sweep_expired(&self) -> usize;

    async fn stats(&self) -> StoreStats;
}
