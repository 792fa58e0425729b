//! In-memory task store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::{Pickup, TaskStore};
use crate::domain::{CancelOutcome, TaskId, TaskRecord, TaskStatus, TaskUpdate};
use crate::observability::{StatusCounts, StoreStats};
use crate::ports::{Clock, IdGenerator, SystemClock, UlidGenerator};

struct Entry {
    record: TaskRecord,
    /// Position in `recency`. Larger is more recent.
    tick: u64,
}

/// Store state.
///
/// `recency` mirrors `entries` exactly: one tick per record, so the first key
/// is always the least recently used task.
struct StoreState {
    entries: HashMap<TaskId, Entry>,
    recency: BTreeMap<u64, TaskId>,
    next_tick: u64,
}

impl StoreState {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            next_tick: 0,
        }
    }

    fn bump(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    fn insert(&mut self, record: TaskRecord) {
        let tick = self.bump();
        let task_id = record.task_id;
        self.recency.insert(tick, task_id);
        self.entries.insert(task_id, Entry { record, tick });
    }

    /// Mark as most recently used and return the live record.
    fn touch(&mut self, task_id: &TaskId) -> Option<&mut TaskRecord> {
        let tick = self.next_tick;
        let entry = self.entries.get_mut(task_id)?;
        self.recency.remove(&entry.tick);
        self.recency.insert(tick, *task_id);
        entry.tick = tick;
        self.next_tick += 1;
        Some(&mut entry.record)
    }

    fn remove(&mut self, task_id: &TaskId) -> Option<TaskRecord> {
        let entry = self.entries.remove(task_id)?;
        self.recency.remove(&entry.tick);
        Some(entry.record)
    }

    fn evict_overflow(&mut self, max_size: usize) {
        while self.entries.len() > max_size {
            let Some((_, task_id)) = self.recency.pop_first() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&task_id) {
                debug!(
                    task_id = %task_id,
                    status = %entry.record.status,
                    "evicted least recently used task record"
                );
            }
        }
    }
}

/// MemoryTaskStore は容量上限付きの LRU ストア
///
/// - Capacity: inserting past `max_size` evicts the least recently used
///   record, whatever its status.
/// - TTL: Completed/Failed records older than `ttl` are removed by
///   [`TaskStore::sweep_expired`]. Queued, Processing and Cancelled records
///   only leave through LRU eviction.
pub struct MemoryTaskStore {
    state: Mutex<StoreState>,
    max_size: usize,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl MemoryTaskStore {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self::with_clock(max_size, ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(max_size: usize, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let ids = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        Self::with_id_generator(max_size, ttl, clock, ids)
    }

    pub fn with_id_generator(
        max_size: usize,
        ttl: Duration,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            state: Mutex::new(StoreState::new()),
            max_size: max_size.max(1),
            ttl,
            clock,
            ids,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create(&self, name: &str, partition: &str) -> TaskId {
        let task_id = self.ids.generate_task_id();
        let record = TaskRecord::new(task_id, name, partition, self.clock.now());

        let mut state = self.state.lock().await;
        state.insert(record);
        state.evict_overflow(self.max_size);
        task_id
    }

    async fn update(&self, task_id: &TaskId, update: TaskUpdate) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let Some(record) = state.touch(task_id) else {
            return false;
        };
        let requested = update.status;
        let accepted = record.apply(update, now);
        if !accepted {
            debug!(
                task_id = %task_id,
                current = %record.status,
                requested = ?requested,
                "refused status change on terminal task"
            );
        }
        accepted
    }

    async fn get(&self, task_id: &TaskId) -> Option<TaskRecord> {
        let mut state = self.state.lock().await;
        state.touch(task_id).map(|record| record.clone())
    }

    async fn list(
        &self,
        partition: Option<&str>,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Vec<TaskRecord> {
        let state = self.state.lock().await;
        state
            .recency
            .values()
            .rev()
            .filter_map(|task_id| state.entries.get(task_id))
            .map(|entry| &entry.record)
            .filter(|record| partition.is_none_or(|p| record.partition == p))
            .filter(|record| status.is_none_or(|s| record.status == s))
            .take(limit)
            .cloned()
            .collect()
    }

    async fn cancel(&self, task_id: &TaskId) -> Option<CancelOutcome> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let record = state.touch(task_id)?;

        if record.is_terminal() {
            return Some(CancelOutcome::AlreadyFinished {
                task_id: *task_id,
                status: record.status,
            });
        }

        let previous = record.status;
        record.apply(TaskUpdate::new().status(TaskStatus::Cancelled), now);
        Some(CancelOutcome::Cancelled {
            task_id: *task_id,
            previous,
            partition: record.partition.clone(),
        })
    }

    async fn begin_processing(&self, task_id: &TaskId) -> Pickup {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let Some(record) = state.touch(task_id) else {
            return Pickup::Missing;
        };
        if record.is_terminal() {
            return Pickup::Skip(record.status);
        }
        record.apply(TaskUpdate::processing(), now);
        Pickup::Started
    }

    async fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let expired: Vec<TaskId> = state
            .entries
            .values()
            .filter(|entry| entry.record.is_expired(now, self.ttl))
            .map(|entry| entry.record.task_id)
            .collect();

        for task_id in &expired {
            state.remove(task_id);
        }
        expired.len()
    }

    async fn stats(&self) -> StoreStats {
        let state = self.state.lock().await;
        let mut counts = StatusCounts::default();
        for entry in state.entries.values() {
            counts.record(entry.record.status);
        }
        StoreStats {
            total: state.entries.len(),
            max_size: self.max_size,
            ttl_secs: self.ttl.as_secs(),
            counts,
        }
    }
}
