//! In-memory FIFO queue for one partition.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::domain::TaskId;
use crate::runtime::Process;

/// A pending callback, tagged with the task it belongs to.
pub struct QueuedItem {
    pub task_id: TaskId,
    pub process: Box<dyn Process>,
}

impl QueuedItem {
    pub fn new(task_id: TaskId, process: Box<dyn Process>) -> Self {
        Self { task_id, process }
    }
}

impl fmt::Debug for QueuedItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedItem")
            .field("task_id", &self.task_id)
            .finish_non_exhaustive()
    }
}

struct QueueState {
    items: VecDeque<QueuedItem>,
    /// Pushed but not yet marked done: waiting items plus the ones workers hold.
    unfinished: usize,
}

/// PartitionQueue は partition ごとの FIFO
///
/// # Design
/// - The lock is only held for plain `VecDeque` operations, never across an
///   await, so a std `Mutex` is enough.
/// - `pop` waits on `available`; `wait_idle` waits on `idle`.
/// - Every popped item must be reported with [`PartitionQueue::task_done`].
pub struct PartitionQueue {
    key: String,
    state: Mutex<QueueState>,
    available: Notify,
    idle: Notify,
}

impl PartitionQueue {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                unfinished: 0,
            }),
            available: Notify::new(),
            idle: Notify::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item; returns the queue depth including it.
    pub fn push(&self, item: QueuedItem) -> usize {
        let depth = {
            let mut state = self.lock();
            state.items.push_back(item);
            state.unfinished += 1;
            state.items.len()
        };
        self.available.notify_one();
        depth
    }

    /// Wait until an item is available and take it.
    pub async fn pop(&self) -> QueuedItem {
        loop {
            let notified = self.available.notified();
            let mut notified = std::pin::pin!(notified);
            // register before checking so a push in between is not missed
            notified.as_mut().enable();

            if let Some(item) = self.lock().items.pop_front() {
                return item;
            }
            notified.await;
        }
    }

    pub fn try_pop(&self) -> Option<QueuedItem> {
        self.lock().items.pop_front()
    }

    /// Drop the waiting entry for `task_id`, if it has not been picked up yet.
    pub fn remove(&self, task_id: &TaskId) -> bool {
        let now_idle = {
            let mut state = self.lock();
            let Some(pos) = state.items.iter().position(|item| item.task_id == *task_id) else {
                return false;
            };
            state.items.remove(pos);
            state.unfinished = state.unfinished.saturating_sub(1);
            state.unfinished == 0
        };
        if now_idle {
            self.idle.notify_waiters();
        }
        true
    }

    /// Mark a popped item as finished.
    pub fn task_done(&self) {
        let now_idle = {
            let mut state = self.lock();
            state.unfinished = state.unfinished.saturating_sub(1);
            state.unfinished == 0
        };
        if now_idle {
            self.idle.notify_waiters();
        }
    }

    /// Drop every waiting item; returns how many were dropped.
    pub fn clear(&self) -> usize {
        let (dropped, now_idle) = {
            let mut state = self.lock();
            let dropped = state.items.len();
            state.items.clear();
            state.unfinished = state.unfinished.saturating_sub(dropped);
            (dropped, state.unfinished == 0)
        };
        if now_idle {
            self.idle.notify_waiters();
        }
        dropped
    }

    /// Resolves once every pushed item has been marked done.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            let mut notified = std::pin::pin!(notified);
            notified.as_mut().enable();

            if self.lock().unfinished == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Items waiting to be picked up.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn unfinished(&self) -> usize {
        self.lock().unfinished
    }
}

impl fmt::Debug for PartitionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("PartitionQueue")
            .field("key", &self.key)
            .field("backlog", &state.items.len())
            .field("unfinished", &state.unfinished)
            .finish()
    }
}
