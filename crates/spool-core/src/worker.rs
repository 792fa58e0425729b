use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::{TaskId, TaskStatus, TaskUpdate};
use crate::error::ProcessError;
use crate::limiter::ConcurrencyLimiter;
use crate::queue::{PartitionQueue, QueuedItem};
use crate::runtime::{self, Process, TaskContext};
use crate::store::{Pickup, TaskStore};

/// Shared services every worker needs.
#[derive(Clone)]
pub struct WorkerDeps {
    pub store: Arc<dyn TaskStore>,
    pub limiter: ConcurrencyLimiter,
    pub timeout: Duration,
}

/// How a single task run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The callback returned (or failed); the record has been updated.
    Finished(Result<(), ProcessError>),
    /// The record was already terminal at pickup, so the callback never ran.
    Skipped(TaskStatus),
    /// The limiter was closed while waiting for a slot.
    Refused,
}

/// Live workers of one partition.
///
/// - A worker's entry is removed by its own drop guard when the worker task
///   ends (normally or by abort), so `active()` never sees finished workers.
/// - `take_handles()` hands the join handles over for shutdown.
#[derive(Default)]
pub struct WorkerSet {
    slots: Arc<Mutex<WorkerSlots>>,
}

#[derive(Default)]
struct WorkerSlots {
    next_id: usize,
    handles: HashMap<usize, JoinHandle<()>>,
}

/// Removes the worker from its set on drop.
struct Membership {
    slots: Weak<Mutex<WorkerSlots>>,
    worker_id: usize,
}

impl Drop for Membership {
    fn drop(&mut self) {
        if let Some(slots) = self.slots.upgrade() {
            lock(&slots).handles.remove(&self.worker_id);
        }
    }
}

fn lock(slots: &Mutex<WorkerSlots>) -> MutexGuard<'_, WorkerSlots> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WorkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> usize {
        lock(&self.slots).handles.len()
    }

    /// Spawn one worker if `should_start(active)` agrees.
    ///
    /// The check and the registration happen under one lock, so concurrent
    /// callers cannot overshoot the cap. Returns the new worker's id.
    pub fn spawn_if<F, Fut>(
        &self,
        should_start: impl FnOnce(usize) -> bool,
        make: F,
    ) -> Option<usize>
    where
        F: FnOnce(usize) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slots = lock(&self.slots);
        if !should_start(slots.handles.len()) {
            return None;
        }

        let worker_id = slots.next_id;
        slots.next_id += 1;

        let membership = Membership {
            slots: Arc::downgrade(&self.slots),
            worker_id,
        };
        let work = make(worker_id);
        // The guard's removal waits on this lock, so it always runs after the insert.
        let handle = tokio::spawn(async move {
            let _membership = membership;
            work.await;
        });
        slots.handles.insert(worker_id, handle);
        Some(worker_id)
    }

    pub fn take_handles(&self) -> Vec<JoinHandle<()>> {
        lock(&self.slots).handles.drain().map(|(_, h)| h).collect()
    }
}

/// Resolves once shutdown is requested or the sender is gone.
pub async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// One worker: pop, run, repeat until shutdown.
///
/// An empty queue never ends the loop; the worker just waits.
pub async fn worker_loop(
    worker_id: usize,
    queue: Arc<PartitionQueue>,
    deps: WorkerDeps,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let partition = queue.key().to_string();
    debug!(partition = %partition, worker_id, "worker started");

    loop {
        let item = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown_rx) => break,
            item = queue.pop() => item,
        };

        let task_id = item.task_id;
        let finished = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown_rx) => false,
            _ = run_item(item, &deps, &partition, worker_id) => true,
        };
        queue.task_done();

        if !finished {
            // the callback (if any) was aborted along with the dropped future
            if was_started(deps.store.as_ref(), &task_id).await {
                let message = ProcessError::Interrupted.to_string();
                deps.store
                    .update(&task_id, TaskUpdate::failed(message))
                    .await;
                warn!(task_id = %task_id, partition = %partition, worker_id, "task interrupted by shutdown");
            } else {
                debug!(task_id = %task_id, partition = %partition, worker_id, "dropped task that never started");
            }
            break;
        }
    }

    debug!(partition = %partition, worker_id, "worker stopped");
}

/// Picked up (Processing began) and not yet finished.
async fn was_started(store: &dyn TaskStore, task_id: &TaskId) -> bool {
    store
        .get(task_id)
        .await
        .is_some_and(|record| record.started_at.is_some() && !record.status.is_finished())
}

async fn run_item(item: QueuedItem, deps: &WorkerDeps, partition: &str, worker_id: usize) {
    let QueuedItem { task_id, process } = item;
    match run_task(task_id, process, deps).await {
        RunOutcome::Finished(Ok(())) => {
            info!(task_id = %task_id, partition, worker_id, "task completed");
        }
        RunOutcome::Finished(Err(ProcessError::TimedOut(limit))) => {
            warn!(
                task_id = %task_id,
                partition,
                worker_id,
                timeout_secs = limit.as_secs(),
                "task timed out"
            );
        }
        RunOutcome::Finished(Err(ProcessError::Cancelled)) => {
            info!(task_id = %task_id, partition, worker_id, "task declined after cancellation");
        }
        RunOutcome::Finished(Err(err)) => {
            error!(task_id = %task_id, partition, worker_id, error = %err, "task failed");
        }
        RunOutcome::Skipped(status) => {
            debug!(task_id = %task_id, partition, worker_id, status = %status, "skipping task");
        }
        RunOutcome::Refused => {
            debug!(task_id = %task_id, partition, worker_id, "limiter closed before task started");
        }
    }
}

/// Run one task end to end: take a global slot, mark it Processing, execute
/// the callback under the timeout, and record the outcome.
///
/// The slot is held only for this task and is released on every path. A
/// callback that returns [`ProcessError::Cancelled`] for a cancelled record
/// leaves it Cancelled.
pub async fn run_task(task_id: TaskId, process: Box<dyn Process>, deps: &WorkerDeps) -> RunOutcome {
    let Some(_permit) = deps.limiter.acquire().await else {
        return RunOutcome::Refused;
    };

    match deps.store.begin_processing(&task_id).await {
        Pickup::Started => {}
        Pickup::Skip(status) => return RunOutcome::Skipped(status),
        Pickup::Missing => {
            debug!(task_id = %task_id, "record evicted before pickup; running anyway");
        }
    }

    let ctx = TaskContext::new(task_id, Arc::clone(&deps.store));
    let result = runtime::execute(process, ctx.clone(), deps.timeout).await;

    let update = match &result {
        Ok(()) => Some(TaskUpdate::completed().progress(100)),
        Err(ProcessError::Cancelled) if ctx.is_cancelled().await => None,
        Err(err) => Some(TaskUpdate::failed(err.to_string())),
    };
    if let Some(update) = update {
        deps.store.update(&task_id, update).await;
    }

    RunOutcome::Finished(result)
}
