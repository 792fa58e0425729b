//! TaskManager - 受付・照会・キャンセル・待機の入口
//!
//! # Lifecycle
//! - `new()`: 全部品を構築（spawn はしない）
//! - `start()`: janitor を起動。二回目以降は no-op
//! - `shutdown()`: janitor と全 worker を止めて待つ。二回目以降は no-op
//!
//! Workers are spawned lazily by `submit_task`, so submitting before
//! `start()` works; only the janitor waits for `start()`.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::app::janitor::Janitor;
use crate::app::partitions::PartitionRegistry;
use crate::app::TaskManagerBuilder;
use crate::config::TaskConfig;
use crate::domain::{CancelOutcome, TaskId, TaskRecord, TaskStatus, TaskUpdate};
use crate::error::{ProcessError, SpoolError};
use crate::limiter::ConcurrencyLimiter;
use crate::observability::{PartitionSnapshot, StoreStats};
use crate::queue::{QueuedItem, ScalePolicy};
use crate::runtime::Process;
use crate::store::TaskStore;
use crate::worker::{RunOutcome, WorkerDeps, run_task};

/// Largest page `list_tasks` will return.
pub const MAX_LIST_LIMIT: usize = 100;
/// Longest a caller may block in `wait_for_task`.
pub const MAX_WAIT_TIMEOUT: Duration = Duration::from_secs(300);
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Receipt for an accepted submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Submission {
    pub task_id: TaskId,
    /// Queue depth right after this submission. Not a reservation.
    pub queue_position: usize,
    pub active_workers: usize,
}

/// A finished record and how long the caller waited for it.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitOutcome {
    pub record: TaskRecord,
    pub waited: Duration,
}

enum Lifecycle {
    Idle,
    Running { janitor: JoinHandle<()> },
    Stopped,
}

/// TaskManager は store / limiter / partition / janitor を所有する
///
/// One instance per process is the intended use; share it behind an `Arc`.
pub struct TaskManager {
    config: TaskConfig,
    deps: WorkerDeps,
    partitions: PartitionRegistry,
    shutdown_tx: watch::Sender<bool>,
    lifecycle: Mutex<Lifecycle>,
}

impl TaskManager {
    /// Build with the default in-memory store. Invalid settings fall back to
    /// defaults.
    pub fn new(config: TaskConfig) -> Self {
        TaskManagerBuilder::new().config(config).build()
    }

    pub fn builder() -> TaskManagerBuilder {
        TaskManagerBuilder::new()
    }

    pub(crate) fn from_parts(config: TaskConfig, store: Arc<dyn TaskStore>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let deps = WorkerDeps {
            store,
            limiter: ConcurrencyLimiter::new(config.max_concurrent),
            timeout: config.processing_timeout,
        };
        let partitions = PartitionRegistry::new(
            ScalePolicy::new(config.max_workers_per_partition),
            deps.clone(),
            shutdown_rx,
        );

        Self {
            config,
            deps,
            partitions,
            shutdown_tx,
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.deps.store
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.deps.limiter
    }

    /// Start the janitor. Idempotent.
    pub async fn start(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Idle => {}
            Lifecycle::Running { .. } => {
                debug!("task manager already started");
                return;
            }
            Lifecycle::Stopped => {
                warn!("task manager was shut down and cannot be restarted");
                return;
            }
        }

        let janitor = Janitor::new(Arc::clone(&self.deps.store), self.config.cleanup_interval)
            .spawn(self.shutdown_tx.subscribe());
        *lifecycle = Lifecycle::Running { janitor };
        info!(
            max_concurrent = self.config.max_concurrent,
            max_workers_per_partition = self.config.max_workers_per_partition,
            store_max_size = self.config.store_max_size,
            "task manager started"
        );
    }

    /// Stop the janitor and every worker, await them, and drop all queued
    /// items. Idempotent.
    ///
    /// Callbacks still running are aborted and their records marked Failed.
    pub async fn shutdown(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let previous = std::mem::replace(&mut *lifecycle, Lifecycle::Stopped);
        if matches!(previous, Lifecycle::Stopped) {
            return;
        }

        let _ = self.shutdown_tx.send(true);
        self.deps.limiter.close();

        if let Lifecycle::Running { janitor } = previous {
            let _ = janitor.await;
        }
        let workers = self.partitions.shutdown().await;
        info!(workers, "task manager stopped");
    }

    pub async fn is_shut_down(&self) -> bool {
        matches!(*self.lifecycle.lock().await, Lifecycle::Stopped)
    }

    /// Record a new task and queue its callback on `partition`.
    pub async fn submit_task<P: Process>(
        &self,
        name: &str,
        partition: &str,
        process: P,
    ) -> Result<Submission, SpoolError> {
        // held so a concurrent shutdown cannot slip in between create and enqueue
        let lifecycle = self.lifecycle.lock().await;
        if matches!(*lifecycle, Lifecycle::Stopped) {
            return Err(SpoolError::ShutDown);
        }

        let task_id = self.deps.store.create(name, partition).await;
        let enqueued = self
            .partitions
            .enqueue(partition, QueuedItem::new(task_id, Box::new(process)));
        drop(lifecycle);

        info!(
            task_id = %task_id,
            name,
            partition,
            queue_position = enqueued.queue_position,
            active_workers = enqueued.active_workers,
            "task queued"
        );
        Ok(Submission {
            task_id,
            queue_position: enqueued.queue_position,
            active_workers: enqueued.active_workers,
        })
    }

    /// Record a task and run it right here, bypassing the partition queue.
    ///
    /// Still bounded by the global limiter and the processing timeout.
    /// Returns the final record. A shutdown that closes the limiter before a
    /// slot frees up fails the record as interrupted.
    pub async fn run_inline<P: Process>(
        &self,
        name: &str,
        partition: &str,
        process: P,
    ) -> Result<TaskRecord, SpoolError> {
        let lifecycle = self.lifecycle.lock().await;
        if matches!(*lifecycle, Lifecycle::Stopped) {
            return Err(SpoolError::ShutDown);
        }
        let task_id = self.deps.store.create(name, partition).await;
        drop(lifecycle);
        debug!(task_id = %task_id, name, partition, "running task inline");

        match run_task(task_id, Box::new(process), &self.deps).await {
            RunOutcome::Refused => {
                let message = ProcessError::Interrupted.to_string();
                self.deps
                    .store
                    .update(&task_id, TaskUpdate::failed(message))
                    .await;
                warn!(task_id = %task_id, partition, "inline task refused by shutdown");
                Err(SpoolError::ShutDown)
            }
            RunOutcome::Finished(_) | RunOutcome::Skipped(_) => self.get_task_status(&task_id).await,
        }
    }

    pub async fn get_task_status(&self, task_id: &TaskId) -> Result<TaskRecord, SpoolError> {
        self.deps
            .store
            .get(task_id)
            .await
            .ok_or(SpoolError::NotFound(*task_id))
    }

    /// Most recently used first.
    ///
    /// `status` is matched case-insensitively; `limit` must be in
    /// `1..=MAX_LIST_LIMIT`.
    pub async fn list_tasks(
        &self,
        partition: Option<&str>,
        status: Option<&str>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, SpoolError> {
        if limit == 0 || limit > MAX_LIST_LIMIT {
            return Err(SpoolError::InvalidLimit {
                limit,
                max: MAX_LIST_LIMIT,
            });
        }
        let status = status.map(str::parse::<TaskStatus>).transpose()?;

        Ok(self.deps.store.list(partition, status, limit).await)
    }

    /// Mark a task Cancelled and pull it from its queue if it has not been
    /// picked up yet.
    ///
    /// A task that already started keeps running; its outcome overwrites the
    /// cancellation. Cancelling a terminal task is not an error.
    pub async fn cancel_task(&self, task_id: &TaskId) -> Result<CancelOutcome, SpoolError> {
        let outcome = self
            .deps
            .store
            .cancel(task_id)
            .await
            .ok_or(SpoolError::NotFound(*task_id))?;

        if let CancelOutcome::Cancelled {
            previous: TaskStatus::Queued,
            partition,
            ..
        } = &outcome
        {
            let removed = self.partitions.remove_queued(partition, task_id);
            debug!(task_id = %task_id, partition = %partition, removed, "removed cancelled task from queue");
        }

        info!(task_id = %task_id, "{}", outcome.message());
        Ok(outcome)
    }

    /// Poll the record every [`WAIT_POLL_INTERVAL`] until it is terminal.
    ///
    /// `timeout` must be in `(0, MAX_WAIT_TIMEOUT]`. A record that disappears
    /// while waiting (evicted) is reported as not found.
    pub async fn wait_for_task(
        &self,
        task_id: &TaskId,
        timeout: Duration,
    ) -> Result<WaitOutcome, SpoolError> {
        if timeout.is_zero() || timeout > MAX_WAIT_TIMEOUT {
            return Err(SpoolError::InvalidTimeout {
                timeout,
                max_secs: MAX_WAIT_TIMEOUT.as_secs(),
            });
        }

        let started = Instant::now();
        loop {
            let record = self.get_task_status(task_id).await?;
            if record.is_terminal() {
                return Ok(WaitOutcome {
                    record,
                    waited: started.elapsed(),
                });
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(SpoolError::WaitTimeout {
                    task_id: *task_id,
                    timeout,
                });
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL.min(timeout - elapsed)).await;
        }
    }

    pub async fn stats(&self) -> StoreStats {
        self.deps.store.stats().await
    }

    pub fn partition_snapshot(&self, partition: &str) -> Option<PartitionSnapshot> {
        self.partitions.snapshot(partition)
    }

    pub fn partitions(&self) -> Vec<String> {
        self.partitions.keys()
    }

    /// Resolves once every task queued on `partition` so far is done.
    /// Returns immediately for an unknown partition.
    pub async fn wait_idle(&self, partition: &str) {
        self.partitions.wait_idle(partition).await;
    }
}
