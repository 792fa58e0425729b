use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::domain::{TaskId, TaskStatus, TaskUpdate};
use crate::error::ProcessError;
use crate::store::TaskStore;

/// The work behind one task.
///
/// Runs at most once, so it consumes itself. Any `FnOnce(TaskContext)`
/// returning a `Send` future implements this:
///
/// ```ignore
/// manager.submit_task("ep-1", "group-a", |ctx: TaskContext| async move {
///     ctx.report_progress(50).await;
///     Ok::<(), ProcessError>(())
/// }).await?;
/// ```
#[async_trait]
pub trait Process: Send + 'static {
    async fn process(self: Box<Self>, ctx: TaskContext) -> Result<(), ProcessError>;
}

#[async_trait]
impl<F, Fut> Process for F
where
    F: FnOnce(TaskContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), ProcessError>> + Send + 'static,
{
    async fn process(self: Box<Self>, ctx: TaskContext) -> Result<(), ProcessError> {
        (*self)(ctx).await
    }
}

/// Handle a running callback uses to report back to the store.
///
/// Updates on an evicted record are silently dropped.
#[derive(Clone)]
pub struct TaskContext {
    task_id: TaskId,
    store: Arc<dyn TaskStore>,
}

impl TaskContext {
    pub fn new(task_id: TaskId, store: Arc<dyn TaskStore>) -> Self {
        Self { task_id, store }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Percent complete, clamped to 0..=100.
    pub async fn report_progress(&self, progress: i32) -> bool {
        self.update(TaskUpdate::new().progress(progress)).await
    }

    pub async fn set_result(&self, result: serde_json::Value) -> bool {
        self.update(TaskUpdate::new().result(result)).await
    }

    pub async fn update(&self, update: TaskUpdate) -> bool {
        self.store.update(&self.task_id, update).await
    }

    /// Has someone asked for this task to be cancelled?
    ///
    /// Cancellation is cooperative; long callbacks should check this between
    /// steps and return early.
    pub async fn is_cancelled(&self) -> bool {
        self.store
            .get(&self.task_id)
            .await
            .is_some_and(|record| record.status == TaskStatus::Cancelled)
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.task_id)
            .finish_non_exhaustive()
    }
}

/// Aborts the spawned callback when the caller stops waiting for it.
struct AbortOnDrop(JoinHandle<Result<(), ProcessError>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run one callback under `timeout`.
///
/// The callback runs on its own tokio task so a panic is contained and
/// reported as [`ProcessError::Panicked`]. On timeout (or when this future
/// is dropped) the callback task is aborted.
pub async fn execute(
    process: Box<dyn Process>,
    ctx: TaskContext,
    timeout: Duration,
) -> Result<(), ProcessError> {
    let mut task = AbortOnDrop(tokio::spawn(process.process(ctx)));

    match tokio::time::timeout(timeout, &mut task.0).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) if join_err.is_panic() => {
            Err(ProcessError::Panicked(panic_message(join_err.into_panic())))
        }
        Ok(Err(_)) => Err(ProcessError::Interrupted),
        Err(_elapsed) => Err(ProcessError::TimedOut(timeout)),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
