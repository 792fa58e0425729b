//! Task record: the tracked status of one submitted episode.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{TaskId, TaskStatus};

/// Status snapshot for one task.
///
/// Design:
/// - The store owns the live record; everything handed out is a clone.
/// - All mutations go through [`TaskRecord::apply`], so the timestamp rules
///   live in exactly one place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub name: String,
    pub partition: String,
    pub status: TaskStatus,

    /// 0..=100, reported by the processing callback.
    pub progress: u8,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl TaskRecord {
    pub fn new(
        task_id: TaskId,
        name: impl Into<String>,
        partition: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            name: name.into(),
            partition: partition.into(),
            status: TaskStatus::Queued,
            progress: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
            result: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Can the record move to `next`?
    ///
    /// Completed/Failed are final. Cancelled is final too, except that a task
    /// cancelled after it started may still be overwritten by its real outcome.
    pub fn accepts(&self, next: TaskStatus) -> bool {
        match self.status {
            TaskStatus::Completed | TaskStatus::Failed => false,
            TaskStatus::Cancelled => next.is_finished() && self.started_at.is_some(),
            TaskStatus::Queued | TaskStatus::Processing => true,
        }
    }

    /// Apply the supplied fields. Returns `false` when a requested status
    /// change was refused; the other fields are applied either way.
    pub fn apply(&mut self, update: TaskUpdate, now: DateTime<Utc>) -> bool {
        let mut accepted = true;

        if let Some(next) = update.status {
            if self.accepts(next) {
                self.status = next;
                match next {
                    TaskStatus::Processing if self.started_at.is_none() => {
                        self.started_at = Some(now);
                    }
                    TaskStatus::Completed | TaskStatus::Failed if self.completed_at.is_none() => {
                        self.completed_at = Some(now);
                    }
                    _ => {}
                }
            } else {
                accepted = false;
            }
        }

        if let Some(progress) = update.progress {
            self.progress = progress.clamp(0, 100) as u8;
        }
        if let Some(message) = update.error_message {
            self.error_message = Some(message);
        }
        if let Some(result) = update.result {
            self.result = Some(result);
        }

        self.updated_at = now;
        accepted
    }

    /// Finished longer than `ttl` ago. Cancelled records never expire.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        if !self.status.is_finished() {
            return false;
        }
        self.completed_at
            .and_then(|completed_at| (now - completed_at).to_std().ok())
            .is_some_and(|age| age > ttl)
    }
}

/// Partial update: only the fields that are `Some` are applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub progress: Option<i32>,
    pub error_message: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl TaskUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processing() -> Self {
        Self::new().status(TaskStatus::Processing)
    }

    pub fn completed() -> Self {
        Self::new().status(TaskStatus::Completed)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new()
            .status(TaskStatus::Failed)
            .error_message(message)
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn progress(mut self, progress: i32) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }
}

/// What a cancel request did to an existing record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The record is now Cancelled.
    Cancelled {
        task_id: TaskId,
        previous: TaskStatus,
        partition: String,
    },
    /// The record was already terminal and was left untouched.
    AlreadyFinished { task_id: TaskId, status: TaskStatus },
}

impl CancelOutcome {
    pub fn task_id(&self) -> TaskId {
        match self {
            CancelOutcome::Cancelled { task_id, .. }
            | CancelOutcome::AlreadyFinished { task_id, .. } => *task_id,
        }
    }

    pub fn message(&self) -> String {
        match self {
            CancelOutcome::Cancelled { task_id, .. } => format!("Task '{task_id}' cancelled"),
            CancelOutcome::AlreadyFinished { task_id, status } => {
                format!("Task '{task_id}' already {status}")
            }
        }
    }
}
