use std::time::Duration;

use thiserror::Error;

use crate::domain::{ParseStatusError, TaskId};

/// Errors surfaced synchronously to callers of the task manager.
///
/// Per-task failures never show up here; they are recorded on the task.
#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("task '{0}' not found")]
    NotFound(TaskId),

    #[error("limit must be between 1 and {max}, got {limit}")]
    InvalidLimit { limit: usize, max: usize },

    #[error("timeout must be between 1 and {max_secs} seconds, got {timeout:?}")]
    InvalidTimeout { timeout: Duration, max_secs: u64 },

    #[error(transparent)]
    InvalidStatus(#[from] ParseStatusError),

    #[error("timed out waiting for task '{task_id}' after {timeout:?}")]
    WaitTimeout { task_id: TaskId, timeout: Duration },

    #[error("task manager is shut down")]
    ShutDown,
}

impl SpoolError {
    /// Caller mistakes, rejected before any shared state is touched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SpoolError::InvalidLimit { .. }
                | SpoolError::InvalidTimeout { .. }
                | SpoolError::InvalidStatus(_)
        )
    }
}

/// Why a processing callback did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    #[error("{0}")]
    Failed(String),

    #[error("processing timed out after {}s", .0.as_secs_f64())]
    TimedOut(Duration),

    #[error("processing panicked: {0}")]
    Panicked(String),

    #[error("interrupted by shutdown")]
    Interrupted,

    /// The callback saw the cancellation and declined the work. The record
    /// is left Cancelled.
    #[error("cancelled")]
    Cancelled,
}

impl ProcessError {
    pub fn failed(message: impl Into<String>) -> Self {
        ProcessError::Failed(message.into())
    }

    /// Keep only the message of an arbitrary error.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        ProcessError::Failed(err.to_string())
    }
}

impl From<String> for ProcessError {
    fn from(message: String) -> Self {
        ProcessError::Failed(message)
    }
}

impl From<&str> for ProcessError {
    fn from(message: &str) -> Self {
        ProcessError::Failed(message.to_string())
    }
}

/// Invalid configuration values. These are logged and replaced with defaults.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: &'static str, message: String },

    #[error("failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),
}
