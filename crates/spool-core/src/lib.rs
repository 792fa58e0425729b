//! spool-core
//!
//! Partitioned background task manager: named episodes are queued per
//! partition key, run by lazily scaled workers under a global concurrency
//! cap, and tracked in a bounded LRU + TTL status store.
//!
//! # モジュール構成
//! - **domain**: TaskId, TaskStatus, TaskRecord
//! - **ports**: Clock, IdGenerator
//! - **store**: TaskStore trait + MemoryTaskStore
//! - **limiter**: global concurrency limiter
//! - **queue**: partition FIFO + scale-up rule
//! - **runtime**: Process callback seam, TaskContext, timeout execution
//! - **worker**: worker loop and per-partition worker set
//! - **app**: TaskManager (lifecycle, submit / get / list / cancel / wait), janitor
//! - **config / error / observability**: settings, error types, stats + tracing setup

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod limiter;
pub mod observability;
pub mod ports;
pub mod queue;
pub mod runtime;
pub mod store;
pub mod worker;

pub use app::{Submission, TaskManager, TaskManagerBuilder, WaitOutcome};
pub use config::TaskConfig;
pub use domain::{CancelOutcome, TaskId, TaskRecord, TaskStatus, TaskUpdate};
pub use error::{ProcessError, SpoolError};
pub use runtime::{Process, TaskContext};
