//! Domain model: task ids, statuses and records.

pub mod ids;
pub mod record;
pub mod status;

pub use ids::{ParseTaskIdError, TaskId};
pub use record::{CancelOutcome, TaskRecord, TaskUpdate};
pub use status::{ParseStatusError, TaskStatus};
