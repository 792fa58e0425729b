//! Per-partition FIFO queues and the worker scale-up rule.

mod partition;
mod scaling;

pub use partition::{PartitionQueue, QueuedItem};
pub use scaling::ScalePolicy;
