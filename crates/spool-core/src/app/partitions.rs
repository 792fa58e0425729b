//! PartitionRegistry - partition key ごとの queue + worker 集合
//!
//! Partitions are created lazily on first submission and live until
//! shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::debug;

use crate::domain::TaskId;
use crate::observability::PartitionSnapshot;
use crate::queue::{PartitionQueue, QueuedItem, ScalePolicy};
use crate::worker::{WorkerDeps, WorkerSet, worker_loop};

struct Partition {
    queue: Arc<PartitionQueue>,
    workers: WorkerSet,
}

/// Result of pushing one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    /// Queue depth right after the push. Informational only.
    pub queue_position: usize,
    pub active_workers: usize,
}

pub struct PartitionRegistry {
    partitions: Mutex<HashMap<String, Arc<Partition>>>,
    policy: ScalePolicy,
    deps: WorkerDeps,
    shutdown_rx: watch::Receiver<bool>,
}

impl PartitionRegistry {
    pub fn new(policy: ScalePolicy, deps: WorkerDeps, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            partitions: Mutex::new(HashMap::new()),
            policy,
            deps,
            shutdown_rx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Partition>>> {
        self.partitions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get(&self, key: &str) -> Option<Arc<Partition>> {
        self.lock().get(key).cloned()
    }

    fn get_or_create(&self, key: &str) -> Arc<Partition> {
        let mut partitions = self.lock();
        let partition = partitions.entry(key.to_string()).or_insert_with(|| {
            debug!(partition = key, "creating partition queue");
            Arc::new(Partition {
                queue: Arc::new(PartitionQueue::new(key)),
                workers: WorkerSet::new(),
            })
        });
        Arc::clone(partition)
    }

    /// Push an item, then apply the scale-up rule to the partition.
    pub fn enqueue(&self, key: &str, item: QueuedItem) -> Enqueued {
        let partition = self.get_or_create(key);
        let queue_position = partition.queue.push(item);
        let backlog = partition.queue.len();

        let started = partition.workers.spawn_if(
            |active| self.policy.should_start(active, backlog),
            |worker_id| {
                worker_loop(
                    worker_id,
                    Arc::clone(&partition.queue),
                    self.deps.clone(),
                    self.shutdown_rx.clone(),
                )
            },
        );
        let active_workers = partition.workers.active();
        if let Some(worker_id) = started {
            debug!(partition = key, worker_id, backlog, active_workers, "started worker");
        }

        Enqueued {
            queue_position,
            active_workers,
        }
    }

    /// Drop a task that is still waiting in its partition queue.
    pub fn remove_queued(&self, key: &str, task_id: &TaskId) -> bool {
        self.get(key)
            .is_some_and(|partition| partition.queue.remove(task_id))
    }

    pub fn snapshot(&self, key: &str) -> Option<PartitionSnapshot> {
        let partition = self.get(key)?;
        Some(PartitionSnapshot {
            partition: key.to_string(),
            backlog: partition.queue.len(),
            unfinished: partition.queue.unfinished(),
            active_workers: partition.workers.active(),
        })
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Wait until every item pushed to `key` is done. `false` for an
    /// unknown partition.
    pub async fn wait_idle(&self, key: &str) -> bool {
        let Some(partition) = self.get(key) else {
            return false;
        };
        partition.queue.wait_idle().await;
        true
    }

    /// Await every worker, then drop all queued items and partitions.
    ///
    /// The shutdown signal must already have been sent. Returns the number
    /// of workers that were awaited.
    pub async fn shutdown(&self) -> usize {
        let partitions: Vec<Arc<Partition>> = self.lock().values().cloned().collect();

        let mut stopped = 0;
        for partition in &partitions {
            for handle in partition.workers.take_handles() {
                let _ = handle.await;
                stopped += 1;
            }
        }
        for partition in &partitions {
            let dropped = partition.queue.clear();
            if dropped > 0 {
                debug!(partition = partition.queue.key(), dropped, "dropped queued items");
            }
        }
        self.lock().clear();
        stopped
    }
}
