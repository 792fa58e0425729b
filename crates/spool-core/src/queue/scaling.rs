/// When to add a worker to a partition.
///
/// - No worker yet: start one.
/// - Otherwise start one more when the backlog exceeds
///   `backlog_factor * active`, up to `max_workers`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalePolicy {
    pub max_workers: usize,
    pub backlog_factor: usize,
}

impl ScalePolicy {
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
            backlog_factor: 2,
        }
    }

    pub fn should_start(&self, active: usize, backlog: usize) -> bool {
        if active >= self.max_workers {
            return false;
        }
        active == 0 || backlog > self.backlog_factor.saturating_mul(active)
    }
}

impl Default for ScalePolicy {
    fn default() -> Self {
        Self::new(5)
    }
}
