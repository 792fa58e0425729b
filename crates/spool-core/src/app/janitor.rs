//! Janitor - 期限切れ task record の定期削除
//!
//! # フロー
//! 1. `interval` だけ sleep（shutdown と競合させる）
//! 2. TaskStore::sweep_expired() を呼ぶ
//! 3. 繰り返す

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::store::TaskStore;
use crate::worker::shutdown_requested;

/// Janitor は TTL を過ぎた Completed/Failed record を消す
pub struct Janitor {
    store: Arc<dyn TaskStore>,
    interval: Duration,
}

impl Janitor {
    pub fn new(store: Arc<dyn TaskStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    pub fn spawn(self, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown_rx))
    }

    /// Sleep, sweep, repeat.
    ///
    /// Shutdown is only observed while sleeping; a sweep that has started
    /// always runs to the end.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        debug!(interval_secs = self.interval.as_secs(), "janitor started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown_rx) => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            let removed = self.store.sweep_expired().await;
            if removed > 0 {
                info!(removed, "swept expired task records");
            }
        }
        debug!("janitor stopped");
    }
}
