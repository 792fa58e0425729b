//! TaskManagerBuilder - task manager の構築とワイヤリング
//!
//! 設定値の検証は build() で一度だけ行う。不正な値は default に置き換えて
//! warn を出す（起動は止めない）。

use std::sync::Arc;

use crate::app::TaskManager;
use crate::config::TaskConfig;
use crate::ports::{Clock, IdGenerator, SystemClock, UlidGenerator};
use crate::store::{MemoryTaskStore, TaskStore};

/// TaskManagerBuilder は TaskManager を構築
///
/// # 使用例
/// ```ignore
/// let manager = TaskManager::builder()
///     .config(TaskConfig::from_env())
///     .clock(Arc::new(SystemClock))
///     .build();
/// manager.start().await;
/// ```
#[derive(Default)]
pub struct TaskManagerBuilder {
    config: TaskConfig,
    clock: Option<Arc<dyn Clock>>,
    id_generator: Option<Arc<dyn IdGenerator>>,
    store: Option<Arc<dyn TaskStore>>,
}

impl TaskManagerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: TaskConfig) -> Self {
        self.config = config;
        self
    }

    /// Clock used for record timestamps and TTL checks.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, id_generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = Some(id_generator);
        self
    }

    /// Use a custom store. `store_max_size` and `store_ttl` are then the
    /// store's own business, and `clock` / `id_generator` are ignored.
    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> TaskManager {
        let config = self.config.validated();

        let store = match self.store {
            Some(store) => store,
            None => {
                let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
                let ids = self
                    .id_generator
                    .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));
                Arc::new(MemoryTaskStore::with_id_generator(
                    config.store_max_size,
                    config.store_ttl,
                    clock,
                    ids,
                ))
            }
        };

        TaskManager::from_parts(config, store)
    }
}
