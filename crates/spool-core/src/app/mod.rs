//! App - アプリケーション層
//!
//! store / limiter / partition queues / janitor を組み合わせて task manager を作る。
//!
//! # 主要コンポーネント
//! - **TaskManager**: submit / get / list / cancel / wait の入口、lifecycle の所有者
//! - **TaskManagerBuilder**: 構築とワイヤリング
//! - **PartitionRegistry**: partition ごとの queue と worker
//! - **Janitor**: 期限切れ record の定期削除

pub mod builder;
pub mod janitor;
pub mod manager;
pub mod partitions;

// 主要な型を再エクスポート
pub use self::builder::TaskManagerBuilder;
pub use self::janitor::Janitor;
pub use self::manager::{
    MAX_LIST_LIMIT, MAX_WAIT_TIMEOUT, Submission, TaskManager, WAIT_POLL_INTERVAL, WaitOutcome,
};
pub use self::partitions::{Enqueued, PartitionRegistry};
