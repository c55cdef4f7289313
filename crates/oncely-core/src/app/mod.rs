//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **Coordinator**: 同期経路（try_create → decide → execute → update_if_owner）
//! - **QueuedCoordinator**: 非同期経路（PENDING + enqueue、poll で結果取得）
//! - **WorkerGroup**: queue を drain する worker（lease→process→ack/release）
//! - **ExpiryReaper**: 期限切れ record の回収
//! - **AppBuilder**: 設定検証とワイヤリング

pub mod builder;
pub mod config;
pub mod coordinator;
pub mod queued;
pub mod reaper_loop;
pub mod status;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::builder::{App, AppBuilder, BuildError, RunningApp};
pub use self::config::{CoordinatorConfig, QueueConfig, ReaperConfig, WorkerConfig};
pub use self::coordinator::{Coordinator, Processed};
pub use self::queued::QueuedCoordinator;
pub use self::reaper_loop::{ExpiryReaper, ReapReport};
pub use self::status::{QueueCounts, RecordCounts, StatusSnapshot};
pub use self::worker_loop::{Disposition, Worker, WorkerGroup};
