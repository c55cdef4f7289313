//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」。外部システム（DB, メッセージキュー,
//! 時計, ID 採番）へのインターフェースで、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - RecordStore が source of truth（正本）
//! - WorkQueue は配送だけ（at-least-once、正しさは store が担保）
//! - Clock / IdGenerator はテストで差し替える

pub mod clock;
pub mod id_generator;
pub mod record_store;
pub mod work_queue;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::record_store::{
    CreateResult, DeleteResult, RecordStore, StoreError, TransferResult, UpdateResult,
};
pub use self::work_queue::{QueueError, ReleaseOutcome, WorkQueue};
