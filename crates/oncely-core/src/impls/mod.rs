//! Impls - 実装（開発用・テスト用）
//!
//! このモジュールには ports の実装を含めます。
//!
//! # 含まれる実装
//! - **InMemoryRecordStore**: 1 プロセス内の正本（1 行アトミック）
//! - **InMemoryWorkQueue**: visibility timeout 付きの配送キュー
//!
//! # 本番用実装
//! 条件付き書き込み（一意制約 + compare-and-swap）ができる store なら何でも
//! RecordStore を実装できます。別クレートに配置する想定です。

pub mod inmem_queue;
pub mod inmem_store;

// 主要な型を再エクスポート
pub use self::inmem_queue::InMemoryWorkQueue;
pub use self::inmem_store::{CreateFault, InMemoryRecordStore};
