//! oncely-core
//!
//! Idempotent-request coordinator: a request submitted any number of times
//! under the same idempotency key runs once, and every caller sees the same
//! outcome.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（key, ids, record, state, outcome, decision, errors, retry, work_item）
//! - **ports**: 抽象化レイヤー（RecordStore, WorkQueue, Clock, IdGenerator）
//! - **app**: アプリケーションロジック（coordinator, queued, worker_loop, reaper_loop, builder）
//! - **typed**: 型付き Operation API（Request trait, Operation trait, JsonCodec）
//! - **impls**: 実装（InMemoryRecordStore, InMemoryWorkQueue）

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod typed;

pub use app::{App, AppBuilder, Coordinator, QueuedCoordinator};
pub use domain::{CoordinatorError, IdempotencyKey, Outcome, PollResult, SubmitReceipt};
pub use typed::{AttemptContext, Operation, Rejection, Request};
