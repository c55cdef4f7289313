//! RecordStore port - 冪等性レコードの正本（source of truth）
//!
//! Coordinator が使う唯一の同期プリミティブは、この port の条件付き書き込みです。
//! プロセス内ロックには頼らない（複数インスタンスで同じ store を共有するため）。
//!
//! # 実装
//! - **InMemoryRecordStore**: 開発・テスト用（`impls::inmem_store`）
//! - RDB 実装なら `try_create` は主キー重複で失敗する INSERT、
//!   `update_if_owner` / `transfer_ownership` は `WHERE owner_token = ?` 付き UPDATE。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    Completion, IdempotencyKey, IdempotencyRecord, OwnerToken, Ownership, RecordCounts,
    RecordState,
};

/// Store failures.
///
/// Unavailability is always retryable. An interrupted write may or may not
/// have landed, so callers resolve it by reading the record back.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("record store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt record for key={key}: {reason}")]
    Corrupt { key: IdempotencyKey, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateResult {
    Created,
    AlreadyExists(IdempotencyRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResult {
    Updated,
    /// The record is not PROCESSING under this owner any more.
    OwnerMismatch,
    NotFound,
}

/// Result of `transfer_ownership` and `requeue`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferResult {
    /// The record changed as asked; carries it as written.
    Acquired(IdempotencyRecord),
    /// Someone else changed the record first; carries what is there now.
    Conflict(IdempotencyRecord),
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteResult {
    Deleted,
    StateMismatch,
    NotFound,
}

/// Durable keyed storage for idempotency records.
///
/// # 契約
/// - 1 key につき 1 レコード（一意制約）
/// - 各操作は 1 行単位でアトミック
/// - 失敗時に部分的な書き込みは残らない
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert only if no record exists for `record.key`.
    async fn try_create(&self, record: IdempotencyRecord) -> Result<CreateResult, StoreError>;

    /// Write a terminal state, only if the record is PROCESSING and owned by `owner`.
    async fn update_if_owner(
        &self,
        key: &IdempotencyKey,
        owner: OwnerToken,
        completion: Completion,
        now: DateTime<Utc>,
    ) -> Result<UpdateResult, StoreError>;

    /// Move the record to PROCESSING under `new_owner`, only if it still
    /// matches `expected` exactly.
    async fn transfer_ownership(
        &self,
        key: &IdempotencyKey,
        expected: Ownership,
        new_owner: OwnerToken,
        now: DateTime<Utc>,
    ) -> Result<TransferResult, StoreError>;

    /// Put an open record back to PENDING with no owner, only if it still
    /// matches `expected` exactly. Used to re-issue work for an abandoned key.
    async fn requeue(
        &self,
        key: &IdempotencyKey,
        expected: Ownership,
        now: DateTime<Utc>,
    ) -> Result<TransferResult, StoreError>;

    async fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Delete only if the record is currently in `expected` state.
    async fn delete_if_state(
        &self,
        key: &IdempotencyKey,
        expected: RecordState,
    ) -> Result<DeleteResult, StoreError>;

    /// Records with `expires_at < now`, oldest first (index on `expires_at`).
    async fn scan_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<IdempotencyRecord>, StoreError>;

    /// PENDING/PROCESSING records not touched since `cutoff` (index on `state`).
    async fn scan_stale(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<IdempotencyRecord>, StoreError>;

    async fn counts(&self) -> Result<RecordCounts, StoreError>;
}
