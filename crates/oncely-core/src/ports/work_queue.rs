//! WorkQueue port - 配送キュー（at-least-once）
//!
//! Queue は「誰が実行するか」のスケジューリングだけを担当します。
//! 正しさ（1 key 1 実行）は RecordStore の条件付き書き込みが保証するので、
//! 再配送されても coordinator 側で cache hit になるだけです。

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{DeadLetter, Lease, MessageId, QueueCounts, WorkItem};

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("work queue unavailable: {0}")]
    Unavailable(String),

    #[error("unknown or expired delivery: {0}")]
    UnknownMessage(MessageId),

    /// The lease ran out and the message was handed to someone else.
    #[error("lease on {0} was superseded by a redelivery")]
    LeaseLost(MessageId),
}

/// What happened to a released (negatively acknowledged) message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Will be redelivered after `delay`.
    Scheduled { delay: Duration },

    /// Delivery budget exhausted; moved to the dead-letter channel.
    DeadLettered,
}

/// Delivery queue consumed by the worker pool.
///
/// # 設計原則
/// - lease した message は ack するまで queue に残る（worker が落ちたら再配送）
/// - ack / release / defer は lease の受領証で行う（期限切れの lease は無効）
/// - ack は coordinator が terminal に到達した後だけ
/// - 配送回数の上限を超えたら dead-letter（defer は回数に数えない）
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, item: WorkItem) -> Result<(), QueueError>;

    /// Lease one ready item, waiting up to `wait`. `None` means nothing became
    /// ready in time.
    async fn lease(&self, wait: Duration) -> Result<Option<Lease>, QueueError>;

    /// Remove a leased item for good.
    async fn ack(&self, lease: &Lease) -> Result<(), QueueError>;

    /// Give a leased item back after a failed attempt. Counts against the
    /// delivery budget and waits out the queue's backoff.
    async fn release(&self, lease: &Lease, reason: String) -> Result<ReleaseOutcome, QueueError>;

    /// Hand a leased item back untouched, to be redelivered after `delay`.
    /// The delivery is not charged against the budget.
    async fn defer(&self, lease: &Lease, delay: Duration) -> Result<(), QueueError>;

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError>;

    async fn counts(&self) -> Result<QueueCounts, QueueError>;
}
