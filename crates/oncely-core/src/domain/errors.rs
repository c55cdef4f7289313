//! Errors - エラー型と分類
//!
//! `InFlight` と業務失敗（Failed）はエラーではなく `Outcome` で表現します。
//! ここに来るのは「呼び出し側が結果を観測できなかった」ケースだけです。

use crate::domain::IdempotencyKey;
use crate::ports::record_store::StoreError;
use crate::ports::work_queue::QueueError;

/// Operational classification of an error.
///
/// - Transient: 一時的（そのままリトライしてよい）
/// - Permanent: 恒久的（リトライしても変わらない）
/// - Infrastructure: インフラ障害（store / queue が使えない）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

/// Failure of a coordinator call.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("record store failure: {0}")]
    Store(#[from] StoreError),

    #[error("work queue failure: {0}")]
    Queue(#[from] QueueError),

    #[error("record for key={key} disappeared while it was being processed")]
    RecordLost { key: IdempotencyKey },

    #[error("key={key} kept changing state during arbitration ({rounds} rounds)")]
    Contention { key: IdempotencyKey, rounds: u32 },
}

impl CoordinatorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoordinatorError::Store(StoreError::Unavailable(_)) => ErrorKind::Infrastructure,
            CoordinatorError::Store(StoreError::Corrupt { .. }) => ErrorKind::Permanent,
            CoordinatorError::Queue(QueueError::Unavailable(_)) => ErrorKind::Infrastructure,
            CoordinatorError::Queue(
                QueueError::UnknownMessage(_) | QueueError::LeaseLost(_),
            ) => ErrorKind::Permanent,
            CoordinatorError::RecordLost { .. } | CoordinatorError::Contention { .. } => {
                ErrorKind::Transient
            }
        }
    }

    /// Can the caller resubmit the same key and expect progress?
    pub fn is_retryable(&self) -> bool {
        self.kind() != ErrorKind::Permanent
    }
}
