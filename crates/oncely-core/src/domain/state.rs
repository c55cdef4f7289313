//! Record state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// State of an idempotency record.
///
/// State transitions:
/// - Pending -> Processing (a queue worker claims the key)
/// - Processing -> Completed
/// - Processing -> Failed
/// - Processing -> Processing (stale owner replaced by a reclaimer)
///
/// A Failed record never moves back; it is deleted to permit a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordState {
    /// Accepted onto the work queue, no owner yet.
    Pending,

    /// Owned by exactly one executor.
    Processing,

    /// Result stored for replay.
    Completed,

    /// Business (or encoding) failure recorded.
    Failed,
}

impl RecordState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, RecordState::Completed | RecordState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordState::Pending => "PENDING",
            RecordState::Processing => "PROCESSING",
            RecordState::Completed => "COMPLETED",
            RecordState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
