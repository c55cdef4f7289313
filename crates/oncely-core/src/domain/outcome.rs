//! Outcome model: what a caller observes for a key.
//!
//! `InFlight` is an expected, non-fatal answer (another owner is working on
//! the key), so it lives here next to the terminal variants instead of in the
//! error types.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::typed::codec::{CodecError, JsonCodec};

/// Result of submitting (or polling) a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Encoded result, byte-identical on every replay.
    Completed(Vec<u8>),

    /// The operation's own failure reason.
    Failed(String),

    /// Someone else owns the key right now; try again after `retry_after`.
    InFlight { retry_after: Duration },
}

impl Outcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Outcome::InFlight { .. })
    }

    /// Decode a completed result with the default codec.
    ///
    /// Returns `None` for non-completed outcomes.
    pub fn decode<T: DeserializeOwned>(&self) -> Option<Result<T, CodecError>> {
        match self {
            Outcome::Completed(bytes) => Some(JsonCodec::decode(bytes)),
            _ => None,
        }
    }
}

/// The terminal write an owner performs at the end of an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum Completion {
    Completed(Vec<u8>),
    Failed(String),
}

impl From<Completion> for Outcome {
    fn from(completion: Completion) -> Self {
        match completion {
            Completion::Completed(bytes) => Outcome::Completed(bytes),
            Completion::Failed(reason) => Outcome::Failed(reason),
        }
    }
}

/// Answer of the queued submit path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitReceipt {
    /// Enqueued (or already queued); poll for the result.
    Accepted,

    /// The key was already terminal; nothing was enqueued.
    Resolved(Outcome),
}

/// Answer of `poll`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollResult {
    Ready(Outcome),
    NotFound,
}
