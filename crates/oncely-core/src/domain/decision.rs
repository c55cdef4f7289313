//! Decision model: what to do with a key that already has a record.
//!
//! The coordinator's `try_create` either wins (and executes) or loses and gets
//! the existing record back. Everything that happens after losing is decided
//! here, as a pure function of the record, the current time and the call's
//! remaining retry budget. Executing the decision (store writes, invoking the
//! operation) is the coordinator's job.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::record::{IdempotencyRecord, Ownership};
use super::state::RecordState;

/// Who is arbitrating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arbiter {
    /// A caller on the synchronous path.
    Caller,

    /// A queue worker draining a delivered work item.
    Worker,
}

/// Inputs to a decision besides the record itself.
#[derive(Debug, Clone, Copy)]
pub struct DecisionContext {
    pub now: DateTime<Utc>,
    pub arbiter: Arbiter,

    /// How many more FAILED records this call may clear.
    pub failure_retries_left: u32,
}

/// The next action for an existing record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Return the stored result verbatim.
    Replay(Vec<u8>),

    /// Surface the stored failure.
    ReportFailure(String),

    /// Delete the FAILED record and go around again.
    ClearFailed,

    /// Another owner is live; tell the caller to come back later.
    InFlight { retry_after: Duration },

    /// Try to take ownership (stale lock, or PENDING work for a worker).
    Claim(Ownership),

    /// The record violates its own invariants.
    Corrupt(String),
}

/// Decides the next action for an existing record.
///
/// Implementations must be pure: same record + context => same decision.
pub trait Decider: Send + Sync {
    fn decide(&self, record: &IdempotencyRecord, ctx: &DecisionContext) -> Decision;

    /// Back-off hint for a record that is still open.
    fn retry_after(&self, record: &IdempotencyRecord, now: DateTime<Utc>) -> Duration;
}

/// Default decider.
///
/// - COMPLETED: replay.
/// - FAILED: clear once per call while budget remains, then report.
///   Workers never clear: a FAILED key seen by a worker is a duplicate delivery
///   of work that already finished.
/// - PROCESSING: in flight unless stale, then claim.
/// - PENDING: workers claim immediately; callers wait for the queue unless it
///   looks abandoned.
#[derive(Debug, Clone)]
pub struct DefaultDecider {
    processing_timeout: Duration,
    min_retry_after: Duration,
    max_retry_after: Duration,
}

impl DefaultDecider {
    pub fn new(
        processing_timeout: Duration,
        min_retry_after: Duration,
        max_retry_after: Duration,
    ) -> Self {
        Self {
            processing_timeout,
            min_retry_after,
            max_retry_after,
        }
    }

    pub fn processing_timeout(&self) -> Duration {
        self.processing_timeout
    }

    fn in_flight(&self, record: &IdempotencyRecord, now: DateTime<Utc>) -> Decision {
        Decision::InFlight {
            retry_after: self.retry_after(record, now),
        }
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, record: &IdempotencyRecord, ctx: &DecisionContext) -> Decision {
        match record.state {
            RecordState::Completed => match &record.result {
                Some(bytes) => Decision::Replay(bytes.clone()),
                None => Decision::Corrupt("COMPLETED record has no result".to_string()),
            },
            RecordState::Failed => {
                if ctx.arbiter == Arbiter::Caller && ctx.failure_retries_left > 0 {
                    Decision::ClearFailed
                } else {
                    Decision::ReportFailure(
                        record
                            .failure_reason
                            .clone()
                            .unwrap_or_else(|| "unknown failure".to_string()),
                    )
                }
            }
            RecordState::Processing => {
                if record.is_stale(ctx.now, self.processing_timeout) {
                    Decision::Claim(record.ownership())
                } else {
                    self.in_flight(record, ctx.now)
                }
            }
            RecordState::Pending => {
                if ctx.arbiter == Arbiter::Worker
                    || record.is_stale(ctx.now, self.processing_timeout)
                {
                    Decision::Claim(record.ownership())
                } else {
                    self.in_flight(record, ctx.now)
                }
            }
        }
    }

    /// Remaining time until the record could be reclaimed, clamped to
    /// `[min_retry_after, max_retry_after]`.
    fn retry_after(&self, record: &IdempotencyRecord, now: DateTime<Utc>) -> Duration {
        record
            .time_until_stale(now, self.processing_timeout)
            .min(self.max_retry_after)
            .max(self.min_retry_after)
    }
}
