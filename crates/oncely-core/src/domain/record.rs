//! Idempotency record: the single source of truth for one key.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::OwnerToken;
use super::key::IdempotencyKey;
use super::outcome::Completion;
use super::state::RecordState;

/// Converts a config duration into a chrono span, saturating on overflow.
pub(crate) fn span(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

fn saturating_add(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    at.checked_add_signed(span(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// One row per idempotency key.
///
/// Design:
/// - Store adapters keep exactly one of these per key.
/// - Every mutation goes through a conditional store operation; the
///   `mark_*`/`grant` helpers only describe what a successful write looks like.
/// - `updated_at` is the staleness clock for PENDING/PROCESSING.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: IdempotencyKey,
    pub state: RecordState,

    /// Encoded operation result. Present iff `state == Completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Vec<u8>>,

    /// Present iff `state == Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Current (or, for terminal records, last) owner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_token: Option<OwnerToken>,

    /// Number of times ownership has been granted for this record.
    pub attempt: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// First sight of a key on the synchronous path: owned immediately.
    pub fn processing(
        key: IdempotencyKey,
        owner: OwnerToken,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            key,
            state: RecordState::Processing,
            result: None,
            failure_reason: None,
            owner_token: Some(owner),
            attempt: 1,
            created_at: now,
            updated_at: now,
            expires_at: saturating_add(now, ttl),
        }
    }

    /// First sight of a key on the queued path: waiting for a worker.
    pub fn pending(key: IdempotencyKey, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            key,
            state: RecordState::Pending,
            result: None,
            failure_reason: None,
            owner_token: None,
            attempt: 0,
            created_at: now,
            updated_at: now,
            expires_at: saturating_add(now, ttl),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// A PENDING/PROCESSING record untouched for longer than `timeout` is
    /// presumed abandoned.
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        !self.state.is_terminal() && now.signed_duration_since(self.updated_at) > span(timeout)
    }

    /// Time left before the record becomes stale (zero if it already is).
    pub fn time_until_stale(&self, now: DateTime<Utc>, timeout: Duration) -> Duration {
        let elapsed = now.signed_duration_since(self.updated_at);
        span(timeout)
            .checked_sub(&elapsed)
            .and_then(|left| left.to_std().ok())
            .unwrap_or(Duration::ZERO)
    }

    /// Snapshot used as the compare half of an ownership transfer.
    pub fn ownership(&self) -> Ownership {
        Ownership {
            state: self.state,
            owner_token: self.owner_token,
            updated_at: self.updated_at,
        }
    }

    /// Hand the record to a new owner (claim or reclaim).
    ///
    /// The expiry is pushed out so the record keeps its full lifetime from
    /// `now`; a late reclaim must not be reaped right after it completes.
    pub fn grant(&mut self, owner: OwnerToken, now: DateTime<Utc>) {
        self.state = RecordState::Processing;
        self.owner_token = Some(owner);
        self.attempt = self.attempt.saturating_add(1);
        self.updated_at = now;
        self.renew_expiry(now);
    }

    /// Put an abandoned record back to PENDING for a fresh delivery.
    ///
    /// Clears the owner, so a crashed owner's late commit is rejected.
    pub fn requeue(&mut self, now: DateTime<Utc>) {
        self.state = RecordState::Pending;
        self.owner_token = None;
        self.updated_at = now;
        self.renew_expiry(now);
    }

    fn renew_expiry(&mut self, now: DateTime<Utc>) {
        let lifetime = self.expires_at.signed_duration_since(self.created_at);
        let renewed = now
            .checked_add_signed(lifetime)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.expires_at = self.expires_at.max(renewed);
    }

    pub fn mark_completed(&mut self, result: Vec<u8>, now: DateTime<Utc>) {
        self.state = RecordState::Completed;
        self.result = Some(result);
        self.failure_reason = None;
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, reason: String, now: DateTime<Utc>) {
        self.state = RecordState::Failed;
        self.result = None;
        self.failure_reason = Some(reason);
        self.updated_at = now;
    }

    pub fn apply(&mut self, completion: Completion, now: DateTime<Utc>) {
        match completion {
            Completion::Completed(result) => self.mark_completed(result, now),
            Completion::Failed(reason) => self.mark_failed(reason, now),
        }
    }
}

/// What a transfer expects to find. The transfer only succeeds if all three
/// fields still match, so at most one of several concurrent reclaimers wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ownership {
    pub state: RecordState,
    pub owner_token: Option<OwnerToken>,
    pub updated_at: DateTime<Utc>,
}

impl Ownership {
    pub fn matches(&self, record: &IdempotencyRecord) -> bool {
        *self == record.ownership()
    }
}
