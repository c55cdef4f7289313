//! WorkItem - queue の“運搬用”データ（key + payload）。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{LeaseReceipt, MessageId};
use super::key::IdempotencyKey;

/// One queued request. Exists only between enqueue and ack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub message_id: MessageId,
    pub key: IdempotencyKey,
    pub payload: Vec<u8>,
    pub enqueued_at: DateTime<Utc>,

    /// Deliveries charged against the queue's budget: 1 on first delivery,
    /// +1 per redelivery. A deferred delivery is not charged.
    pub delivery_attempt: u32,
}

impl WorkItem {
    pub fn new(
        message_id: MessageId,
        key: IdempotencyKey,
        payload: Vec<u8>,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id,
            key,
            payload,
            enqueued_at,
            delivery_attempt: 0,
        }
    }
}

/// One delivery of a work item, held by a single worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub item: WorkItem,
    pub receipt: LeaseReceipt,
}

impl Lease {
    pub fn message_id(&self) -> MessageId {
        self.item.message_id
    }
}

/// A message that exhausted its delivery budget, parked for inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub item: WorkItem,
    pub reason: String,
    pub dead_at: DateTime<Utc>,
}
