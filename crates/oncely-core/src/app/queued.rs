//! QueuedCoordinator - enqueue して即座に返す経路
//!
//! 呼び出し側は PENDING record を作って WorkItem を積むだけ。実行は
//! WorkerGroup が `Coordinator::process` で行い、結果は `poll` で取りに来る。
//! queue は at-least-once なので重複配送は cache hit になるだけ。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::app::coordinator::{Coordinator, MAX_ARBITRATION_ROUNDS};
use crate::app::status::StatusSnapshot;
use crate::domain::{
    Arbiter, CoordinatorError, Decider, Decision, DecisionContext, IdempotencyKey,
    IdempotencyRecord, Outcome, PollResult, RecordState, SubmitReceipt, WorkItem,
};
use crate::ports::{
    Clock, CreateResult, DeleteResult, IdGenerator, RecordStore, StoreError, TransferResult,
    WorkQueue,
};

pub struct QueuedCoordinator {
    coordinator: Arc<Coordinator>,
    queue: Arc<dyn WorkQueue>,
}

impl QueuedCoordinator {
    pub fn new(coordinator: Arc<Coordinator>, queue: Arc<dyn WorkQueue>) -> Self {
        Self { coordinator, queue }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn queue(&self) -> &Arc<dyn WorkQueue> {
        &self.queue
    }

    /// Accept a request for background execution.
    ///
    /// - terminal key: answered immediately, nothing is enqueued
    ///   (FAILED is cleared and re-enqueued while the retry budget lasts)
    /// - new key: PENDING record + one work item
    /// - open key: `Accepted` without a second work item, unless the record
    ///   went stale; then it is reset to PENDING and enqueued once more
    pub async fn submit(
        &self,
        key: &IdempotencyKey,
        payload: &[u8],
    ) -> Result<SubmitReceipt, CoordinatorError> {
        let store = self.coordinator.store();
        let clock = self.coordinator.clock();
        let mut failure_retries_left = self.coordinator.config().max_failure_retries;
        let mut known: Option<IdempotencyRecord> = None;

        for _ in 0..MAX_ARBITRATION_ROUNDS {
            let now = clock.now();
            let existing = match known.take() {
                Some(record) => record,
                None => match self.create_pending(key, now).await? {
                    None => {
                        self.enqueue_or_roll_back(key, payload).await?;
                        info!(key = %key, "request accepted");
                        return Ok(SubmitReceipt::Accepted);
                    }
                    Some(existing) => existing,
                },
            };

            let ctx = DecisionContext {
                now,
                arbiter: Arbiter::Caller,
                failure_retries_left,
            };
            match self.coordinator.decider().decide(&existing, &ctx) {
                Decision::Replay(bytes) => {
                    return Ok(SubmitReceipt::Resolved(Outcome::Completed(bytes)));
                }
                Decision::ReportFailure(reason) => {
                    return Ok(SubmitReceipt::Resolved(Outcome::Failed(reason)));
                }
                Decision::Corrupt(reason) => {
                    error!(key = %key, reason = %reason, "corrupt idempotency record");
                    return Err(StoreError::Corrupt {
                        key: key.clone(),
                        reason,
                    }
                    .into());
                }
                Decision::ClearFailed => {
                    failure_retries_left = failure_retries_left.saturating_sub(1);
                    let deleted = store.delete_if_state(key, RecordState::Failed).await?;
                    if deleted == DeleteResult::Deleted {
                        info!(key = %key, "cleared FAILED record for a fresh attempt");
                    }
                }
                Decision::InFlight { .. } => {
                    debug!(key = %key, state = %existing.state, "already queued or running");
                    return Ok(SubmitReceipt::Accepted);
                }
                Decision::Claim(expected) => {
                    // the earlier delivery was lost or its worker died; the
                    // reset makes later submits see a live PENDING record
                    match store.requeue(key, expected, now).await? {
                        TransferResult::Acquired(_) => {
                            warn!(
                                key = %key,
                                state = %existing.state,
                                "stale record; re-enqueueing"
                            );
                            self.queue.enqueue(self.work_item(key, payload)).await?;
                            return Ok(SubmitReceipt::Accepted);
                        }
                        TransferResult::Conflict(current) => known = Some(current),
                        TransferResult::NotFound => {}
                    }
                }
            }
        }

        Err(CoordinatorError::Contention {
            key: key.clone(),
            rounds: MAX_ARBITRATION_ROUNDS,
        })
    }

    /// Current outcome for `key`. `Ready(InFlight)` while it is queued or running.
    pub async fn poll(&self, key: &IdempotencyKey) -> Result<PollResult, CoordinatorError> {
        Ok(match self.coordinator.peek(key).await? {
            Some(outcome) => PollResult::Ready(outcome),
            None => PollResult::NotFound,
        })
    }

    /// Record state only.
    pub async fn status(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<RecordState>, CoordinatorError> {
        let record = self.coordinator.store().get(key).await?;
        Ok(record.map(|r| r.state))
    }

    pub async fn snapshot(&self) -> Result<StatusSnapshot, CoordinatorError> {
        Ok(StatusSnapshot {
            records: self.coordinator.store().counts().await?,
            queue: self.queue.counts().await?,
        })
    }

    fn work_item(&self, key: &IdempotencyKey, payload: &[u8]) -> WorkItem {
        WorkItem::new(
            self.coordinator.ids().message_id(),
            key.clone(),
            payload.to_vec(),
            self.coordinator.clock().now(),
        )
    }

    /// Conditional insert of a PENDING record. `None` means this call created it.
    ///
    /// An interrupted insert is resolved by reading back: the record is ours
    /// if it is exactly what was written.
    async fn create_pending(
        &self,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, CoordinatorError> {
        let store = self.coordinator.store();
        let record =
            IdempotencyRecord::pending(key.clone(), now, self.coordinator.config().record_ttl);

        match store.try_create(record.clone()).await {
            Ok(CreateResult::Created) => Ok(None),
            Ok(CreateResult::AlreadyExists(existing)) => Ok(Some(existing)),
            Err(err @ StoreError::Unavailable(_)) => {
                warn!(key = %key, error = %err, "try_create interrupted; re-reading record");
                match store.get(key).await {
                    Ok(Some(existing)) if existing == record => Ok(None),
                    Ok(Some(existing)) => Ok(Some(existing)),
                    Ok(None) | Err(_) => Err(err.into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// A PENDING record with no work item behind it would only be picked up
    /// once it goes stale, so a failed enqueue removes the record again.
    async fn enqueue_or_roll_back(
        &self,
        key: &IdempotencyKey,
        payload: &[u8],
    ) -> Result<(), CoordinatorError> {
        let Err(err) = self.queue.enqueue(self.work_item(key, payload)).await else {
            return Ok(());
        };
        error!(key = %key, error = %err, "enqueue failed; removing PENDING record");
        if let Err(cleanup) = self
            .coordinator
            .store()
            .delete_if_state(key, RecordState::Pending)
            .await
        {
            error!(key = %key, error = %cleanup, "could not remove PENDING record");
        }
        Err(err.into())
    }
}
