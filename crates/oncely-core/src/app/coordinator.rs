//! Coordinator - 1 key につき 1 回だけ実行する
//!
//! # フロー
//! 1. `try_create` で PROCESSING record を作る（勝者が executor）
//! 2. 負けたら既存 record を Decider に渡して次の行動を決める
//!    （replay / failure / in-flight / claim / FAILED の削除）
//! 3. executor は operation を実行して `update_if_owner` で結果を書く
//!
//! 同じ key の直列化は RecordStore の条件付き書き込みだけに依存する。
//! プロセス内ロックは使わない。

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::app::config::CoordinatorConfig;
use crate::domain::{
    Arbiter, Completion, CoordinatorError, Decider, Decision, DecisionContext, DefaultDecider,
    IdempotencyKey, IdempotencyRecord, Outcome, OwnerToken, RecordState, WorkItem,
};
use crate::ports::clock::deadline_after;
use crate::ports::{
    Clock, CreateResult, DeleteResult, IdGenerator, RecordStore, StoreError, SystemClock,
    TransferResult, UlidGenerator, UpdateResult,
};
use crate::typed::{AttemptContext, DynOperation, OperationError};

/// Upper bound on create/decide rounds for one call.
///
/// Every round ends in a store write that changed the record, so hitting this
/// means the key is being fought over, not that the loop is stuck.
pub(crate) const MAX_ARBITRATION_ROUNDS: u32 = 8;

/// What a worker should do with a delivered work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Processed {
    /// The key is terminal; ack the message.
    Terminal(Outcome),

    /// Someone else owns the key; hand the message back for `retry_after`.
    Deferred { retry_after: Duration },
}

enum Creation {
    Owner(AttemptContext),
    Existing(IdempotencyRecord),
}

/// Idempotent-request coordinator.
pub struct Coordinator {
    store: Arc<dyn RecordStore>,
    operation: Arc<dyn DynOperation>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    decider: Arc<dyn Decider>,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        operation: Arc<dyn DynOperation>,
        config: CoordinatorConfig,
    ) -> Self {
        let decider = DefaultDecider::new(
            config.processing_timeout,
            config.min_retry_after,
            config.max_retry_after,
        );
        Self {
            store,
            operation,
            clock: Arc::new(SystemClock),
            ids: Arc::new(UlidGenerator::new(SystemClock)),
            decider: Arc::new(decider),
            config,
        }
    }

    /// Replace the clock (and the id generator's time source with it).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.ids = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        self.clock = clock;
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = decider;
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn operation_name(&self) -> &str {
        self.operation.name()
    }

    pub(crate) fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub(crate) fn ids(&self) -> &Arc<dyn IdGenerator> {
        &self.ids
    }

    pub(crate) fn decider(&self) -> &Arc<dyn Decider> {
        &self.decider
    }

    /// Synchronous path: execute at most once per key, replay otherwise.
    ///
    /// `Outcome::InFlight` is returned (not awaited) when another owner is
    /// live; the caller decides when to come back.
    pub async fn submit(
        &self,
        key: &IdempotencyKey,
        payload: &[u8],
    ) -> Result<Outcome, CoordinatorError> {
        self.arbitrate(key, payload, Arbiter::Caller).await
    }

    /// `submit`, re-submitting while in flight until `max_wait` runs out.
    ///
    /// Sleeps for the returned `retry_after` (capped by the time left). The
    /// last `InFlight` is returned if the key is still open at the deadline.
    pub async fn submit_with_deadline(
        &self,
        key: &IdempotencyKey,
        payload: &[u8],
        max_wait: Duration,
    ) -> Result<Outcome, CoordinatorError> {
        let deadline = deadline_after(tokio::time::Instant::now(), max_wait);
        loop {
            let outcome = self.submit(key, payload).await?;
            let Outcome::InFlight { retry_after } = outcome else {
                return Ok(outcome);
            };
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(outcome);
            }
            debug!(key = %key, ?retry_after, "key in flight; waiting before resubmit");
            tokio::time::sleep(retry_after.min(remaining)).await;
        }
    }

    /// Worker path: drive a delivered item to a terminal state if possible.
    ///
    /// Workers claim PENDING records immediately and never clear FAILED ones;
    /// a FAILED key seen here is a duplicate delivery.
    pub async fn process(&self, item: &WorkItem) -> Result<Processed, CoordinatorError> {
        match self.arbitrate(&item.key, &item.payload, Arbiter::Worker).await? {
            Outcome::InFlight { retry_after } => Ok(Processed::Deferred { retry_after }),
            outcome => Ok(Processed::Terminal(outcome)),
        }
    }

    /// Current outcome for `key` without creating or changing anything.
    pub async fn peek(&self, key: &IdempotencyKey) -> Result<Option<Outcome>, CoordinatorError> {
        match self.store.get(key).await? {
            Some(record) => self.observe(&record).map(Some),
            None => Ok(None),
        }
    }

    async fn arbitrate(
        &self,
        key: &IdempotencyKey,
        payload: &[u8],
        arbiter: Arbiter,
    ) -> Result<Outcome, CoordinatorError> {
        let mut failure_retries_left = match arbiter {
            Arbiter::Caller => self.config.max_failure_retries,
            Arbiter::Worker => 0,
        };
        let mut known: Option<IdempotencyRecord> = None;

        for _ in 0..MAX_ARBITRATION_ROUNDS {
            let record = match known.take() {
                Some(record) => record,
                None => match self.create_processing(key).await? {
                    Creation::Owner(ctx) => return self.execute_as_owner(ctx, payload).await,
                    Creation::Existing(record) => record,
                },
            };

            let now = self.clock.now();
            let ctx = DecisionContext {
                now,
                arbiter,
                failure_retries_left,
            };
            match self.decider.decide(&record, &ctx) {
                Decision::Replay(bytes) => {
                    debug!(key = %key, "replaying stored result");
                    return Ok(Outcome::Completed(bytes));
                }
                Decision::ReportFailure(reason) => {
                    debug!(key = %key, reason = %reason, "reporting stored failure");
                    return Ok(Outcome::Failed(reason));
                }
                Decision::InFlight { retry_after } => {
                    debug!(key = %key, state = %record.state, ?retry_after, "key in flight");
                    return Ok(Outcome::InFlight { retry_after });
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
                    match self.store.delete_if_state(key, RecordState::Failed).await? {
                        DeleteResult::Deleted => {
                            info!(key = %key, "cleared FAILED record for a fresh attempt")
                        }
                        DeleteResult::StateMismatch | DeleteResult::NotFound => {
                            debug!(key = %key, "FAILED record changed before it could be cleared")
                        }
                    }
                }
                Decision::Claim(expected) => {
                    let owner = self.ids.owner_token();
                    match self
                        .store
                        .transfer_ownership(key, expected, owner, now)
                        .await?
                    {
                        TransferResult::Acquired(record) => {
                            if expected.state == RecordState::Processing {
                                warn!(
                                    key = %key,
                                    previous_owner = ?expected.owner_token,
                                    owner = %owner,
                                    attempt = record.attempt,
                                    "reclaimed stale PROCESSING record"
                                );
                            } else {
                                info!(key = %key, owner = %owner, attempt = record.attempt, "claimed record");
                            }
                            let ctx = attempt_context(&record, owner);
                            return self.execute_as_owner(ctx, payload).await;
                        }
                        TransferResult::Conflict(current) => {
                            debug!(key = %key, "lost ownership race; re-evaluating");
                            known = Some(current);
                        }
                        TransferResult::NotFound => {}
                    }
                }
            }
        }

        warn!(key = %key, rounds = MAX_ARBITRATION_ROUNDS, "giving up on contended key");
        Err(CoordinatorError::Contention {
            key: key.clone(),
            rounds: MAX_ARBITRATION_ROUNDS,
        })
    }

    /// Conditional insert of a PROCESSING record owned by a fresh token.
    ///
    /// An interrupted insert may or may not have landed, so it is resolved by
    /// reading the record back, never by writing again.
    async fn create_processing(&self, key: &IdempotencyKey) -> Result<Creation, CoordinatorError> {
        let owner = self.ids.owner_token();
        let record = IdempotencyRecord::processing(
            key.clone(),
            owner,
            self.clock.now(),
            self.config.record_ttl,
        );

        match self.store.try_create(record).await {
            Ok(CreateResult::Created) => {
                debug!(key = %key, owner = %owner, "created PROCESSING record");
                Ok(Creation::Owner(AttemptContext {
                    key: key.clone(),
                    owner_token: owner,
                    attempt: 1,
                }))
            }
            Ok(CreateResult::AlreadyExists(existing)) => Ok(Creation::Existing(existing)),
            Err(err @ StoreError::Unavailable(_)) => {
                warn!(key = %key, error = %err, "try_create interrupted; re-reading record");
                match self.store.get(key).await {
                    Ok(Some(existing))
                        if existing.owner_token == Some(owner)
                            && existing.state == RecordState::Processing =>
                    {
                        Ok(Creation::Owner(attempt_context(&existing, owner)))
                    }
                    Ok(Some(existing)) => Ok(Creation::Existing(existing)),
                    Ok(None) | Err(_) => {
                        error!(key = %key, error = %err, "record store unavailable");
                        Err(err.into())
                    }
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Run the operation and commit its completion, conditional on still
    /// owning the record.
    async fn execute_as_owner(
        &self,
        ctx: AttemptContext,
        payload: &[u8],
    ) -> Result<Outcome, CoordinatorError> {
        debug!(
            key = %ctx.key,
            owner = %ctx.owner_token,
            attempt = ctx.attempt,
            operation = self.operation.name(),
            "executing operation"
        );

        let completion = match self.operation.execute_dyn(&ctx, payload).await {
            Ok(bytes) => Completion::Completed(bytes),
            Err(err) => {
                match &err {
                    OperationError::Business(reason) => {
                        info!(key = %ctx.key, attempt = ctx.attempt, reason = %reason, "operation failed")
                    }
                    OperationError::Decode(source) => {
                        warn!(key = %ctx.key, error = %source, "request payload rejected")
                    }
                    OperationError::Encode(source) => error!(
                        key = %ctx.key,
                        attempt = ctx.attempt,
                        operation = self.operation.name(),
                        error = %source,
                        "result could not be encoded; recording failure"
                    ),
                }
                Completion::Failed(err.failure_reason())
            }
        };

        let now = self.clock.now();
        match self
            .store
            .update_if_owner(&ctx.key, ctx.owner_token, completion.clone(), now)
            .await
        {
            Ok(UpdateResult::Updated) => {
                info!(key = %ctx.key, attempt = ctx.attempt, completed = matches!(completion, Completion::Completed(_)), "outcome recorded");
                Ok(completion.into())
            }
            Ok(UpdateResult::OwnerMismatch) => {
                warn!(
                    key = %ctx.key,
                    owner = %ctx.owner_token,
                    attempt = ctx.attempt,
                    "ownership was reclaimed; discarding this attempt's result"
                );
                match self.store.get(&ctx.key).await? {
                    Some(current) => self.observe(&current),
                    None => Err(CoordinatorError::RecordLost { key: ctx.key }),
                }
            }
            Ok(UpdateResult::NotFound) => {
                error!(key = %ctx.key, owner = %ctx.owner_token, "record vanished before commit");
                Err(CoordinatorError::RecordLost { key: ctx.key })
            }
            Err(err) => {
                error!(
                    key = %ctx.key,
                    owner = %ctx.owner_token,
                    attempt = ctx.attempt,
                    error = %err,
                    "failed to record outcome"
                );
                Err(err.into())
            }
        }
    }

    /// What a caller sees for a record as it stands.
    fn observe(&self, record: &IdempotencyRecord) -> Result<Outcome, CoordinatorError> {
        match record.state {
            RecordState::Completed => match &record.result {
                Some(bytes) => Ok(Outcome::Completed(bytes.clone())),
                None => Err(StoreError::Corrupt {
                    key: record.key.clone(),
                    reason: "COMPLETED record has no result".to_string(),
                }
                .into()),
            },
            RecordState::Failed => Ok(Outcome::Failed(
                record
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "unknown failure".to_string()),
            )),
            RecordState::Pending | RecordState::Processing => Ok(Outcome::InFlight {
                retry_after: self.decider.retry_after(record, self.clock.now()),
            }),
        }
    }
}

fn attempt_context(record: &IdempotencyRecord, owner: OwnerToken) -> AttemptContext {
    AttemptContext {
        key: record.key.clone(),
        owner_token: owner,
        attempt: record.attempt,
    }
}
