//! In-memory work queue implementation.
//!
//! Single-process stand-in for a durable queue with visibility timeouts
//! (SQS-style): a leased message stays owned by the queue until it is acked,
//! and comes back if its lease runs out.

use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::app::config::QueueConfig;
use crate::domain::{
    DeadLetter, IdempotencyKey, Lease, LeaseReceipt, MessageId, QueueCounts, WorkItem,
};
use crate::ports::clock::deadline_after;
use crate::ports::{Clock, QueueError, ReleaseOutcome, SystemClock, WorkQueue};

/// Scheduled redelivery entry for the backoff heap.
///
/// Reverse ordering so BinaryHeap acts as a min-heap (earliest first).
#[derive(Debug, Clone, PartialEq, Eq)]
struct Scheduled {
    due_at: Instant,
    message_id: MessageId,
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.due_at.cmp(&self.due_at)
    }
}

/// A leased message: who holds it and until when.
#[derive(Debug, Clone, Copy)]
struct Held {
    receipt: LeaseReceipt,
    deadline: Instant,
}

struct InMemoryWorkQueueState {
    /// Every message not yet acked or dead-lettered (single source of truth).
    messages: HashMap<MessageId, WorkItem>,

    /// Ready queue (MessageIds only).
    ready: VecDeque<MessageId>,

    /// Waiting out a redelivery backoff or a deferral.
    scheduled: BinaryHeap<Scheduled>,

    /// Leased messages, by the current lease.
    in_flight: HashMap<MessageId, Held>,

    /// Keys with a leased message. Another message for the same key is not
    /// handed out until that lease ends.
    active_keys: HashSet<IdempotencyKey>,

    dead: Vec<DeadLetter>,

    config: QueueConfig,
}

impl InMemoryWorkQueueState {
    fn new(config: QueueConfig) -> Self {
        Self {
            messages: HashMap::new(),
            ready: VecDeque::new(),
            scheduled: BinaryHeap::new(),
            in_flight: HashMap::new(),
            active_keys: HashSet::new(),
            dead: Vec::new(),
            config,
        }
    }

    /// Move messages from scheduled to ready if their time has come.
    fn promote_scheduled(&mut self, now: Instant) {
        while let Some(entry) = self.scheduled.peek() {
            if entry.due_at > now {
                break;
            }
            if let Some(entry) = self.scheduled.pop() {
                self.ready.push_back(entry.message_id);
            }
        }
    }

    /// Leases whose visibility timeout elapsed go back as if released.
    fn expire_leases(&mut self, now: Instant, clock: &dyn Clock) {
        let expired: Vec<MessageId> = self
            .in_flight
            .iter()
            .filter(|(_, held)| held.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for message_id in expired {
            self.in_flight.remove(&message_id);
            if let Some(item) = self.messages.get(&message_id) {
                let key = item.key.clone();
                self.active_keys.remove(&key);
                warn!(%message_id, %key, "lease expired without ack; redelivering");
            }
            self.give_back(message_id, "visibility timeout elapsed".to_string(), now, clock);
        }
    }

    fn take_ready(&mut self, now: Instant) -> Option<Lease> {
        let position = self.ready.iter().position(|id| {
            self.messages
                .get(id)
                .is_some_and(|item| !self.active_keys.contains(&item.key))
        })?;
        let message_id = self.ready.remove(position)?;
        let item = self.messages.get_mut(&message_id)?;

        item.delivery_attempt = item.delivery_attempt.saturating_add(1);
        self.active_keys.insert(item.key.clone());
        let receipt = LeaseReceipt::from_ulid(Ulid::new());
        self.in_flight.insert(
            message_id,
            Held {
                receipt,
                deadline: deadline_after(now, self.config.visibility_timeout),
            },
        );
        Some(Lease {
            item: item.clone(),
            receipt,
        })
    }

    /// End `lease` if it is still the current one for its message.
    fn end_lease(&mut self, lease: &Lease) -> Result<(), QueueError> {
        let message_id = lease.message_id();
        match self.in_flight.get(&message_id) {
            Some(held) if held.receipt == lease.receipt => {}
            Some(_) => return Err(QueueError::LeaseLost(message_id)),
            None => return Err(QueueError::UnknownMessage(message_id)),
        }
        self.in_flight.remove(&message_id);
        if let Some(item) = self.messages.get(&message_id) {
            let key = item.key.clone();
            self.active_keys.remove(&key);
        }
        Ok(())
    }

    fn schedule(&mut self, message_id: MessageId, delay: Duration, now: Instant) {
        if delay.is_zero() {
            self.ready.push_back(message_id);
        } else {
            self.scheduled.push(Scheduled {
                due_at: deadline_after(now, delay),
                message_id,
            });
        }
    }

    /// Charged give-back: backoff, or dead-letter once the budget is spent.
    fn give_back(
        &mut self,
        message_id: MessageId,
        reason: String,
        now: Instant,
        clock: &dyn Clock,
    ) -> Option<ReleaseOutcome> {
        let attempts = self.messages.get(&message_id)?.delivery_attempt;

        if attempts >= self.config.max_delivery_attempts {
            let item = self.messages.remove(&message_id)?;
            warn!(
                %message_id,
                key = %item.key,
                attempts,
                reason = %reason,
                "delivery budget exhausted; dead-lettering"
            );
            self.dead.push(DeadLetter {
                item,
                reason,
                dead_at: clock.now(),
            });
            return Some(ReleaseOutcome::DeadLettered);
        }

        let delay = self.config.retry_policy.next_delay(attempts);
        self.schedule(message_id, delay, now);
        debug!(%message_id, attempts, ?delay, reason = %reason, "message released");
        Some(ReleaseOutcome::Scheduled { delay })
    }

    fn next_wake(&self) -> Option<Instant> {
        let next_scheduled = self.scheduled.peek().map(|entry| entry.due_at);
        let next_expiry = self.in_flight.values().map(|held| held.deadline).min();
        match (next_scheduled, next_expiry) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn counts(&self) -> QueueCounts {
        QueueCounts {
            ready: self.ready.len(),
            in_flight: self.in_flight.len(),
            scheduled: self.scheduled.len(),
            dead_lettered: self.dead.len(),
        }
    }
}

/// In-memory work queue implementation.
pub struct InMemoryWorkQueue {
    state: Arc<Mutex<InMemoryWorkQueueState>>,
    notify: Arc<Notify>,
    clock: Arc<dyn Clock>,
}

impl InMemoryWorkQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// `clock` only stamps dead letters; lease timing uses tokio's clock.
    pub fn with_clock(config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryWorkQueueState::new(config))),
            notify: Arc::new(Notify::new()),
            clock,
        }
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn enqueue(&self, item: WorkItem) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock().await;
            let message_id = item.message_id;
            state.messages.insert(message_id, item);
            state.ready.push_back(message_id);
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn lease(&self, wait: Duration) -> Result<Option<Lease>, QueueError> {
        let deadline = deadline_after(Instant::now(), wait);
        loop {
            let next_wake = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.promote_scheduled(now);
                state.expire_leases(now, self.clock.as_ref());

                if let Some(lease) = state.take_ready(now) {
                    let more = !state.ready.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Ok(Some(lease));
                }
                state.next_wake()
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }
            let wake_at = next_wake.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = self.notify.notified() => {},
                _ = tokio::time::sleep_until(wake_at) => {},
            }
        }
    }

    async fn ack(&self, lease: &Lease) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock().await;
            state.end_lease(lease)?;
            state.messages.remove(&lease.message_id());
        }
        // a message for the same key may have been waiting
        self.notify.notify_one();
        Ok(())
    }

    async fn release(&self, lease: &Lease, reason: String) -> Result<ReleaseOutcome, QueueError> {
        let message_id = lease.message_id();
        let outcome = {
            let mut state = self.state.lock().await;
            state.end_lease(lease)?;
            state
                .give_back(message_id, reason, Instant::now(), self.clock.as_ref())
                .ok_or(QueueError::UnknownMessage(message_id))?
        };
        self.notify.notify_one();
        Ok(outcome)
    }

    async fn defer(&self, lease: &Lease, delay: Duration) -> Result<(), QueueError> {
        let message_id = lease.message_id();
        {
            let mut state = self.state.lock().await;
            state.end_lease(lease)?;
            let item = state
                .messages
                .get_mut(&message_id)
                .ok_or(QueueError::UnknownMessage(message_id))?;
            item.delivery_attempt = item.delivery_attempt.saturating_sub(1);
            state.schedule(message_id, delay, Instant::now());
            debug!(%message_id, ?delay, "message deferred");
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        let state = self.state.lock().await;
        Ok(state.dead.clone())
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let state = self.state.lock().await;
        Ok(state.counts())
    }
}
