#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::ser::Error as _;
use serde::{Deserialize, Serialize};

use oncely_core::app::{CoordinatorConfig, QueueConfig, Worker, WorkerConfig};
use oncely_core::domain::{DeadLetter, Lease, QueueCounts, WorkItem};
use oncely_core::impls::{InMemoryRecordStore, InMemoryWorkQueue};
use oncely_core::ports::{FixedClock, QueueError, ReleaseOutcome, WorkQueue};
use oncely_core::typed::{AttemptContext, Operation, Rejection, Request, TypedOperation};
use oncely_core::{Coordinator, IdempotencyKey, QueuedCoordinator};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Charge {
    pub amount: u64,
}

/// Always fails to serialize; used to make a result unencodable.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Poison;

impl Serialize for Poison {
    fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
        Err(S::Error::custom("receipt cannot be encoded"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub ok: bool,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poison: Option<Poison>,
}

impl Request for Charge {
    const OPERATION: &'static str = "test.charge.v1";
    type Response = Receipt;
}

#[derive(Debug, Clone)]
pub enum Step {
    Succeed(String),
    Reject(String),
    Unencodable,
}

/// Instrumented operation: counts calls, tracks overlapping executions and
/// answers from a script (then from `fallback`).
pub struct Recorder {
    calls: AtomicU32,
    active: AtomicU32,
    max_active: AtomicU32,
    delay: Duration,
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
}

impl Recorder {
    pub fn new(fallback: Step) -> Self {
        Self {
            calls: AtomicU32::new(0),
            active: AtomicU32::new(0),
            max_active: AtomicU32::new(0),
            delay: Duration::ZERO,
            script: Mutex::new(VecDeque::new()),
            fallback,
        }
    }

    pub fn succeeding(id: &str) -> Self {
        Self::new(Step::Succeed(id.to_string()))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_script(self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.script.lock().unwrap().extend(steps);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> u32 {
        self.max_active.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Step {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl Operation<Charge> for Arc<Recorder> {
    async fn execute(&self, _ctx: &AttemptContext, _request: Charge) -> Result<Receipt, Rejection> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.next_step();
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        match step {
            Step::Succeed(id) => Ok(Receipt {
                ok: true,
                id,
                poison: None,
            }),
            Step::Reject(reason) => Err(Rejection::new(reason)),
            Step::Unencodable => Ok(Receipt {
                ok: true,
                id: "unencodable".into(),
                poison: Some(Poison),
            }),
        }
    }
}

pub fn key(s: &str) -> IdempotencyKey {
    IdempotencyKey::parse(s).unwrap()
}

pub fn payload() -> Vec<u8> {
    serde_json::to_vec(&Charge { amount: 1000 }).unwrap()
}

pub fn receipt_bytes(id: &str) -> Vec<u8> {
    serde_json::to_vec(&Receipt {
        ok: true,
        id: id.to_string(),
        poison: None,
    })
    .unwrap()
}

pub struct Harness {
    pub store: Arc<InMemoryRecordStore>,
    pub clock: FixedClock,
    pub recorder: Arc<Recorder>,
    pub coordinator: Arc<Coordinator>,
}

pub fn harness(recorder: Recorder, config: CoordinatorConfig) -> Harness {
    let store = Arc::new(InMemoryRecordStore::new());
    let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
    let recorder = Arc::new(recorder);
    let operation = TypedOperation::<Charge, _>::new(Arc::clone(&recorder));
    let coordinator = Coordinator::new(store.clone(), Arc::new(operation), config)
        .with_clock(Arc::new(clock.clone()));
    Harness {
        store,
        clock,
        recorder,
        coordinator: Arc::new(coordinator),
    }
}

pub struct QueuedHarness {
    pub base: Harness,
    pub queue: Arc<InMemoryWorkQueue>,
    pub queued: QueuedCoordinator,
}

impl QueuedHarness {
    pub fn worker(&self, config: WorkerConfig) -> Worker {
        Worker::new(
            0,
            self.queue.clone(),
            Arc::clone(&self.base.coordinator),
            config,
        )
    }
}

pub fn queued_harness(recorder: Recorder, queue_config: QueueConfig) -> QueuedHarness {
    let base = harness(recorder, CoordinatorConfig::default());
    let queue = Arc::new(InMemoryWorkQueue::new(queue_config));
    let queued = QueuedCoordinator::new(Arc::clone(&base.coordinator), queue.clone());
    QueuedHarness {
        base,
        queue,
        queued,
    }
}

/// A queue that is down: every write fails, nothing is ever delivered.
pub struct FailingQueue;

#[async_trait]
impl WorkQueue for FailingQueue {
    async fn enqueue(&self, _item: WorkItem) -> Result<(), QueueError> {
        Err(QueueError::Unavailable("queue switched off".into()))
    }

    async fn lease(&self, _wait: Duration) -> Result<Option<Lease>, QueueError> {
        Ok(None)
    }

    async fn ack(&self, lease: &Lease) -> Result<(), QueueError> {
        Err(QueueError::UnknownMessage(lease.message_id()))
    }

    async fn release(&self, lease: &Lease, _reason: String) -> Result<ReleaseOutcome, QueueError> {
        Err(QueueError::UnknownMessage(lease.message_id()))
    }

    async fn defer(&self, lease: &Lease, _delay: Duration) -> Result<(), QueueError> {
        Err(QueueError::UnknownMessage(lease.message_id()))
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        Ok(Vec::new())
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        Ok(QueueCounts::default())
    }
}
