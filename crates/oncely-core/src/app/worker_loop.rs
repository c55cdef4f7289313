//! WorkerLoop - queue を drain する worker 群
//!
//! # フロー
//! 1. WorkQueue::lease() で WorkItem 取得
//! 2. Coordinator::process() で arbitration + 実行
//! 3. Terminal なら ack、Deferred なら defer（配送回数に数えない）、error なら release
//!
//! ack は key が terminal になった後だけ。worker が途中で落ちたら queue の
//! visibility timeout で再配送される。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::app::config::WorkerConfig;
use crate::app::coordinator::{Coordinator, Processed};
use crate::domain::Lease;
use crate::ports::{QueueError, ReleaseOutcome, WorkQueue};

/// Worker group handle.
/// - `request_shutdown()` で全 worker が新しい lease を取らなくなる
/// - `shutdown_and_join()` で全 worker の終了を待てる
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `config.workers` workers.
    pub fn spawn(
        config: &WorkerConfig,
        queue: Arc<dyn WorkQueue>,
        coordinator: Arc<Coordinator>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(config.workers);
        for worker_id in 0..config.workers {
            let worker = Worker {
                id: worker_id,
                queue: Arc::clone(&queue),
                coordinator: Arc::clone(&coordinator),
                config: config.clone(),
            };
            let mut rx = shutdown_rx.clone();

            let join = tokio::spawn(async move {
                worker.run(&mut rx).await;
            });
            joins.push(join);
        }
        info!(workers = config.workers, "worker group started");

        Self { shutdown_tx, joins }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Request shutdown for all workers.
    /// In-flight operations are not cancelled; workers just stop taking new
    /// leases.
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for all workers.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(err) = join.await {
                error!(error = %err, "worker task ended abnormally");
            }
        }
        info!("worker group stopped");
    }
}

/// What a worker did with one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    /// Another owner holds the key; redelivered after `retry_after`.
    Deferred { retry_after: Duration },
    Released(ReleaseOutcome),
}

/// One worker. Also usable on its own (`drain_once`) for deterministic tests.
pub struct Worker {
    id: usize,
    queue: Arc<dyn WorkQueue>,
    coordinator: Arc<Coordinator>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        id: usize,
        queue: Arc<dyn WorkQueue>,
        coordinator: Arc<Coordinator>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id,
            queue,
            coordinator,
            config,
        }
    }

    async fn run(&self, shutdown_rx: &mut watch::Receiver<bool>) {
        loop {
            // shutdown が来ていたら抜ける
            if *shutdown_rx.borrow() {
                break;
            }

            // lease は待つ可能性があるので select で shutdown と競合させる
            let leased = tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        // sender dropped: nobody can stop us anymore, so stop now
                        break;
                    }
                    continue;
                }
                leased = self.queue.lease(self.config.lease_wait) => leased,
            };

            match leased {
                Ok(Some(lease)) => {
                    if let Err(err) = self.handle(lease).await {
                        error!(worker = self.id, error = %err, "queue rejected disposition");
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    error!(worker = self.id, error = %err, "lease failed");
                    tokio::time::sleep(self.config.lease_wait).await;
                }
            }
        }
        debug!(worker = self.id, "worker stopped");
    }

    /// Lease at most one item and handle it. `None` if nothing was ready
    /// within `lease_wait`.
    pub async fn drain_once(&self) -> Result<Option<Disposition>, QueueError> {
        match self.queue.lease(self.config.lease_wait).await? {
            Some(lease) => self.handle(lease).await.map(Some),
            None => Ok(None),
        }
    }

    async fn handle(&self, lease: Lease) -> Result<Disposition, QueueError> {
        let item = &lease.item;
        let message_id = item.message_id;
        debug!(
            worker = self.id,
            %message_id,
            key = %item.key,
            delivery = item.delivery_attempt,
            "work item leased"
        );

        match self.coordinator.process(item).await {
            Ok(Processed::Terminal(_)) => {
                self.queue.ack(&lease).await?;
                Ok(Disposition::Acked)
            }
            Ok(Processed::Deferred { retry_after }) => {
                debug!(worker = self.id, %message_id, ?retry_after, "key in flight; deferring");
                self.queue.defer(&lease, retry_after).await?;
                Ok(Disposition::Deferred { retry_after })
            }
            Err(err) => {
                warn!(
                    worker = self.id,
                    %message_id,
                    key = %item.key,
                    kind = ?err.kind(),
                    error = %err,
                    "processing failed; releasing for redelivery"
                );
                let outcome = self.queue.release(&lease, err.to_string()).await?;
                Ok(Disposition::Released(outcome))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::config::{CoordinatorConfig, QueueConfig};
    use crate::domain::{IdempotencyKey, IdempotencyRecord, MessageId, OwnerToken, WorkItem};
    use crate::impls::{InMemoryRecordStore, InMemoryWorkQueue};
    use crate::ports::RecordStore;
    use crate::typed::request::{EchoRequest, EchoResponse};
    use crate::typed::{AttemptContext, Operation, Rejection, TypedOperation};
    use async_trait::async_trait;
    use chrono::Utc;
    use ulid::Ulid;

    struct Echo;

    #[async_trait]
    impl Operation<EchoRequest> for Echo {
        async fn execute(
            &self,
            ctx: &AttemptContext,
            request: EchoRequest,
        ) -> Result<EchoResponse, Rejection> {
            Ok(EchoResponse {
                value: request.value,
                attempt: ctx.attempt,
            })
        }
    }

    fn worker() -> (Worker, Arc<InMemoryWorkQueue>, Arc<InMemoryRecordStore>) {
        let store = Arc::new(InMemoryRecordStore::new());
        let queue = Arc::new(InMemoryWorkQueue::new(QueueConfig::default()));
        let coordinator = Coordinator::new(
            store.clone(),
            Arc::new(TypedOperation::<EchoRequest, _>::new(Echo)),
            CoordinatorConfig::default(),
        );
        let config = WorkerConfig::default().with_lease_wait(Duration::ZERO);
        (
            Worker::new(0, queue.clone(), Arc::new(coordinator), config),
            queue,
            store,
        )
    }

    fn item(key: &str) -> WorkItem {
        WorkItem::new(
            MessageId::from_ulid(Ulid::new()),
            IdempotencyKey::parse(key).unwrap(),
            br#"{"value":1}"#.to_vec(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn terminal_processing_acks() {
        let (worker, queue, _) = worker();
        queue.enqueue(item("K")).await.unwrap();

        let disposition = worker.drain_once().await.unwrap();

        assert_eq!(disposition, Some(Disposition::Acked));
        assert!(queue.counts().await.unwrap().is_drained());
    }

    #[tokio::test]
    async fn live_owner_defers_with_retry_after() {
        let (worker, queue, store) = worker();
        store
            .try_create(IdempotencyRecord::processing(
                IdempotencyKey::parse("K").unwrap(),
                OwnerToken::from_ulid(Ulid::new()),
                Utc::now(),
                Duration::from_secs(3600),
            ))
            .await
            .unwrap();
        queue.enqueue(item("K")).await.unwrap();

        let disposition = worker.drain_once().await.unwrap();

        assert_eq!(
            disposition,
            Some(Disposition::Deferred {
                retry_after: Duration::from_secs(5)
            })
        );
        assert_eq!(queue.counts().await.unwrap().scheduled, 1);
        assert!(queue.dead_letters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_outage_releases_without_ack() {
        let (worker, queue, store) = worker();
        queue.enqueue(item("K")).await.unwrap();
        store.set_available(false);

        let disposition = worker.drain_once().await.unwrap();

        assert!(matches!(
            disposition,
            Some(Disposition::Released(ReleaseOutcome::Scheduled { .. }))
        ));
        assert_eq!(queue.counts().await.unwrap().scheduled, 1);
    }

    #[tokio::test]
    async fn empty_queue_drains_nothing() {
        let (worker, _, _) = worker();
        assert_eq!(worker.drain_once().await.unwrap(), None);
    }
}
