//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 開発体験の改善（明確なエラーメッセージ）

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::config::{CoordinatorConfig, QueueConfig, ReaperConfig, WorkerConfig};
use crate::app::coordinator::Coordinator;
use crate::app::queued::QueuedCoordinator;
use crate::app::reaper_loop::ExpiryReaper;
use crate::app::status::StatusSnapshot;
use crate::app::worker_loop::WorkerGroup;
use crate::domain::CoordinatorError;
use crate::impls::{InMemoryRecordStore, InMemoryWorkQueue};
use crate::ports::{Clock, RecordStore, SystemClock, WorkQueue};
use crate::typed::{DynOperation, Operation, Request, TypedOperation};

/// AppBuilder はアプリケーションを構築
///
/// # 使用例
/// ```ignore
/// let app = AppBuilder::new()
///     .operation::<ChargePayment, _>(Charge::new(gateway))
///     .coordinator_config(CoordinatorConfig::default())
///     .build()?;
/// let running = app.start();
/// ```
///
/// # Fail-fast 設計
/// - operation 未登録は BuildError::MissingOperation
/// - 矛盾した設定（TTL ≤ processing timeout など）は BuildError::InvalidConfig
/// - store / queue / clock を渡さなければ in-memory 実装と SystemClock を使う
pub struct AppBuilder {
    operation: Option<Arc<dyn DynOperation>>,
    store: Option<Arc<dyn RecordStore>>,
    queue: Option<Arc<dyn WorkQueue>>,
    clock: Option<Arc<dyn Clock>>,
    coordinator_config: CoordinatorConfig,
    queue_config: QueueConfig,
    worker_config: WorkerConfig,
    reaper_config: ReaperConfig,
}

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no operation registered; call AppBuilder::operation before build")]
    MissingOperation,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            operation: None,
            store: None,
            queue: None,
            clock: None,
            coordinator_config: CoordinatorConfig::default(),
            queue_config: QueueConfig::default(),
            worker_config: WorkerConfig::default(),
            reaper_config: ReaperConfig::default(),
        }
    }

    /// Operation を登録
    ///
    /// # Example
    /// ```ignore
    /// builder.operation::<ChargePayment, _>(Charge::new(gateway));
    /// ```
    pub fn operation<R: Request, O: Operation<R> + 'static>(mut self, operation: O) -> Self {
        self.operation = Some(Arc::new(TypedOperation::<R, O>::new(operation)));
        self
    }

    /// 型消去済みの operation をそのまま登録
    pub fn dyn_operation(mut self, operation: Arc<dyn DynOperation>) -> Self {
        self.operation = Some(operation);
        self
    }

    pub fn store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn queue(mut self, queue: Arc<dyn WorkQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn coordinator_config(mut self, config: CoordinatorConfig) -> Self {
        self.coordinator_config = config;
        self
    }

    pub fn queue_config(mut self, config: QueueConfig) -> Self {
        self.queue_config = config;
        self
    }

    pub fn worker_config(mut self, config: WorkerConfig) -> Self {
        self.worker_config = config;
        self
    }

    pub fn reaper_config(mut self, config: ReaperConfig) -> Self {
        self.reaper_config = config;
        self
    }

    /// 設定を検証して App を生成
    pub fn build(self) -> Result<App, BuildError> {
        let operation = self.operation.ok_or(BuildError::MissingOperation)?;
        validate(
            &self.coordinator_config,
            &self.queue_config,
            &self.worker_config,
            &self.reaper_config,
        )?;

        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let store: Arc<dyn RecordStore> = match self.store {
            Some(store) => store,
            None => Arc::new(InMemoryRecordStore::new()),
        };
        let queue: Arc<dyn WorkQueue> = match self.queue {
            Some(queue) => queue,
            None => Arc::new(InMemoryWorkQueue::with_clock(
                self.queue_config,
                Arc::clone(&clock),
            )),
        };

        let coordinator = Arc::new(
            Coordinator::new(
                Arc::clone(&store),
                operation,
                self.coordinator_config.clone(),
            )
            .with_clock(Arc::clone(&clock)),
        );
        let queued = Arc::new(QueuedCoordinator::new(Arc::clone(&coordinator), queue));
        let reaper = Arc::new(ExpiryReaper::new(
            store,
            clock,
            self.coordinator_config.processing_timeout,
            self.reaper_config,
        ));

        Ok(App {
            coordinator,
            queued,
            reaper,
            worker_config: self.worker_config,
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn validate(
    coordinator: &CoordinatorConfig,
    queue: &QueueConfig,
    workers: &WorkerConfig,
    reaper: &ReaperConfig,
) -> Result<(), BuildError> {
    let invalid = |msg: String| Err(BuildError::InvalidConfig(msg));

    if coordinator.processing_timeout.is_zero() {
        return invalid("processing_timeout must be positive".into());
    }
    if coordinator.record_ttl <= coordinator.processing_timeout {
        return invalid(format!(
            "record_ttl ({:?}) must exceed processing_timeout ({:?})",
            coordinator.record_ttl, coordinator.processing_timeout
        ));
    }
    if coordinator.min_retry_after > coordinator.max_retry_after {
        return invalid(format!(
            "min_retry_after ({:?}) exceeds max_retry_after ({:?})",
            coordinator.min_retry_after, coordinator.max_retry_after
        ));
    }
    if queue.max_delivery_attempts == 0 {
        return invalid("max_delivery_attempts must be at least 1".into());
    }
    if queue.visibility_timeout <= coordinator.processing_timeout {
        // otherwise a slow but live attempt is redelivered and charged as a failure
        return invalid(format!(
            "visibility_timeout ({:?}) must exceed processing_timeout ({:?})",
            queue.visibility_timeout, coordinator.processing_timeout
        ));
    }
    if workers.workers == 0 {
        return invalid("at least one worker is required".into());
    }
    if reaper.interval.is_zero() || reaper.batch_size == 0 {
        return invalid("reaper interval and batch_size must be positive".into());
    }
    Ok(())
}

/// App はワイヤリング済みのコンポーネント一式
pub struct App {
    coordinator: Arc<Coordinator>,
    queued: Arc<QueuedCoordinator>,
    reaper: Arc<ExpiryReaper>,
    worker_config: WorkerConfig,
}

impl App {
    /// Synchronous path.
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Queued path. Needs `start()` for anything to be processed.
    pub fn queued(&self) -> &Arc<QueuedCoordinator> {
        &self.queued
    }

    pub fn reaper(&self) -> &Arc<ExpiryReaper> {
        &self.reaper
    }

    /// Spawn the worker group and the expiry reaper.
    pub fn start(&self) -> RunningApp {
        let workers = WorkerGroup::spawn(
            &self.worker_config,
            Arc::clone(self.queued.queue()),
            Arc::clone(&self.coordinator),
        );
        let (reaper_tx, reaper_rx) = watch::channel(false);
        let reaper = Arc::clone(&self.reaper).spawn(reaper_rx);
        info!(operation = self.coordinator.operation_name(), "app started");

        RunningApp {
            workers,
            reaper_tx,
            reaper,
        }
    }

    pub async fn status(&self) -> Result<StatusSnapshot, CoordinatorError> {
        self.queued.snapshot().await
    }
}

/// Background tasks of a started App.
pub struct RunningApp {
    workers: WorkerGroup,
    reaper_tx: watch::Sender<bool>,
    reaper: JoinHandle<()>,
}

impl RunningApp {
    /// Stop taking new work and wait for in-flight work to finish.
    pub async fn shutdown(self) {
        let _ = self.reaper_tx.send(true);
        self.workers.shutdown_and_join().await;
        if let Err(err) = self.reaper.await {
            error!(error = %err, "reaper task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{IdempotencyKey, Outcome, PollResult, SubmitReceipt};
    use crate::typed::request::{EchoRequest, EchoResponse};
    use crate::typed::{AttemptContext, Rejection};
    use async_trait::async_trait;
    use std::time::Duration;

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

    #[test]
    fn test_build_success() {
        let app = AppBuilder::new().operation::<EchoRequest, _>(Echo).build();
        assert!(app.is_ok());
    }

    #[test]
    fn test_build_missing_operation() {
        let app = AppBuilder::new().build();
        assert!(matches!(app, Err(BuildError::MissingOperation)));
    }

    #[test]
    fn test_build_rejects_ttl_shorter_than_processing_timeout() {
        let app = AppBuilder::new()
            .operation::<EchoRequest, _>(Echo)
            .coordinator_config(
                CoordinatorConfig::default()
                    .with_processing_timeout(Duration::from_secs(60))
                    .with_record_ttl(Duration::from_secs(60)),
            )
            .build();
        assert!(matches!(app, Err(BuildError::InvalidConfig(msg)) if msg.contains("record_ttl")));
    }

    #[test]
    fn test_build_rejects_visibility_not_longer_than_processing_timeout() {
        let app = AppBuilder::new()
            .operation::<EchoRequest, _>(Echo)
            .queue_config(QueueConfig::default().with_visibility_timeout(Duration::from_secs(30)))
            .build();
        assert!(
            matches!(app, Err(BuildError::InvalidConfig(msg)) if msg.contains("visibility_timeout"))
        );
    }

    #[test]
    fn test_build_rejects_zero_workers() {
        let app = AppBuilder::new()
            .operation::<EchoRequest, _>(Echo)
            .worker_config(WorkerConfig::default().with_workers(0))
            .build();
        assert!(matches!(app, Err(BuildError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn started_app_drains_queued_requests() {
        let app = AppBuilder::new()
            .operation::<EchoRequest, _>(Echo)
            .worker_config(
                WorkerConfig::default()
                    .with_workers(2)
                    .with_lease_wait(Duration::from_millis(20)),
            )
            .build()
            .unwrap();
        let running = app.start();
        let key = IdempotencyKey::parse("K").unwrap();

        let receipt = app.queued().submit(&key, br#"{"value":8}"#).await.unwrap();
        assert_eq!(receipt, SubmitReceipt::Accepted);

        let mut result = PollResult::NotFound;
        for _ in 0..200 {
            result = app.queued().poll(&key).await.unwrap();
            if matches!(&result, PollResult::Ready(outcome) if outcome.is_terminal()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        running.shutdown().await;

        assert_eq!(
            result,
            PollResult::Ready(Outcome::Completed(br#"{"value":8,"attempt":1}"#.to_vec()))
        );
        let status = app.status().await.unwrap();
        assert_eq!(status.records.completed, 1);
        assert!(status.queue.is_drained());
    }
}
