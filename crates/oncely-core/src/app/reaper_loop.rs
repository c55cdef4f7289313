//! ReaperLoop - 期限切れ record の回収
//!
//! # フロー
//! 1. RecordStore::scan_expired() で `expires_at < now` の record を取得
//! 2. まだ生きている owner がいる PROCESSING record は飛ばす
//! 3. 観測した state を条件に delete_if_state() で削除
//! 4. scan_stale() で放置された PENDING/PROCESSING を数えて警告（回収は次の submit / 配送が行う）
//!
//! 空き容量のための処理で、正しさには関与しない。TTL はクライアントの
//! リトライ期間より十分長くしておくこと。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::app::config::ReaperConfig;
use crate::domain::RecordState;
use crate::domain::record::span;
use crate::ports::{Clock, DeleteResult, RecordStore, StoreError};

/// Result of one reaper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub scanned: usize,
    pub deleted: usize,

    /// Live owners, or records that changed between scan and delete.
    pub skipped: usize,

    /// Open records past the processing timeout, waiting to be reclaimed.
    pub stale: usize,
}

pub struct ExpiryReaper {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    processing_timeout: Duration,
    config: ReaperConfig,
}

impl ExpiryReaper {
    pub fn new(
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        processing_timeout: Duration,
        config: ReaperConfig,
    ) -> Self {
        Self {
            store,
            clock,
            processing_timeout,
            config,
        }
    }

    /// One pass over at most `batch_size` expired records.
    pub async fn reap_once(&self) -> Result<ReapReport, StoreError> {
        let now = self.clock.now();
        let expired = self.store.scan_expired(now, self.config.batch_size).await?;
        let mut report = ReapReport {
            scanned: expired.len(),
            ..ReapReport::default()
        };

        for record in expired {
            // reclaimed records keep their original expiry
            if record.state == RecordState::Processing
                && !record.is_stale(now, self.processing_timeout)
            {
                debug!(key = %record.key, "expired record still has a live owner; skipping");
                report.skipped += 1;
                continue;
            }
            match self.store.delete_if_state(&record.key, record.state).await? {
                DeleteResult::Deleted => report.deleted += 1,
                DeleteResult::StateMismatch | DeleteResult::NotFound => report.skipped += 1,
            }
        }

        let cutoff = now
            .checked_sub_signed(span(self.processing_timeout))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let stale = self.store.scan_stale(cutoff, self.config.batch_size).await?;
        report.stale = stale.len();
        for record in &stale {
            warn!(
                key = %record.key,
                state = %record.state,
                attempt = record.attempt,
                last_update = %record.updated_at,
                "orphaned record awaiting reclaim"
            );
        }

        if report.deleted > 0 {
            info!(
                scanned = report.scanned,
                deleted = report.deleted,
                skipped = report.skipped,
                "reaped expired records"
            );
        }
        Ok(report)
    }

    /// Reap every `interval` until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.reap_once().await {
                        error!(error = %err, "reaper pass failed");
                    }
                }
            }
        }
        debug!("reaper stopped");
    }

    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Completion, IdempotencyKey, IdempotencyRecord, OwnerToken};
    use crate::impls::InMemoryRecordStore;
    use crate::ports::FixedClock;
    use chrono::TimeZone;
    use ulid::Ulid;

    const TTL: Duration = Duration::from_secs(3600);

    fn key(s: &str) -> IdempotencyKey {
        IdempotencyKey::parse(s).unwrap()
    }

    fn setup() -> (ExpiryReaper, Arc<InMemoryRecordStore>, FixedClock) {
        let store = Arc::new(InMemoryRecordStore::new());
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
        let reaper = ExpiryReaper::new(
            store.clone(),
            Arc::new(clock.clone()),
            Duration::from_secs(30),
            ReaperConfig::default(),
        );
        (reaper, store, clock)
    }

    #[tokio::test]
    async fn expired_terminal_records_are_deleted() {
        let (reaper, store, clock) = setup();
        let owner = OwnerToken::from_ulid(Ulid::new());
        store
            .put(IdempotencyRecord::processing(key("done"), owner, clock.now(), TTL))
            .await;
        store
            .update_if_owner(&key("done"), owner, Completion::Completed(b"1".to_vec()), clock.now())
            .await
            .unwrap();
        store
            .put(IdempotencyRecord::pending(key("fresh"), clock.now(), TTL * 2))
            .await;

        clock.advance(TTL + Duration::from_secs(1));
        let report = reaper.reap_once().await.unwrap();

        assert_eq!(
            report,
            ReapReport {
                scanned: 1,
                deleted: 1,
                skipped: 0,
                stale: 1,
            }
        );
        assert!(store.get(&key("done")).await.unwrap().is_none());
        // untouched PENDING record is reported, not deleted
        assert!(store.get(&key("fresh")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn live_owner_is_not_reaped() {
        let (reaper, store, clock) = setup();
        let mut record = IdempotencyRecord::processing(
            key("busy"),
            OwnerToken::from_ulid(Ulid::new()),
            clock.now(),
            TTL,
        );
        clock.advance(TTL + Duration::from_secs(1));
        // owner wrote a moment ago, expiry left where it was
        record.updated_at = clock.now();
        store.put(record).await;

        let report = reaper.reap_once().await.unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(report.deleted, 0);
        assert!(store.get(&key("busy")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn reclaimed_record_outlives_its_original_expiry() {
        let (reaper, store, clock) = setup();
        store
            .put(IdempotencyRecord::processing(
                key("late"),
                OwnerToken::from_ulid(Ulid::new()),
                clock.now(),
                TTL,
            ))
            .await;
        clock.advance(TTL - Duration::from_secs(10));
        let record = store.get(&key("late")).await.unwrap().unwrap();
        let winner = OwnerToken::from_ulid(Ulid::new());
        store
            .transfer_ownership(&key("late"), record.ownership(), winner, clock.now())
            .await
            .unwrap();
        store
            .update_if_owner(&key("late"), winner, Completion::Completed(b"ok".to_vec()), clock.now())
            .await
            .unwrap();

        clock.advance(Duration::from_secs(60));
        let report = reaper.reap_once().await.unwrap();

        assert_eq!(report.deleted, 0);
        assert!(store.get(&key("late")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn outage_is_reported() {
        let (reaper, store, _) = setup();
        store.set_available(false);

        assert!(matches!(
            reaper.reap_once().await,
            Err(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown() {
        let (reaper, _, _) = setup();
        let (tx, rx) = watch::channel(false);
        let join = Arc::new(reaper).spawn(rx);

        tokio::time::sleep(Duration::from_secs(120)).await;
        tx.send(true).unwrap();

        join.await.unwrap();
    }
}
