//! InMemoryRecordStore - 開発・テスト用の RecordStore
//!
//! # 実装詳細
//! - HashMap<IdempotencyKey, IdempotencyRecord> を tokio の Mutex 1 つで保護
//! - 各操作はロック 1 回で完結する（= 1 行アトミック）
//! - `set_available(false)` で store 障害を再現できる
//! - `fail_next_create()` で「書けたのに応答が失われた」などの中断を再現できる

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{
    Completion, IdempotencyKey, IdempotencyRecord, OwnerToken, Ownership, RecordCounts,
    RecordState,
};
use crate::ports::{
    CreateResult, DeleteResult, RecordStore, StoreError, TransferResult, UpdateResult,
};

/// Fault injected into the next `try_create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateFault {
    /// The insert is applied but the caller gets `Unavailable` (lost reply).
    LostReply,
    /// The call fails before touching anything.
    Rejected,
}

#[derive(Default)]
pub struct InMemoryRecordStore {
    records: Arc<Mutex<HashMap<IdempotencyKey, IdempotencyRecord>>>,
    unavailable: AtomicBool,
    create_fault: Mutex<Option<CreateFault>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while unavailable every call fails without touching data.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Make the next `try_create` fail with `fault`; later calls behave normally.
    pub async fn fail_next_create(&self, fault: CreateFault) {
        *self.create_fault.lock().await = Some(fault);
    }

    /// Write a record unconditionally (fixtures only).
    pub async fn put(&self, record: IdempotencyRecord) {
        let mut records = self.records.lock().await;
        records.insert(record.key.clone(), record);
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "in-memory store switched off".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn try_create(&self, record: IdempotencyRecord) -> Result<CreateResult, StoreError> {
        self.check_available()?;
        let fault = self.create_fault.lock().await.take();
        if fault == Some(CreateFault::Rejected) {
            return Err(StoreError::Unavailable("injected create failure".to_string()));
        }
        let mut records = self.records.lock().await;
        if let Some(existing) = records.get(&record.key) {
            return Ok(CreateResult::AlreadyExists(existing.clone()));
        }
        records.insert(record.key.clone(), record);
        if fault == Some(CreateFault::LostReply) {
            return Err(StoreError::Unavailable("injected lost reply".to_string()));
        }
        Ok(CreateResult::Created)
    }

    async fn update_if_owner(
        &self,
        key: &IdempotencyKey,
        owner: OwnerToken,
        completion: Completion,
        now: DateTime<Utc>,
    ) -> Result<UpdateResult, StoreError> {
        self.check_available()?;
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(key) else {
            return Ok(UpdateResult::NotFound);
        };
        if record.state != RecordState::Processing || record.owner_token != Some(owner) {
            return Ok(UpdateResult::OwnerMismatch);
        }
        record.apply(completion, now);
        Ok(UpdateResult::Updated)
    }

    async fn transfer_ownership(
        &self,
        key: &IdempotencyKey,
        expected: Ownership,
        new_owner: OwnerToken,
        now: DateTime<Utc>,
    ) -> Result<TransferResult, StoreError> {
        self.check_available()?;
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(key) else {
            return Ok(TransferResult::NotFound);
        };
        if record.state.is_terminal() || !expected.matches(record) {
            return Ok(TransferResult::Conflict(record.clone()));
        }
        record.grant(new_owner, now);
        Ok(TransferResult::Acquired(record.clone()))
    }

    async fn requeue(
        &self,
        key: &IdempotencyKey,
        expected: Ownership,
        now: DateTime<Utc>,
    ) -> Result<TransferResult, StoreError> {
        self.check_available()?;
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(key) else {
            return Ok(TransferResult::NotFound);
        };
        if record.state.is_terminal() || !expected.matches(record) {
            return Ok(TransferResult::Conflict(record.clone()));
        }
        record.requeue(now);
        Ok(TransferResult::Acquired(record.clone()))
    }

    async fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, StoreError> {
        self.check_available()?;
        let records = self.records.lock().await;
        Ok(records.get(key).cloned())
    }

    async fn delete_if_state(
        &self,
        key: &IdempotencyKey,
        expected: RecordState,
    ) -> Result<DeleteResult, StoreError> {
        self.check_available()?;
        let mut records = self.records.lock().await;
        match records.get(key) {
            None => Ok(DeleteResult::NotFound),
            Some(record) if record.state != expected => Ok(DeleteResult::StateMismatch),
            Some(_) => {
                records.remove(key);
                Ok(DeleteResult::Deleted)
            }
        }
    }

    async fn scan_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<IdempotencyRecord>, StoreError> {
        self.check_available()?;
        let records = self.records.lock().await;
        let mut expired: Vec<IdempotencyRecord> = records
            .values()
            .filter(|r| r.is_expired(now))
            .cloned()
            .collect();
        expired.sort_by_key(|r| r.expires_at);
        expired.truncate(limit);
        Ok(expired)
    }

    async fn scan_stale(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<IdempotencyRecord>, StoreError> {
        self.check_available()?;
        let records = self.records.lock().await;
        let mut stale: Vec<IdempotencyRecord> = records
            .values()
            .filter(|r| !r.state.is_terminal() && r.updated_at < cutoff)
            .cloned()
            .collect();
        stale.sort_by_key(|r| r.updated_at);
        stale.truncate(limit);
        Ok(stale)
    }

    async fn counts(&self) -> Result<RecordCounts, StoreError> {
        self.check_available()?;
        let records = self.records.lock().await;
        let mut counts = RecordCounts::default();
        for record in records.values() {
            counts.add(record.state);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn key(s: &str) -> IdempotencyKey {
        IdempotencyKey::parse(s).unwrap()
    }

    fn token() -> OwnerToken {
        OwnerToken::from_ulid(Ulid::new())
    }

    fn processing(k: &str, owner: OwnerToken) -> IdempotencyRecord {
        IdempotencyRecord::processing(key(k), owner, t0(), Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn try_create_admits_exactly_one() {
        let store = InMemoryRecordStore::new();
        let first = token();

        let a = store.try_create(processing("K", first)).await.unwrap();
        let b = store.try_create(processing("K", token())).await.unwrap();

        assert_eq!(a, CreateResult::Created);
        match b {
            CreateResult::AlreadyExists(existing) => {
                assert_eq!(existing.owner_token, Some(first))
            }
            other => panic!("expected AlreadyExists, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_creates_have_one_winner() {
        let store = Arc::new(InMemoryRecordStore::new());
        let mut joins = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            joins.push(tokio::spawn(async move {
                store.try_create(processing("K", token())).await.unwrap()
            }));
        }

        let mut created = 0;
        for join in joins {
            if join.await.unwrap() == CreateResult::Created {
                created += 1;
            }
        }
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn update_requires_current_owner() {
        let store = InMemoryRecordStore::new();
        let owner = token();
        store.try_create(processing("K", owner)).await.unwrap();

        let wrong = store
            .update_if_owner(&key("K"), token(), Completion::Completed(b"x".to_vec()), t0())
            .await
            .unwrap();
        assert_eq!(wrong, UpdateResult::OwnerMismatch);

        let right = store
            .update_if_owner(&key("K"), owner, Completion::Completed(b"x".to_vec()), t0())
            .await
            .unwrap();
        assert_eq!(right, UpdateResult::Updated);

        // terminal records can't be written twice, even by their owner
        let again = store
            .update_if_owner(&key("K"), owner, Completion::Failed("late".into()), t0())
            .await
            .unwrap();
        assert_eq!(again, UpdateResult::OwnerMismatch);

        let missing = store
            .update_if_owner(&key("nope"), owner, Completion::Failed("x".into()), t0())
            .await
            .unwrap();
        assert_eq!(missing, UpdateResult::NotFound);
    }

    #[tokio::test]
    async fn transfer_is_compare_and_swap() {
        let store = InMemoryRecordStore::new();
        let original = token();
        store.try_create(processing("K", original)).await.unwrap();
        let expected = store.get(&key("K")).await.unwrap().unwrap().ownership();

        let winner = token();
        let later = t0() + chrono::Duration::seconds(60);
        let first = store
            .transfer_ownership(&key("K"), expected, winner, later)
            .await
            .unwrap();
        let second = store
            .transfer_ownership(&key("K"), expected, token(), later)
            .await
            .unwrap();

        match first {
            TransferResult::Acquired(r) => {
                assert_eq!(r.owner_token, Some(winner));
                assert_eq!(r.attempt, 2);
                assert_eq!(r.updated_at, later);
            }
            other => panic!("expected Acquired, got {other:?}"),
        }
        assert!(matches!(second, TransferResult::Conflict(r) if r.owner_token == Some(winner)));

        // the superseded owner can no longer commit
        let late = store
            .update_if_owner(&key("K"), original, Completion::Completed(b"late".to_vec()), later)
            .await
            .unwrap();
        assert_eq!(late, UpdateResult::OwnerMismatch);
    }

    #[tokio::test]
    async fn requeue_is_compare_and_swap_and_fences_the_owner() {
        let store = InMemoryRecordStore::new();
        let crashed = token();
        store.try_create(processing("K", crashed)).await.unwrap();
        let expected = store.get(&key("K")).await.unwrap().unwrap().ownership();
        let later = t0() + chrono::Duration::seconds(60);

        let first = store.requeue(&key("K"), expected, later).await.unwrap();
        let second = store.requeue(&key("K"), expected, later).await.unwrap();

        assert!(matches!(
            first,
            TransferResult::Acquired(r) if r.state == RecordState::Pending && r.owner_token.is_none()
        ));
        assert!(matches!(second, TransferResult::Conflict(_)));
        let late = store
            .update_if_owner(&key("K"), crashed, Completion::Completed(b"late".to_vec()), later)
            .await
            .unwrap();
        assert_eq!(late, UpdateResult::OwnerMismatch);
    }

    #[tokio::test]
    async fn lost_reply_still_writes_the_record() {
        let store = InMemoryRecordStore::new();
        let owner = token();
        store.fail_next_create(CreateFault::LostReply).await;

        let err = store.try_create(processing("K", owner)).await.unwrap_err();

        assert!(matches!(err, StoreError::Unavailable(_)));
        let written = store.get(&key("K")).await.unwrap().unwrap();
        assert_eq!(written.owner_token, Some(owner));
        // one-shot
        assert!(matches!(
            store.try_create(processing("K", token())).await.unwrap(),
            CreateResult::AlreadyExists(_)
        ));
    }

    #[tokio::test]
    async fn rejected_create_writes_nothing() {
        let store = InMemoryRecordStore::new();
        store.fail_next_create(CreateFault::Rejected).await;

        assert!(store.try_create(processing("K", token())).await.is_err());
        assert!(store.is_empty().await);
        assert_eq!(
            store.try_create(processing("K", token())).await.unwrap(),
            CreateResult::Created
        );
    }

    #[tokio::test]
    async fn delete_is_guarded_by_state() {
        let store = InMemoryRecordStore::new();
        let owner = token();
        store.try_create(processing("K", owner)).await.unwrap();

        assert_eq!(
            store.delete_if_state(&key("K"), RecordState::Failed).await.unwrap(),
            DeleteResult::StateMismatch
        );

        store
            .update_if_owner(&key("K"), owner, Completion::Failed("declined".into()), t0())
            .await
            .unwrap();
        assert_eq!(
            store.delete_if_state(&key("K"), RecordState::Failed).await.unwrap(),
            DeleteResult::Deleted
        );
        assert_eq!(
            store.delete_if_state(&key("K"), RecordState::Failed).await.unwrap(),
            DeleteResult::NotFound
        );
    }

    #[tokio::test]
    async fn scans_use_expiry_and_staleness() {
        let store = InMemoryRecordStore::new();
        store
            .put(IdempotencyRecord::pending(key("short"), t0(), Duration::from_secs(10)))
            .await;
        store
            .put(IdempotencyRecord::pending(key("long"), t0(), Duration::from_secs(1000)))
            .await;

        let later = t0() + chrono::Duration::seconds(11);
        let expired = store.scan_expired(later, 10).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].key, key("short"));

        let stale = store.scan_stale(later, 1).await.unwrap();
        assert_eq!(stale.len(), 1);
    }

    #[tokio::test]
    async fn outage_fails_every_call_without_writing() {
        let store = InMemoryRecordStore::new();
        store.set_available(false);

        let err = store.try_create(processing("K", token())).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));

        store.set_available(true);
        assert!(store.is_empty().await);
        assert_eq!(store.counts().await.unwrap(), RecordCounts::default());
    }
}
