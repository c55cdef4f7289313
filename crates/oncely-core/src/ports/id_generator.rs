//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（本番用）

use ulid::Ulid;

use crate::domain::ids::{MessageId, OwnerToken};
use crate::ports::Clock;

/// IdGenerator は分散システムで使える ID を生成
///
/// Owner tokens must be unique across every instance sharing a store; ULIDs
/// need no coordination for that.
pub trait IdGenerator: Send + Sync {
    fn owner_token(&self) -> OwnerToken;

    fn message_id(&self) -> MessageId;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// timestamp 部分は Clock から取るので、FixedClock を使えば決定的になる
/// （ランダム部分は別）。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = u64::try_from(self.clock.now().timestamp_millis()).unwrap_or(0);
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn owner_token(&self) -> OwnerToken {
        OwnerToken::from(self.next())
    }

    fn message_id(&self) -> MessageId {
        MessageId::from(self.next())
    }
}
