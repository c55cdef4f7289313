//! Operation trait - 冪等に実行したい処理の定義
//!
//! # 学習ポイント
//! - ジェネリック trait (Operation<R>)
//! - Object-safe trait (DynOperation)
//! - Type erasure パターン (TypedOperation<R, O> → DynOperation)
//!
//! Coordinator が持つのは `Arc<dyn DynOperation>` だけで、bytes しか扱わない。

use std::fmt;
use std::marker::PhantomData;

use async_trait::async_trait;

use super::codec::{CodecError, JsonCodec};
use super::request::Request;
use crate::domain::{IdempotencyKey, OwnerToken};

/// What an owner knows about the attempt it is executing.
///
/// `(key, attempt)` is unique per ownership grant. An operation with an
/// external side effect should pass it downstream (e.g. as the provider's own
/// idempotency key) so that a stale owner and its reclaimer can't both apply
/// the effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptContext {
    pub key: IdempotencyKey,
    pub owner_token: OwnerToken,

    /// 1 for the first owner, incremented on every claim/reclaim.
    pub attempt: u32,
}

impl AttemptContext {
    /// Stable identifier for this attempt, e.g. `order-42#2`.
    pub fn attempt_id(&self) -> String {
        format!("{}#{}", self.key, self.attempt)
    }
}

/// Business-level refusal. The reason is recorded verbatim in the FAILED record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub reason: String,
}

impl Rejection {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

/// Every way an attempt can end without a result.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("{0}")]
    Business(String),

    #[error("request payload could not be decoded: {0}")]
    Decode(#[source] CodecError),

    #[error("result could not be encoded: {0}")]
    Encode(#[source] CodecError),
}

impl OperationError {
    /// Reason stored in the FAILED record.
    pub fn failure_reason(&self) -> String {
        self.to_string()
    }
}

impl From<Rejection> for OperationError {
    fn from(rejection: Rejection) -> Self {
        OperationError::Business(rejection.reason)
    }
}

/// Operation は Request を実行して Response を返す
///
/// # 使用例
/// ```ignore
/// struct Charge;
///
/// #[async_trait]
/// impl Operation<ChargePayment> for Charge {
///     async fn execute(
///         &self,
///         ctx: &AttemptContext,
///         request: ChargePayment,
///     ) -> Result<PaymentReceipt, Rejection> {
///         gateway.charge(&ctx.attempt_id(), request.amount).await
///     }
/// }
/// ```
///
/// # ジェネリクスによる型安全性
/// - `Operation<ChargePayment>` は `ChargePayment` しか受け取れない
/// - 戻り値の型も `ChargePayment::Response` に固定される
#[async_trait]
pub trait Operation<R: Request>: Send + Sync {
    async fn execute(&self, ctx: &AttemptContext, request: R) -> Result<R::Response, Rejection>;
}

/// DynOperation は object-safe な Operation の抽象化
///
/// # Object Safety
/// - メソッドはジェネリックではない（bytes in, bytes out）
/// - `Arc<dyn DynOperation>` として Coordinator に渡せる
#[async_trait]
pub trait DynOperation: Send + Sync {
    async fn execute_dyn(
        &self,
        ctx: &AttemptContext,
        payload: &[u8],
    ) -> Result<Vec<u8>, OperationError>;

    fn name(&self) -> &str;
}

pub struct TypedOperation<R: Request, O: Operation<R>> {
    operation: O,
    _marker: PhantomData<fn() -> R>,
}

impl<R: Request, O: Operation<R>> TypedOperation<R, O> {
    pub fn new(operation: O) -> Self {
        Self {
            operation,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<R: Request, O: Operation<R>> DynOperation for TypedOperation<R, O> {
    async fn execute_dyn(
        &self,
        ctx: &AttemptContext,
        payload: &[u8],
    ) -> Result<Vec<u8>, OperationError> {
        let request: R = JsonCodec::decode(payload).map_err(OperationError::Decode)?;
        let response = self.operation.execute(ctx, request).await?;
        JsonCodec::encode(&response).map_err(OperationError::Encode)
    }

    fn name(&self) -> &str {
        R::OPERATION
    }
}
