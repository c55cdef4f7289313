//! Request trait - 型付きリクエストの定義
//!
//! # 学習ポイント
//! - Associated Constants (`const OPERATION`)
//! - Associated Types (`type Response`)
//! - Trait bounds の組み合わせ (Serialize + DeserializeOwned + Send + Sync + 'static)

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Request は operation 名とリクエスト/レスポンスの型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct ChargePayment {
///     order_id: String,
///     amount: u64,
/// }
///
/// impl Request for ChargePayment {
///     const OPERATION: &'static str = "payments.charge.v1";
///     type Response = PaymentReceipt;
/// }
/// ```
///
/// # Trait Bounds
/// - `Serialize` / `DeserializeOwned`: payload は bytes として store / queue を通る
/// - `Send + Sync + 'static`: Arc に格納して worker 間で共有するため
pub trait Request: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// operation 名
    ///
    /// # 命名規約
    /// - `{domain}.{action}.v{major}`
    /// - 例: `payments.charge.v1`
    const OPERATION: &'static str;

    /// 成功時の結果。record にはこれをエンコードした bytes が残る。
    type Response: Serialize + DeserializeOwned + Send + Sync + 'static;
}

// テスト用のリクエスト型
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct EchoRequest {
    pub value: i32,
}

#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct EchoResponse {
    pub value: i32,
    pub attempt: u32,
}

#[cfg(test)]
impl Request for EchoRequest {
    const OPERATION: &'static str = "test.echo.v1";
    type Response = EchoResponse;
}
