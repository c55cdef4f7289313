//! Simulated payment gateway used by the demo.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use ulid::Ulid;

use oncely_core::{AttemptContext, Operation, Rejection, Request};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub order_id: String,
    /// Minor units (cents).
    pub amount: u64,
    pub currency: String,
    pub customer_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReceipt {
    pub payment_id: String,
    pub order_id: String,
    pub amount: u64,
    pub currency: String,
    pub status: PaymentStatus,
    pub transaction_id: String,
    pub processed_at: DateTime<Utc>,
}

impl Request for PaymentRequest {
    const OPERATION: &'static str = "payments.charge.v1";
    type Response = PaymentReceipt;
}

/// Charges after a fixed delay. Can be told to decline the next charge.
pub struct SimulatedGateway {
    delay: Duration,
    charges: AtomicU32,
    decline_next: AtomicBool,
}

impl SimulatedGateway {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            charges: AtomicU32::new(0),
            decline_next: AtomicBool::new(false),
        })
    }

    pub fn decline_next(&self) {
        self.decline_next.store(true, Ordering::SeqCst);
    }

    /// Number of times the gateway was actually called.
    pub fn charges(&self) -> u32 {
        self.charges.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Operation<PaymentRequest> for Arc<SimulatedGateway> {
    async fn execute(
        &self,
        ctx: &AttemptContext,
        request: PaymentRequest,
    ) -> Result<PaymentReceipt, Rejection> {
        let n = self.charges.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            attempt_id = %ctx.attempt_id(),
            order_id = %request.order_id,
            amount = request.amount,
            charge = n,
            "calling payment gateway"
        );
        tokio::time::sleep(self.delay).await;

        if request.amount == 0 {
            return Err(Rejection::new("amount must be positive"));
        }
        if self.decline_next.swap(false, Ordering::SeqCst) {
            return Err(Rejection::new("card declined by issuer"));
        }

        Ok(PaymentReceipt {
            payment_id: Ulid::new().to_string(),
            order_id: request.order_id,
            amount: request.amount,
            currency: request.currency,
            status: PaymentStatus::Completed,
            // the gateway deduplicates on this, so a reclaimed attempt can't
            // charge twice under the same id
            transaction_id: format!("txn-{}", ctx.attempt_id()),
            processed_at: Utc::now(),
        })
    }
}
