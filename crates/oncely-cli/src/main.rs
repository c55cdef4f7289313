//! oncely CLI - charges demo payments through the idempotent coordinator.
//!
//! Fires several duplicate requests for the same order at once and shows that
//! the gateway is called once and every caller sees the same receipt.

mod payment;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use oncely_core::app::{CoordinatorConfig, WorkerConfig};
use oncely_core::{AppBuilder, IdempotencyKey, Outcome, PollResult};

use payment::{PaymentReceipt, PaymentRequest, SimulatedGateway};

#[derive(Debug, Parser)]
#[command(name = "oncely", about = "Exactly-once payment demo")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Simulated gateway latency in milliseconds.
    #[arg(long, default_value_t = 2000)]
    gateway_delay_ms: u64,

    /// Concurrent submissions of the same request.
    #[arg(long, default_value_t = 3)]
    duplicates: usize,

    #[arg(long, default_value = "order-1001")]
    order_id: String,

    #[arg(long, default_value_t = 4999)]
    amount: u64,

    /// Decline the first charge to show the retry-after-failure path.
    #[arg(long)]
    decline_first: bool,

    #[arg(long, default_value_t = 30)]
    processing_timeout_secs: u64,

    #[arg(long, default_value_t = 4)]
    workers: usize,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Command {
    /// Submit synchronously; duplicates back off while the first one runs.
    Sync,
    /// Enqueue and poll; a worker pool does the charging.
    Queued,
    /// Both, one after the other.
    All,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    tokio::select! {
        result = run(&cli) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted");
            Ok(())
        }
    }
}

async fn run(cli: &Cli) -> Result<()> {
    match cli.command.unwrap_or(Command::All) {
        Command::Sync => sync_demo(cli).await,
        Command::Queued => queued_demo(cli).await,
        Command::All => {
            sync_demo(cli).await?;
            queued_demo(cli).await
        }
    }
}

fn request(cli: &Cli) -> PaymentRequest {
    PaymentRequest {
        order_id: cli.order_id.clone(),
        amount: cli.amount,
        currency: "USD".to_string(),
        customer_id: "cust-42".to_string(),
    }
}

fn build_app(cli: &Cli, gateway: &Arc<SimulatedGateway>) -> Result<oncely_core::App> {
    AppBuilder::new()
        .operation::<PaymentRequest, _>(Arc::clone(gateway))
        .coordinator_config(
            CoordinatorConfig::default()
                .with_processing_timeout(Duration::from_secs(cli.processing_timeout_secs)),
        )
        .worker_config(WorkerConfig::default().with_workers(cli.workers))
        .build()
        .context("invalid configuration")
}

fn describe(outcome: &Outcome) -> String {
    match outcome.decode::<PaymentReceipt>() {
        Some(Ok(receipt)) => format!(
            "COMPLETED payment_id={} transaction_id={} amount={} {}",
            receipt.payment_id, receipt.transaction_id, receipt.amount, receipt.currency
        ),
        Some(Err(err)) => format!("COMPLETED but unreadable: {err}"),
        None => match outcome {
            Outcome::Failed(reason) => format!("FAILED: {reason}"),
            Outcome::InFlight { retry_after } => format!("IN FLIGHT (retry after {retry_after:?})"),
            Outcome::Completed(_) => "COMPLETED".to_string(),
        },
    }
}

async fn sync_demo(cli: &Cli) -> Result<()> {
    println!("== synchronous path ==");
    let gateway = SimulatedGateway::new(Duration::from_millis(cli.gateway_delay_ms));
    if cli.decline_first {
        gateway.decline_next();
    }
    let app = build_app(cli, &gateway)?;
    let key = IdempotencyKey::parse(format!("{}-sync", cli.order_id))?;
    let payload = serde_json::to_vec(&request(cli))?;
    let max_wait = Duration::from_millis(cli.gateway_delay_ms) * 3 + Duration::from_secs(5);

    let mut joins = Vec::with_capacity(cli.duplicates);
    for _ in 0..cli.duplicates {
        let coordinator = Arc::clone(app.coordinator());
        let key = key.clone();
        let payload = payload.clone();
        joins.push(tokio::spawn(async move {
            coordinator.submit_with_deadline(&key, &payload, max_wait).await
        }));
    }
    for (i, join) in joins.into_iter().enumerate() {
        let outcome = join.await??;
        println!("caller {i}: {}", describe(&outcome));
    }

    let again = app.coordinator().submit(&key, &payload).await?;
    println!("resubmit: {}", describe(&again));
    println!("gateway charges: {}", gateway.charges());
    Ok(())
}

async fn queued_demo(cli: &Cli) -> Result<()> {
    println!("== queued path ==");
    let gateway = SimulatedGateway::new(Duration::from_millis(cli.gateway_delay_ms));
    if cli.decline_first {
        gateway.decline_next();
    }
    let app = build_app(cli, &gateway)?;
    let key = IdempotencyKey::parse(format!("{}-queued", cli.order_id))?;
    let payload = serde_json::to_vec(&request(cli))?;
    let running = app.start();

    for i in 0..cli.duplicates {
        let receipt = app.queued().submit(&key, &payload).await?;
        println!("submit {i}: {receipt:?}");
    }

    let outcome = loop {
        match app.queued().poll(&key).await? {
            PollResult::Ready(Outcome::InFlight { retry_after }) => {
                tokio::time::sleep(retry_after.min(Duration::from_millis(500))).await;
            }
            PollResult::Ready(outcome) => break outcome,
            PollResult::NotFound => anyhow::bail!("record for {key} disappeared"),
        }
    };
    println!("poll: {}", describe(&outcome));

    running.shutdown().await;
    let status = app.status().await?;
    println!("gateway charges: {}", gateway.charges());
    println!("status: {}", serde_json::to_string(&status)?);
    Ok(())
}
