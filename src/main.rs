use std::path::PathBuf;

use anyhow::Context;
use chrono::Duration;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use flash_coupon::types::{OrderId, PolicyId, TimeStamp, UserId};
use flash_coupon::{
    CancelOutcome, ClaimOutcome, CouponConfig, CouponPolicyBuilder, CouponRuntime, CouponStatus,
    DiscountRule, UseOutcome,
};

/// Flash-sale simulation: many concurrent claimants racing for a small quota
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "FLASH_COUPON_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `data_dir` from the configuration
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Overrides `partitions` from the configuration
    #[arg(long)]
    partitions: Option<usize>,

    /// Coupons available in the simulated policy
    #[arg(short, long, default_value = "100")]
    quantity: u64,

    /// Concurrent users claiming
    #[arg(short, long, default_value = "1000")]
    users: usize,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut config = match &args.config {
        Some(path) => CouponConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => CouponConfig::default(),
    };
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if let Some(partitions) = args.partitions {
        config.partitions = partitions;
    }

    info!("flash-coupon v{}", env!("CARGO_PKG_VERSION"));
    let runtime = CouponRuntime::open(&config)?;
    let service = runtime.service();

    let now = TimeStamp::new();
    let policy = service
        .create_policy(
            CouponPolicyBuilder::new()
                .set_code(format!("FLASH-{}", now.timestamp_millis()))
                .set_name("Flash sale")
                .set_total_quantity(args.quantity)
                .set_start_time(now.minus(Duration::seconds(1)))
                .set_end_time(now.plus(Duration::hours(1)))
                .set_discount(DiscountRule::percentage(20, 10_000).with_minimum_order(5_000)),
        )
        .await?;
    service.activate_policy(&policy.id).await?;

    let mut claims = tokio::task::JoinSet::new();
    for i in 0..args.users {
        let service = service.clone();
        let policy_id: PolicyId = policy.id.clone();
        claims.spawn(async move {
            service
                .claim_coupon(&policy_id, &UserId::from(format!("user-{i}")))
                .await
        });
    }

    let (mut accepted, mut rejected, mut failed) = (0usize, 0usize, 0usize);
    while let Some(joined) = claims.join_next().await {
        match joined? {
            Ok(ClaimOutcome::Accepted(_)) => accepted += 1,
            Ok(ClaimOutcome::Rejected(_)) => rejected += 1,
            Err(e) => {
                failed += 1;
                tracing::warn!(error = %e, "claim failed");
            }
        }
    }
    info!(accepted, rejected, failed, "claims finished");

    runtime.drain().await;
    let coupons = service.coupons_for_policy(&policy.id).await?;
    let available = coupons
        .iter()
        .filter(|c| c.status == CouponStatus::Available)
        .count();
    info!(
        issued = coupons.len(),
        available,
        remaining = service.remaining_quota(&policy.id).await?,
        "issuance drained"
    );

    if let Some(coupon) = coupons.first() {
        if let UseOutcome::Used(used) = service
            .use_coupon(&coupon.code, &OrderId::from("order-1"))
            .await?
        {
            info!(coupon_code = %used.code, "coupon used");
        }
        if let CancelOutcome::Canceled(canceled) = service.cancel_coupon(&coupon.code).await? {
            info!(coupon_code = %canceled.code, "coupon canceled");
        }
        let again = service
            .use_coupon(&coupon.code, &OrderId::from("order-2"))
            .await?;
        info!(?again, "using a canceled coupon");
    }

    let dead = service.dead_letters(10).await?;
    if !dead.is_empty() {
        tracing::error!(count = dead.len(), "issuance messages were dead-lettered");
    }

    runtime.shutdown().await?;
    Ok(())
}
