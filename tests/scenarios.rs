use std::sync::Arc;

use anyhow::Context;
use chrono::Duration;
use tempfile::{TempDir, tempdir};

use flash_coupon::backoff::RetryPolicy;
use flash_coupon::coupon_store::{CouponStore, SledCouponStore};
use flash_coupon::error::{DiscountError, QuoteRejection};
use flash_coupon::types::{Clock, ManualClock, OrderId, PolicyId, TimeStamp, UserId};
use flash_coupon::{
    CancelOutcome, ClaimOutcome, ClaimRejection, CouponConfig, CouponPolicy, CouponPolicyBuilder,
    CouponRuntime, CouponService, CouponStatus, DiscountRule, QuoteOutcome, RuntimeParts,
    TransitionError, UseOutcome,
};

struct Env {
    // keeps the database directory alive for the whole test
    _dir: TempDir,
    db: sled::Db,
    clock: Arc<ManualClock>,
    runtime: CouponRuntime,
    service: Arc<CouponService>,
}

fn config() -> CouponConfig {
    CouponConfig {
        partitions: 4,
        counter_purge_interval_ms: 0,
        retry: RetryPolicy {
            max_attempts: 3,
            base_ms: 1,
            factor: 2.0,
            jitter: 0.0,
            cap_ms: 4,
        },
        ..CouponConfig::default()
    }
}

fn env(name: &str) -> anyhow::Result<Env> {
    // sled locks its directory, so every test opens its own database
    let dir = tempdir()?;
    let db = sled::open(dir.path().join(name))?;
    let clock = Arc::new(ManualClock::new(TimeStamp::new_with(2025, 11, 28, 9, 0, 0)));
    let parts = RuntimeParts::sled(&db, clock.clone())?;
    let runtime = CouponRuntime::with_parts(parts, &config())?;
    let service = runtime.service();
    Ok(Env {
        _dir: dir,
        db,
        clock,
        runtime,
        service,
    })
}

async fn live_policy(env: &Env, code: &str, quantity: u64) -> anyhow::Result<CouponPolicy> {
    let now = env.clock.now();
    let policy = env
        .service
        .create_policy(
            CouponPolicyBuilder::new()
                .set_code(code)
                .set_name("Flash sale")
                .set_total_quantity(quantity)
                .set_start_time(now)
                .set_end_time(now.plus(Duration::hours(1)))
                .set_discount(DiscountRule::fixed(3_000).with_minimum_order(10_000)),
        )
        .await?;
    env.service.activate_policy(&policy.id).await?;
    Ok(policy)
}

async fn claim_concurrently(
    service: &Arc<CouponService>,
    policy_id: &PolicyId,
    users: Vec<UserId>,
) -> anyhow::Result<Vec<ClaimOutcome>> {
    let mut claims = tokio::task::JoinSet::new();
    for user in users {
        let service = service.clone();
        let policy_id = policy_id.clone();
        claims.spawn(async move { service.claim_coupon(&policy_id, &user).await });
    }
    let mut outcomes = Vec::new();
    while let Some(joined) = claims.join_next().await {
        outcomes.push(joined??);
    }
    Ok(outcomes)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_coupons_ten_users() -> anyhow::Result<()> {
    let env = env("three_coupons_ten_users.db")?;
    let policy = live_policy(&env, "FLASH-3", 3).await?;

    let users = (0..10).map(|i| UserId::from(format!("user-{i}"))).collect();
    let outcomes = claim_concurrently(&env.service, &policy.id, users).await?;

    let accepted = outcomes
        .iter()
        .filter(|o| matches!(o, ClaimOutcome::Accepted(_)))
        .count();
    let exceeded = outcomes
        .iter()
        .filter(|o| **o == ClaimOutcome::Rejected(ClaimRejection::QuotaExceeded))
        .count();
    assert_eq!(accepted, 3);
    assert_eq!(exceeded, 7);

    // provisional acceptance turns into available coupons once drained
    env.runtime.drain().await;
    let coupons = env.service.coupons_for_policy(&policy.id).await?;
    assert_eq!(coupons.len(), 3);
    assert!(coupons.iter().all(|c| c.status == CouponStatus::Available));
    assert_eq!(env.service.remaining_quota(&policy.id).await?, 0);

    let code = coupons[0].code.clone();
    let used = env
        .service
        .use_coupon(&code, &OrderId::from("order-1"))
        .await?;
    let UseOutcome::Used(used) = used else {
        panic!("first use should succeed, got {used:?}");
    };
    assert_eq!(used.order_id, Some(OrderId::from("order-1")));

    // second use leaves the redemption untouched
    assert_eq!(
        env.service
            .use_coupon(&code, &OrderId::from("order-2"))
            .await?,
        UseOutcome::Rejected(TransitionError::AlreadyUsed)
    );
    let stored = env.service.find_coupon(&code).await?.context("coupon vanished")?;
    assert_eq!(stored.order_id, Some(OrderId::from("order-1")));
    assert_eq!(stored.used_at, used.used_at);

    assert!(matches!(
        env.service.cancel_coupon(&code).await?,
        CancelOutcome::Canceled(_)
    ));
    assert_eq!(
        env.service
            .use_coupon(&code, &OrderId::from("order-3"))
            .await?,
        UseOutcome::Rejected(TransitionError::Canceled)
    );

    // an unused coupon cannot be canceled
    assert_eq!(
        env.service.cancel_coupon(&coupons[1].code).await?,
        CancelOutcome::Rejected(TransitionError::NotUsed)
    );

    env.runtime.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_user_racing_claims_keeps_one_coupon() -> anyhow::Result<()> {
    let env = env("one_user_racing.db")?;
    let policy = live_policy(&env, "RACE", 5).await?;

    let users = vec![UserId::from("eager"); 4];
    let outcomes = claim_concurrently(&env.service, &policy.id, users).await?;
    assert!(outcomes.iter().all(|o| matches!(o, ClaimOutcome::Accepted(_))));

    env.runtime.drain().await;
    let held = env.service.coupons_for_user(&UserId::from("eager")).await?;
    assert_eq!(held.len(), 1);

    // the three duplicate slots went back to the pool
    assert_eq!(env.service.remaining_quota(&policy.id).await?, 4);

    env.runtime.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_uses_redeem_a_coupon_once() -> anyhow::Result<()> {
    let env = env("racing_uses.db")?;
    let policy = live_policy(&env, "ONCE", 1).await?;
    env.service
        .claim_coupon(&policy.id, &UserId::from("buyer"))
        .await?;
    env.runtime.drain().await;
    let coupon = env
        .service
        .coupons_for_user(&UserId::from("buyer"))
        .await?
        .pop()
        .context("coupon was not issued")?;

    let mut uses = tokio::task::JoinSet::new();
    for i in 0..32 {
        let service = env.service.clone();
        let code = coupon.code.clone();
        uses.spawn(async move {
            service
                .use_coupon(&code, &OrderId::from(format!("order-{i}")))
                .await
        });
    }
    let mut used = Vec::new();
    while let Some(joined) = uses.join_next().await {
        match joined?? {
            UseOutcome::Used(coupon) => used.push(coupon),
            outcome => assert_eq!(outcome, UseOutcome::Rejected(TransitionError::AlreadyUsed)),
        }
    }
    assert_eq!(used.len(), 1);

    // the stored redemption belongs to the single winner
    let stored = env
        .service
        .find_coupon(&coupon.code)
        .await?
        .context("coupon vanished")?;
    assert_eq!(stored.status, CouponStatus::Used);
    assert_eq!(stored.order_id, used[0].order_id);

    env.runtime.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn user_coupons_page_filters_newest_first() -> anyhow::Result<()> {
    let env = env("user_coupons_page.db")?;
    let user = UserId::from("collector");
    let mut codes = Vec::new();
    for code in ["PAGE-1", "PAGE-2", "PAGE-3"] {
        let policy = live_policy(&env, code, 2).await?;
        env.service.claim_coupon(&policy.id, &user).await?;
        env.runtime.drain().await;
        let held = env.service.coupons_for_policy(&policy.id).await?;
        codes.push(held[0].code.clone());
        env.clock.advance(Duration::seconds(1));
    }
    env.service
        .use_coupon(&codes[0], &OrderId::from("order-page"))
        .await?;

    let page = env.service.user_coupons_page(&user, None, 2).await?;
    let page: Vec<_> = page.into_iter().map(|c| c.code).collect();
    assert_eq!(page, vec![codes[2].clone(), codes[1].clone()]);

    let used = env
        .service
        .user_coupons_page(&user, Some(CouponStatus::Used), 10)
        .await?;
    assert_eq!(used.len(), 1);
    assert_eq!(used[0].code, codes[0]);

    let available = env
        .service
        .user_coupons_page(&user, Some(CouponStatus::Available), 10)
        .await?;
    assert_eq!(available.len(), 2);

    env.runtime.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn validity_window_is_half_open() -> anyhow::Result<()> {
    let env = env("window_edges.db")?;
    let start = env.clock.now().plus(Duration::hours(1));
    let policy = env
        .service
        .create_policy(
            CouponPolicyBuilder::new()
                .set_code("LATER")
                .set_name("Later")
                .set_total_quantity(10)
                .set_start_time(start)
                .set_end_time(start.plus(Duration::minutes(30)))
                .set_discount(DiscountRule::fixed(100)),
        )
        .await?;

    let user = UserId::from("early-bird");
    assert_eq!(
        env.service.claim_coupon(&policy.id, &user).await?,
        ClaimOutcome::Rejected(ClaimRejection::PolicyNotActive)
    );

    // never activated: the first claim reconciles the counter
    env.clock.set(policy.start_time);
    assert!(matches!(
        env.service.claim_coupon(&policy.id, &user).await?,
        ClaimOutcome::Accepted(_)
    ));

    env.clock.set(policy.end_time);
    assert_eq!(
        env.service
            .claim_coupon(&policy.id, &UserId::from("late"))
            .await?,
        ClaimOutcome::Rejected(ClaimRejection::PolicyExpired)
    );

    env.runtime.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn unknown_policy_is_an_error() -> anyhow::Result<()> {
    let env = env("unknown_policy.db")?;
    let err = env
        .service
        .claim_coupon(&PolicyId::from("missing"), &UserId::from("u"))
        .await
        .unwrap_err();
    assert!(matches!(err, flash_coupon::CouponError::PolicyNotFound(_)));
    env.runtime.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn expired_coupon_is_refused_and_recorded() -> anyhow::Result<()> {
    let env = env("expired_coupon.db")?;
    let policy = live_policy(&env, "SHORT", 2).await?;
    env.service
        .claim_coupon(&policy.id, &UserId::from("slow"))
        .await?;
    env.runtime.drain().await;

    let coupon = env
        .service
        .coupons_for_user(&UserId::from("slow"))
        .await?
        .pop()
        .context("coupon not issued")?;
    assert_eq!(
        env.service.coupon_status(&coupon.code).await?,
        Some(CouponStatus::Available)
    );

    env.clock.set(policy.end_time.plus(Duration::minutes(1)));
    assert_eq!(
        env.service
            .use_coupon(&coupon.code, &OrderId::from("too-late"))
            .await?,
        UseOutcome::Rejected(TransitionError::Expired)
    );

    // lazy expiry was written back to the row
    let store = SledCouponStore::open(&env.db)?;
    let stored = store
        .find_by_code(&coupon.code)
        .await?
        .context("coupon row missing")?;
    assert_eq!(stored.status, CouponStatus::Expired);
    assert_eq!(
        env.service.coupon_status(&coupon.code).await?,
        Some(CouponStatus::Expired)
    );

    env.runtime.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn extended_window_keeps_claims_open() -> anyhow::Result<()> {
    let env = env("extend_policy.db")?;
    let policy = live_policy(&env, "EXTEND", 5).await?;

    let later = policy.end_time.plus(Duration::hours(2));
    let extended = env.service.extend_policy(&policy.id, later).await?;
    assert_eq!(extended.end_time, later);

    env.clock.set(policy.end_time.plus(Duration::minutes(5)));
    assert!(matches!(
        env.service
            .claim_coupon(&policy.id, &UserId::from("night-owl"))
            .await?,
        ClaimOutcome::Accepted(_)
    ));

    // shortening is refused
    assert!(
        env.service
            .extend_policy(&policy.id, policy.end_time)
            .await
            .is_err()
    );

    env.runtime.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn discount_quote_follows_policy_rule() -> anyhow::Result<()> {
    let env = env("discount_quote.db")?;
    let policy = live_policy(&env, "QUOTE", 1).await?;
    env.service
        .claim_coupon(&policy.id, &UserId::from("shopper"))
        .await?;
    env.runtime.drain().await;
    let coupon = env
        .service
        .coupons_for_user(&UserId::from("shopper"))
        .await?
        .pop()
        .context("coupon not issued")?;

    let QuoteOutcome::Quoted(quote) = env.service.quote_discount(&coupon.code, 25_000).await?
    else {
        panic!("expected a quote");
    };
    assert_eq!(quote.discount, 3_000);
    assert_eq!(quote.payable, 22_000);

    assert_eq!(
        env.service.quote_discount(&coupon.code, 9_000).await?,
        QuoteOutcome::Rejected(QuoteRejection::Discount(DiscountError::BelowMinimum {
            minimum: 10_000,
            actual: 9_000
        }))
    );

    env.service
        .use_coupon(&coupon.code, &OrderId::from("order-q"))
        .await?;
    assert_eq!(
        env.service.quote_discount(&coupon.code, 25_000).await?,
        QuoteOutcome::Rejected(QuoteRejection::Coupon(TransitionError::AlreadyUsed))
    );

    env.runtime.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn shutdown_finishes_queued_claims() -> anyhow::Result<()> {
    let env = env("shutdown_drain.db")?;
    let policy = live_policy(&env, "DRAIN", 20).await?;
    for i in 0..10 {
        env.service
            .claim_coupon(&policy.id, &UserId::from(format!("u{i}")))
            .await?;
    }

    let Env {
        _dir, db, runtime, ..
    } = env;
    runtime.shutdown().await?;

    let store = SledCouponStore::open(&db)?;
    assert_eq!(store.issued_count(&policy.id).await?, 10);
    Ok(())
}

#[tokio::test]
async fn duplicate_policy_code_is_refused() -> anyhow::Result<()> {
    let env = env("duplicate_policy.db")?;
    live_policy(&env, "ONCE", 1).await?;
    assert!(live_policy(&env, "ONCE", 1).await.is_err());
    assert_eq!(env.service.policies().await?.len(), 1);
    assert!(env.service.policy_by_code("ONCE").await?.is_some());
    env.runtime.shutdown().await?;
    Ok(())
}
