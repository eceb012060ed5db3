//! Service layer API for coupon claims, redemption and queries
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::cache::CouponCache;
use crate::channel::{IssuanceMessage, IssuancePublisher};
use crate::coupon::{Coupon, CouponStatus};
use crate::coupon_store::{CouponStore, SwapOutcome};
use crate::dead_letter::{DeadLetter, DeadLetterSink};
use crate::error::{ClaimRejection, CounterError, CouponError, QuoteRejection, TransitionError};
use crate::policy::{CouponPolicy, CouponPolicyBuilder, WindowState};
use crate::policy_store::PolicyStore;
use crate::quota::{QuotaAllocator, Reservation};
use crate::types::{Clock, CouponCode, OrderId, PolicyId, RequestId, TimeStamp, UserId};

/// Provisional acceptance of a claim. The coupon itself appears once the
/// issuance worker has processed `request_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimTicket {
    pub request_id: RequestId,
    pub policy_id: PolicyId,
    pub user_id: UserId,
    pub remaining: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Accepted(ClaimTicket),
    Rejected(ClaimRejection),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UseOutcome {
    Used(Coupon),
    Rejected(TransitionError),
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    Canceled(Coupon),
    Rejected(TransitionError),
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscountQuote {
    pub coupon_code: CouponCode,
    pub order_amount: u64,
    pub discount: u64,
    pub payable: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuoteOutcome {
    Quoted(DiscountQuote),
    Rejected(QuoteRejection),
    NotFound,
}

pub struct CouponService {
    policies: Arc<dyn PolicyStore>,
    coupons: Arc<dyn CouponStore>,
    quota: QuotaAllocator,
    publisher: Arc<dyn IssuancePublisher>,
    dead_letters: Arc<dyn DeadLetterSink>,
    cache: Arc<CouponCache>,
    clock: Arc<dyn Clock>,
    enqueue_timeout: Duration,
}

impl CouponService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        policies: Arc<dyn PolicyStore>,
        coupons: Arc<dyn CouponStore>,
        quota: QuotaAllocator,
        publisher: Arc<dyn IssuancePublisher>,
        dead_letters: Arc<dyn DeadLetterSink>,
        cache: Arc<CouponCache>,
        clock: Arc<dyn Clock>,
        enqueue_timeout: Duration,
    ) -> Self {
        Self {
            policies,
            coupons,
            quota,
            publisher,
            dead_letters,
            cache,
            clock,
            enqueue_timeout,
        }
    }

    async fn load_policy(&self, policy_id: &PolicyId) -> Result<CouponPolicy, CouponError> {
        self.policies
            .get_policy(policy_id)
            .await?
            .ok_or_else(|| CouponError::PolicyNotFound(policy_id.clone()))
    }

    /// Store a new policy. Its quota counter is written by `activate_policy`,
    /// or reconciled on the first claim.
    pub async fn create_policy(
        &self,
        draft: CouponPolicyBuilder,
    ) -> Result<CouponPolicy, CouponError> {
        let policy = draft.validate_and_finalise(self.clock.now())?;
        self.policies.insert_policy(&policy).await?;
        tracing::info!(
            policy_id = %policy.id,
            code = %policy.code,
            total_quantity = policy.total_quantity,
            start_time = %policy.start_time,
            end_time = %policy.end_time,
            "coupon policy created"
        );
        Ok(policy)
    }

    /// (Re)write the quota counter as `total - issued`.
    pub async fn activate_policy(&self, policy_id: &PolicyId) -> Result<u64, CouponError> {
        let policy = self.load_policy(policy_id).await?;
        let issued = self.coupons.issued_count(&policy.id).await?;
        self.quota.initialize(&policy, issued).await?;
        self.cache.invalidate_remaining(&policy.id);
        Ok(policy.total_quantity.saturating_sub(issued))
    }

    pub async fn extend_policy(
        &self,
        policy_id: &PolicyId,
        end_time: TimeStamp<Utc>,
    ) -> Result<CouponPolicy, CouponError> {
        let policy = self
            .policies
            .extend_end_time(policy_id, end_time, self.clock.now())
            .await?;
        if !self.quota.extend(&policy).await? {
            tracing::debug!(%policy_id, "no live quota counter to extend");
        }
        self.cache.invalidate_remaining(&policy.id);
        tracing::info!(%policy_id, end_time = %policy.end_time, "coupon policy extended");
        Ok(policy)
    }

    pub async fn policy(&self, policy_id: &PolicyId) -> Result<Option<CouponPolicy>, CouponError> {
        self.policies.get_policy(policy_id).await
    }

    pub async fn policy_by_code(&self, code: &str) -> Result<Option<CouponPolicy>, CouponError> {
        self.policies.get_policy_by_code(code).await
    }

    pub async fn policies(&self) -> Result<Vec<CouponPolicy>, CouponError> {
        self.policies.list_policies().await
    }

    /// Admit or reject a claim. Never waits on the durable write.
    pub async fn claim_coupon(
        &self,
        policy_id: &PolicyId,
        user_id: &UserId,
    ) -> Result<ClaimOutcome, CouponError> {
        let policy = self.load_policy(policy_id).await?;
        let now = self.clock.now();

        match policy.window_state(&now) {
            WindowState::NotStarted => {
                return Ok(self.reject(policy_id, user_id, ClaimRejection::PolicyNotActive));
            }
            WindowState::Ended => {
                return Ok(self.reject(policy_id, user_id, ClaimRejection::PolicyExpired));
            }
            WindowState::Active => {}
        }

        let remaining = match self.quota.try_reserve(&policy.id).await? {
            Reservation::Granted { remaining } => remaining,
            Reservation::Denied => {
                return Ok(self.reject(policy_id, user_id, ClaimRejection::QuotaExceeded));
            }
            Reservation::Uninitialized => {
                let issued = self.coupons.issued_count(&policy.id).await?;
                self.quota.ensure_initialized(&policy, issued).await?;
                match self.quota.try_reserve(&policy.id).await? {
                    Reservation::Granted { remaining } => remaining,
                    Reservation::Denied => {
                        return Ok(self.reject(policy_id, user_id, ClaimRejection::QuotaExceeded));
                    }
                    Reservation::Uninitialized => {
                        return Err(CounterError::Unavailable(format!(
                            "quota counter for {policy_id} missing after reconciliation"
                        ))
                        .into());
                    }
                }
            }
        };

        let message = IssuanceMessage::new(policy.id.clone(), user_id.clone(), now);
        let published =
            match tokio::time::timeout(self.enqueue_timeout, self.publisher.publish(&message)).await
            {
                Ok(result) => result,
                Err(_) => Err(CouponError::EnqueueTimeout),
            };
        if let Err(e) = published {
            self.compensate(&message, &e).await;
            return Err(e);
        }

        self.cache.invalidate_remaining(&policy.id);
        tracing::debug!(
            request_id = %message.request_id,
            %policy_id,
            %user_id,
            remaining,
            "claim accepted"
        );
        Ok(ClaimOutcome::Accepted(ClaimTicket {
            request_id: message.request_id,
            policy_id: message.policy_id,
            user_id: message.user_id,
            remaining: u64::try_from(remaining).unwrap_or(0),
        }))
    }

    fn reject(
        &self,
        policy_id: &PolicyId,
        user_id: &UserId,
        rejection: ClaimRejection,
    ) -> ClaimOutcome {
        tracing::debug!(%policy_id, %user_id, %rejection, "claim rejected");
        ClaimOutcome::Rejected(rejection)
    }

    /// Give back the slot of a claim whose message never reached the channel.
    async fn compensate(&self, message: &IssuanceMessage, cause: &CouponError) {
        match self.quota.release(&message.policy_id).await {
            Ok(()) => {
                self.cache.invalidate_remaining(&message.policy_id);
                tracing::warn!(
                    request_id = %message.request_id,
                    policy_id = %message.policy_id,
                    user_id = %message.user_id,
                    error = %cause,
                    "issuance enqueue failed, slot released"
                );
            }
            Err(e) => tracing::error!(
                request_id = %message.request_id,
                policy_id = %message.policy_id,
                user_id = %message.user_id,
                error = %e,
                cause = %cause,
                "failed to release quota slot after enqueue failure; quota leaked"
            ),
        }
    }

    /// Redeem a coupon against an order.
    pub async fn use_coupon(
        &self,
        code: &CouponCode,
        order_id: &OrderId,
    ) -> Result<UseOutcome, CouponError> {
        // every lost swap means the row moved forward in an acyclic lifecycle
        loop {
            let Some(coupon) = self.coupons.find_by_code(code).await? else {
                return Ok(UseOutcome::NotFound);
            };
            let policy = self.load_policy(&coupon.policy_id).await?;
            let now = self.clock.now();

            let used = match coupon.redeem(order_id.clone(), &policy, now) {
                Ok(used) => used,
                Err(TransitionError::Expired) => {
                    self.persist_expiry(&coupon, now).await;
                    return Ok(self.refuse_use(&coupon, TransitionError::Expired));
                }
                Err(e) => return Ok(self.refuse_use(&coupon, e)),
            };

            match self.coupons.compare_and_swap(&coupon, used).await? {
                SwapOutcome::Swapped(used) => {
                    self.cache.invalidate_coupon(code);
                    tracing::info!(
                        coupon_code = %code,
                        policy_id = %used.policy_id,
                        user_id = %used.user_id,
                        %order_id,
                        "coupon used"
                    );
                    return Ok(UseOutcome::Used(used));
                }
                SwapOutcome::Conflict(_) => {
                    tracing::debug!(
                        coupon_code = %code,
                        "coupon changed while using it, re-reading"
                    );
                }
            }
        }
    }

    fn refuse_use(&self, coupon: &Coupon, reason: TransitionError) -> UseOutcome {
        tracing::debug!(coupon_code = %coupon.code, %reason, "coupon use refused");
        UseOutcome::Rejected(reason)
    }

    /// Write down lazy expiry. Losing the swap is fine: whoever won wrote a
    /// newer state.
    async fn persist_expiry(&self, coupon: &Coupon, now: TimeStamp<Utc>) {
        let Ok(expired) = coupon.expire(now) else {
            return;
        };
        match self.coupons.compare_and_swap(coupon, expired).await {
            Ok(_) => self.cache.invalidate_coupon(&coupon.code),
            Err(e) => tracing::warn!(
                coupon_code = %coupon.code,
                error = %e,
                "failed to persist coupon expiry"
            ),
        }
    }

    /// Reverse a redemption. Canceled coupons cannot be used again.
    pub async fn cancel_coupon(&self, code: &CouponCode) -> Result<CancelOutcome, CouponError> {
        loop {
            let Some(coupon) = self.coupons.find_by_code(code).await? else {
                return Ok(CancelOutcome::NotFound);
            };
            let canceled = match coupon.cancel(self.clock.now()) {
                Ok(canceled) => canceled,
                Err(reason) => {
                    tracing::debug!(coupon_code = %code, %reason, "coupon cancel refused");
                    return Ok(CancelOutcome::Rejected(reason));
                }
            };

            if let SwapOutcome::Swapped(canceled) =
                self.coupons.compare_and_swap(&coupon, canceled).await?
            {
                self.cache.invalidate_coupon(code);
                tracing::info!(
                    coupon_code = %code,
                    policy_id = %canceled.policy_id,
                    user_id = %canceled.user_id,
                    "coupon canceled"
                );
                return Ok(CancelOutcome::Canceled(canceled));
            }
        }
    }

    /// Coupon as a reader should see it, with lazy expiry applied.
    pub async fn find_coupon(&self, code: &CouponCode) -> Result<Option<Coupon>, CouponError> {
        let Some(coupon) = self.coupons.find_by_code(code).await? else {
            return Ok(None);
        };
        let policy = self.load_policy(&coupon.policy_id).await?;
        Ok(Some(self.view(coupon, &policy)))
    }

    fn view(&self, coupon: Coupon, policy: &CouponPolicy) -> Coupon {
        let status = coupon.effective_status(policy, &self.clock.now());
        Coupon { status, ..coupon }
    }

    /// Cached status lookup. Cache entries never outlive the policy window,
    /// so a hit needs no expiry check.
    pub async fn coupon_status(
        &self,
        code: &CouponCode,
    ) -> Result<Option<CouponStatus>, CouponError> {
        if let Some(hit) = self.cache.coupon(code) {
            return Ok(Some(hit.status));
        }
        let Some(coupon) = self.coupons.find_by_code(code).await? else {
            return Ok(None);
        };
        let policy = self.load_policy(&coupon.policy_id).await?;
        let view = self.view(coupon, &policy);
        self.cache.put_coupon(&view, &policy);
        Ok(Some(view.status))
    }

    async fn views(&self, coupons: Vec<Coupon>) -> Result<Vec<Coupon>, CouponError> {
        let mut policies: HashMap<PolicyId, CouponPolicy> = HashMap::new();
        let mut out = Vec::with_capacity(coupons.len());
        for coupon in coupons {
            if !policies.contains_key(&coupon.policy_id) {
                let policy = self.load_policy(&coupon.policy_id).await?;
                policies.insert(policy.id.clone(), policy);
            }
            match policies.get(&coupon.policy_id) {
                Some(policy) => out.push(self.view(coupon, policy)),
                None => out.push(coupon),
            }
        }
        Ok(out)
    }

    pub async fn coupons_for_user(&self, user_id: &UserId) -> Result<Vec<Coupon>, CouponError> {
        let coupons = self.coupons.list_by_user(user_id).await?;
        self.views(coupons).await
    }

    /// A user's coupons newest first, optionally only those whose effective
    /// status is `status`, at most `limit` of them.
    pub async fn user_coupons_page(
        &self,
        user_id: &UserId,
        status: Option<CouponStatus>,
        limit: usize,
    ) -> Result<Vec<Coupon>, CouponError> {
        let mut coupons = self.coupons_for_user(user_id).await?;
        coupons.retain(|c| status.is_none_or(|s| c.status == s));
        coupons.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        coupons.truncate(limit);
        Ok(coupons)
    }

    pub async fn coupons_for_policy(
        &self,
        policy_id: &PolicyId,
    ) -> Result<Vec<Coupon>, CouponError> {
        let coupons = self.coupons.list_by_policy(policy_id).await?;
        self.views(coupons).await
    }

    /// Slots left for admission. Falls back to `total - issued` when no
    /// counter is live, and to zero once the window has ended.
    pub async fn remaining_quota(&self, policy_id: &PolicyId) -> Result<u64, CouponError> {
        if let Some(hit) = self.cache.remaining(policy_id) {
            return Ok(hit);
        }
        let policy = self.load_policy(policy_id).await?;
        if policy.has_ended(&self.clock.now()) {
            return Ok(0);
        }
        let remaining = match self.quota.remaining(policy_id).await? {
            Some(remaining) => remaining,
            None => {
                let issued = self.coupons.issued_count(policy_id).await?;
                policy.total_quantity.saturating_sub(issued)
            }
        };
        self.cache.put_remaining(&policy, remaining);
        Ok(remaining)
    }

    /// Discount a coupon would grant on an order, without redeeming it.
    pub async fn quote_discount(
        &self,
        code: &CouponCode,
        order_amount: u64,
    ) -> Result<QuoteOutcome, CouponError> {
        let Some(coupon) = self.coupons.find_by_code(code).await? else {
            return Ok(QuoteOutcome::NotFound);
        };
        let policy = self.load_policy(&coupon.policy_id).await?;
        if let Err(e) = coupon.check_redeemable(&policy, &self.clock.now()) {
            return Ok(QuoteOutcome::Rejected(e.into()));
        }
        match policy.discount.discount_for(order_amount) {
            Ok(discount) => Ok(QuoteOutcome::Quoted(DiscountQuote {
                coupon_code: coupon.code,
                order_amount,
                discount,
                payable: order_amount - discount,
            })),
            Err(e) => Ok(QuoteOutcome::Rejected(e.into())),
        }
    }

    /// Messages the worker gave up on, oldest first.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, CouponError> {
        self.dead_letters.list(limit).await
    }
}
