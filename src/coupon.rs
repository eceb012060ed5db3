//! Issued coupon and its lifecycle.
//!
//! ```text
//! Pending ──activate──► Available ──redeem──► Used ──cancel──► Canceled
//!    │                      │
//!    └──────expire──────────┴──► Expired
//! ```
//!
//! Every transition returns the next version of the coupon instead of
//! mutating in place, so the caller can persist it as a compare-and-swap
//! against the version it read. Expiry is evaluated lazily against the
//! owning policy's window; nothing sweeps the table.
use chrono::Utc;

use crate::error::TransitionError;
use crate::policy::CouponPolicy;
use crate::types::{CouponCode, CouponId, OrderId, PolicyId, RequestId, TimeStamp, UserId};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CouponStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Available,
    #[n(2)]
    Used,
    #[n(3)]
    Expired,
    #[n(4)]
    Canceled,
}

impl CouponStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CouponStatus::Pending => "PENDING",
            CouponStatus::Available => "AVAILABLE",
            CouponStatus::Used => "USED",
            CouponStatus::Expired => "EXPIRED",
            CouponStatus::Canceled => "CANCELED",
        }
    }

    /// States that no transition leaves
    pub fn is_terminal(&self) -> bool {
        matches!(self, CouponStatus::Expired | CouponStatus::Canceled)
    }
}

impl std::fmt::Display for CouponStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Coupon {
    #[n(0)]
    pub id: CouponId,
    #[n(1)]
    pub code: CouponCode,
    #[n(2)]
    pub policy_id: PolicyId,
    #[n(3)]
    pub user_id: UserId,
    #[n(4)]
    pub request_id: RequestId,
    #[n(5)]
    pub status: CouponStatus,
    #[n(6)]
    pub order_id: Option<OrderId>, // only while Used
    #[n(7)]
    pub used_at: Option<TimeStamp<Utc>>,
    #[n(8)]
    pub created_at: TimeStamp<Utc>,
    #[n(9)]
    pub updated_at: TimeStamp<Utc>,
}

impl Coupon {
    pub fn pending(
        code: CouponCode,
        policy_id: PolicyId,
        user_id: UserId,
        request_id: RequestId,
        now: TimeStamp<Utc>,
    ) -> Self {
        Self {
            id: CouponId::generate(),
            code,
            policy_id,
            user_id,
            request_id,
            status: CouponStatus::Pending,
            order_id: None,
            used_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True once the policy window has closed on a coupon nobody redeemed
    pub fn is_expired(&self, policy: &CouponPolicy, now: &TimeStamp<Utc>) -> bool {
        match self.status {
            CouponStatus::Expired => true,
            CouponStatus::Pending | CouponStatus::Available => policy.has_ended(now),
            CouponStatus::Used | CouponStatus::Canceled => false,
        }
    }

    /// Status as a reader should see it, with lazy expiry applied
    pub fn effective_status(&self, policy: &CouponPolicy, now: &TimeStamp<Utc>) -> CouponStatus {
        if self.is_expired(policy, now) {
            CouponStatus::Expired
        } else {
            self.status
        }
    }

    pub fn is_used(&self) -> bool {
        self.status == CouponStatus::Used
    }

    /// Issuance committed: `Pending → Available`
    pub fn activate(&self, now: TimeStamp<Utc>) -> Result<Coupon, TransitionError> {
        match self.status {
            CouponStatus::Pending => Ok(Coupon {
                status: CouponStatus::Available,
                updated_at: now,
                ..self.clone()
            }),
            from => Err(TransitionError::Illegal {
                from,
                to: CouponStatus::Available,
            }),
        }
    }

    /// Whether `redeem` would succeed right now
    pub fn check_redeemable(
        &self,
        policy: &CouponPolicy,
        now: &TimeStamp<Utc>,
    ) -> Result<(), TransitionError> {
        match self.status {
            CouponStatus::Used => Err(TransitionError::AlreadyUsed),
            CouponStatus::Canceled => Err(TransitionError::Canceled),
            CouponStatus::Expired => Err(TransitionError::Expired),
            _ if self.is_expired(policy, now) => Err(TransitionError::Expired),
            CouponStatus::Pending => Err(TransitionError::Pending),
            CouponStatus::Available => Ok(()),
        }
    }

    /// Redeem against an order: `Available → Used`
    pub fn redeem(
        &self,
        order_id: OrderId,
        policy: &CouponPolicy,
        now: TimeStamp<Utc>,
    ) -> Result<Coupon, TransitionError> {
        self.check_redeemable(policy, &now)?;
        Ok(Coupon {
            status: CouponStatus::Used,
            order_id: Some(order_id),
            used_at: Some(now),
            updated_at: now,
            ..self.clone()
        })
    }

    /// Reverse a redemption: `Used → Canceled`. Canceled is terminal.
    pub fn cancel(&self, now: TimeStamp<Utc>) -> Result<Coupon, TransitionError> {
        match self.status {
            CouponStatus::Used => Ok(Coupon {
                status: CouponStatus::Canceled,
                order_id: None,
                used_at: None,
                updated_at: now,
                ..self.clone()
            }),
            CouponStatus::Pending
            | CouponStatus::Available
            | CouponStatus::Expired
            | CouponStatus::Canceled => Err(TransitionError::NotUsed),
        }
    }

    /// Persist lazy expiry: `Pending | Available → Expired`
    pub fn expire(&self, now: TimeStamp<Utc>) -> Result<Coupon, TransitionError> {
        match self.status {
            CouponStatus::Pending | CouponStatus::Available => Ok(Coupon {
                status: CouponStatus::Expired,
                updated_at: now,
                ..self.clone()
            }),
            from => Err(TransitionError::Illegal {
                from,
                to: CouponStatus::Expired,
            }),
        }
    }
}
