//! Read-through mirror of remaining quota and coupon snapshots.
//!
//! Nothing that decides admission, issuance or a state transition reads from
//! here. Entries never outlive the policy window nor `max_ttl`.
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;

use crate::coupon::Coupon;
use crate::policy::CouponPolicy;
use crate::types::{Clock, CouponCode, PolicyId, TimeStamp};

#[derive(Debug, Clone)]
struct Cached<T> {
    value: T,
    expires_at: TimeStamp<Utc>,
}

pub struct CouponCache {
    enabled: bool,
    max_ttl: Duration,
    clock: Arc<dyn Clock>,
    remaining: DashMap<PolicyId, Cached<u64>>,
    coupons: DashMap<CouponCode, Cached<Coupon>>,
}

impl CouponCache {
    pub fn new(enabled: bool, max_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            enabled,
            max_ttl,
            clock,
            remaining: DashMap::new(),
            coupons: DashMap::new(),
        }
    }

    fn expiry_for(&self, policy: &CouponPolicy, now: TimeStamp<Utc>) -> Option<TimeStamp<Utc>> {
        let max = chrono::Duration::from_std(self.max_ttl).ok()?;
        let expires_at = now.plus(max).min(policy.end_time);
        (expires_at > now).then_some(expires_at)
    }

    pub fn remaining(&self, policy_id: &PolicyId) -> Option<u64> {
        let now = self.clock.now();
        let hit = self
            .remaining
            .get(policy_id)
            .filter(|c| c.expires_at > now)
            .map(|c| c.value);
        if hit.is_none() {
            self.remaining.remove_if(policy_id, |_, c| c.expires_at <= now);
        }
        hit
    }

    pub fn put_remaining(&self, policy: &CouponPolicy, value: u64) {
        if !self.enabled {
            return;
        }
        if let Some(expires_at) = self.expiry_for(policy, self.clock.now()) {
            self.remaining
                .insert(policy.id.clone(), Cached { value, expires_at });
        }
    }

    pub fn coupon(&self, code: &CouponCode) -> Option<Coupon> {
        let now = self.clock.now();
        let hit = self
            .coupons
            .get(code)
            .filter(|c| c.expires_at > now)
            .map(|c| c.value.clone());
        if hit.is_none() {
            self.coupons.remove_if(code, |_, c| c.expires_at <= now);
        }
        hit
    }

    pub fn put_coupon(&self, coupon: &Coupon, policy: &CouponPolicy) {
        if !self.enabled {
            return;
        }
        if let Some(expires_at) = self.expiry_for(policy, self.clock.now()) {
            self.coupons.insert(
                coupon.code.clone(),
                Cached {
                    value: coupon.clone(),
                    expires_at,
                },
            );
        }
    }

    pub fn invalidate_coupon(&self, code: &CouponCode) {
        self.coupons.remove(code);
    }

    pub fn invalidate_remaining(&self, policy_id: &PolicyId) {
        self.remaining.remove(policy_id);
    }
}
