//! Coupon policy: quota, validity window and discount rule
use chrono::Utc;

use crate::error::{DiscountError, PolicyError};
use crate::types::{PolicyId, TimeStamp};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscountKind {
    #[n(0)]
    FixedAmount,
    #[n(1)]
    Percentage,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct DiscountRule {
    #[n(0)]
    pub kind: DiscountKind,
    #[n(1)]
    pub value: u64, // currency units, or percent for Percentage
    #[n(2)]
    pub minimum_order_amount: u64,
    #[n(3)]
    pub maximum_discount_amount: u64,
}

impl DiscountRule {
    pub fn fixed(value: u64) -> Self {
        Self {
            kind: DiscountKind::FixedAmount,
            value,
            minimum_order_amount: 0,
            maximum_discount_amount: value,
        }
    }
    pub fn percentage(percent: u64, maximum_discount_amount: u64) -> Self {
        Self {
            kind: DiscountKind::Percentage,
            value: percent,
            minimum_order_amount: 0,
            maximum_discount_amount,
        }
    }
    pub fn with_minimum_order(mut self, amount: u64) -> Self {
        self.minimum_order_amount = amount;
        self
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.value == 0 {
            return Err(PolicyError::InvalidDiscount("discount value must be at least 1"));
        }
        if self.kind == DiscountKind::Percentage && self.value > 100 {
            return Err(PolicyError::InvalidDiscount("percentage cannot exceed 100"));
        }
        if self.maximum_discount_amount == 0 {
            return Err(PolicyError::InvalidDiscount(
                "maximum discount amount must be at least 1",
            ));
        }
        Ok(())
    }

    /// Discount granted on an order of `order_amount`. Never exceeds the
    /// configured cap nor the order itself.
    pub fn discount_for(&self, order_amount: u64) -> Result<u64, DiscountError> {
        if order_amount < self.minimum_order_amount {
            return Err(DiscountError::BelowMinimum {
                minimum: self.minimum_order_amount,
                actual: order_amount,
            });
        }
        let raw = match self.kind {
            DiscountKind::FixedAmount => self.value,
            DiscountKind::Percentage => order_amount.saturating_mul(self.value) / 100,
        };
        Ok(raw.min(self.maximum_discount_amount).min(order_amount))
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct CouponPolicy {
    #[n(0)]
    pub id: PolicyId,
    #[n(1)]
    pub code: String,
    #[n(2)]
    pub name: String,
    #[n(3)]
    pub description: String,
    #[n(4)]
    pub total_quantity: u64,
    #[n(5)]
    pub start_time: TimeStamp<Utc>,
    #[n(6)]
    pub end_time: TimeStamp<Utc>,
    #[n(7)]
    pub discount: DiscountRule,
    #[n(8)]
    pub created_at: TimeStamp<Utc>,
    #[n(9)]
    pub updated_at: TimeStamp<Utc>,
}

/// Where `now` sits relative to the half-open window `[start_time, end_time)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    NotStarted,
    Active,
    Ended,
}

impl CouponPolicy {
    pub fn window_state(&self, now: &TimeStamp<Utc>) -> WindowState {
        if *now < self.start_time {
            WindowState::NotStarted
        } else if *now >= self.end_time {
            WindowState::Ended
        } else {
            WindowState::Active
        }
    }

    pub fn is_active(&self, now: &TimeStamp<Utc>) -> bool {
        self.window_state(now) == WindowState::Active
    }

    pub fn has_ended(&self, now: &TimeStamp<Utc>) -> bool {
        self.window_state(now) == WindowState::Ended
    }

    /// Copy of this policy with a later end time
    pub fn extended_to(
        &self,
        end_time: TimeStamp<Utc>,
        now: TimeStamp<Utc>,
    ) -> Result<CouponPolicy, PolicyError> {
        if end_time < self.end_time {
            return Err(PolicyError::ShortenedWindow);
        }
        Ok(CouponPolicy {
            end_time,
            updated_at: now,
            ..self.clone()
        })
    }
}

/// Draft of a policy. Nothing is stored until `validate_and_finalise` passes.
#[derive(Debug, Default, Clone)]
pub struct CouponPolicyBuilder {
    code: Option<String>,
    name: Option<String>,
    description: String,
    total_quantity: u64,
    start_time: Option<TimeStamp<Utc>>,
    end_time: Option<TimeStamp<Utc>>,
    discount: Option<DiscountRule>,
}

impl CouponPolicyBuilder {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
    pub fn set_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
    pub fn set_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
    pub fn set_total_quantity(mut self, quantity: u64) -> Self {
        self.total_quantity = quantity;
        self
    }
    pub fn set_start_time(mut self, at: TimeStamp<Utc>) -> Self {
        self.start_time = Some(at);
        self
    }
    pub fn set_end_time(mut self, at: TimeStamp<Utc>) -> Self {
        self.end_time = Some(at);
        self
    }
    pub fn set_discount(mut self, rule: DiscountRule) -> Self {
        self.discount = Some(rule);
        self
    }

    pub fn validate_and_finalise(self, now: TimeStamp<Utc>) -> Result<CouponPolicy, PolicyError> {
        let code = self
            .code
            .filter(|c| !c.trim().is_empty())
            .ok_or(PolicyError::MissingField("code"))?;
        let name = self
            .name
            .filter(|n| !n.trim().is_empty())
            .ok_or(PolicyError::MissingField("name"))?;
        let start_time = self.start_time.ok_or(PolicyError::MissingField("start time"))?;
        let end_time = self.end_time.ok_or(PolicyError::MissingField("end time"))?;
        let discount = self.discount.ok_or(PolicyError::MissingField("discount rule"))?;

        if self.total_quantity == 0 {
            return Err(PolicyError::ZeroQuantity);
        }
        if start_time >= end_time {
            return Err(PolicyError::EmptyWindow);
        }
        discount.validate()?;

        Ok(CouponPolicy {
            id: PolicyId::generate(),
            code,
            name,
            description: self.description,
            total_quantity: self.total_quantity,
            start_time,
            end_time,
            discount,
            created_at: now,
            updated_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn draft() -> CouponPolicyBuilder {
        let start = TimeStamp::new_with(2025, 11, 28, 0, 0, 0);
        CouponPolicyBuilder::new()
            .set_code("BF-2025")
            .set_name("Black Friday")
            .set_total_quantity(100)
            .set_start_time(start)
            .set_end_time(start.plus(Duration::hours(24)))
            .set_discount(DiscountRule::fixed(5_000))
    }

    #[test]
    fn builder_produces_policy() {
        let policy = draft().validate_and_finalise(TimeStamp::new()).unwrap();
        assert_eq!(policy.total_quantity, 100);
        assert_eq!(policy.code, "BF-2025");
    }

    #[test]
    fn builder_rejects_zero_quantity_and_empty_window() {
        let err = draft()
            .set_total_quantity(0)
            .validate_and_finalise(TimeStamp::new())
            .unwrap_err();
        assert_eq!(err, PolicyError::ZeroQuantity);

        let start = TimeStamp::new_with(2025, 11, 28, 0, 0, 0);
        let err = draft()
            .set_end_time(start)
            .validate_and_finalise(TimeStamp::new())
            .unwrap_err();
        assert_eq!(err, PolicyError::EmptyWindow);
    }

    #[test]
    fn builder_requires_name() {
        let err = draft()
            .set_name("  ")
            .validate_and_finalise(TimeStamp::new())
            .unwrap_err();
        assert_eq!(err, PolicyError::MissingField("name"));
    }

    #[test]
    fn window_is_half_open() {
        let policy = draft().validate_and_finalise(TimeStamp::new()).unwrap();
        let just_before = policy.start_time.minus(Duration::milliseconds(1));

        assert_eq!(policy.window_state(&just_before), WindowState::NotStarted);
        assert_eq!(policy.window_state(&policy.start_time), WindowState::Active);
        assert_eq!(policy.window_state(&policy.end_time), WindowState::Ended);
    }

    #[test]
    fn percentage_discount_is_capped() {
        let rule = DiscountRule::percentage(10, 3_000).with_minimum_order(10_000);

        assert_eq!(rule.discount_for(20_000), Ok(2_000));
        assert_eq!(rule.discount_for(50_000), Ok(3_000));
        assert_eq!(
            rule.discount_for(9_999),
            Err(DiscountError::BelowMinimum {
                minimum: 10_000,
                actual: 9_999
            })
        );
    }

    #[test]
    fn fixed_discount_never_exceeds_order() {
        let rule = DiscountRule::fixed(5_000);
        assert_eq!(rule.discount_for(3_000), Ok(3_000));
        assert_eq!(rule.discount_for(8_000), Ok(5_000));
    }

    #[test]
    fn percentage_above_hundred_is_rejected() {
        let rule = DiscountRule::percentage(150, 1_000);
        assert!(rule.validate().is_err());
    }

    #[test]
    fn end_time_can_only_grow() {
        let policy = draft().validate_and_finalise(TimeStamp::new()).unwrap();
        let later = policy.end_time.plus(Duration::hours(1));
        let earlier = policy.end_time.minus(Duration::hours(1));

        assert_eq!(
            policy.extended_to(later, TimeStamp::new()).unwrap().end_time,
            later
        );
        assert_eq!(
            policy.extended_to(earlier, TimeStamp::new()),
            Err(PolicyError::ShortenedWindow)
        );
    }
}
