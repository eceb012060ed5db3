pub mod backoff;
pub mod cache;
pub mod channel;
pub mod config;
pub mod coupon;
pub mod coupon_store;
pub mod dead_letter;
pub mod error;
pub mod policy;
pub mod policy_store;
pub mod quota;
pub mod runtime;
pub mod service;
pub mod types;
pub mod utils;
pub mod worker;

pub use config::CouponConfig;
pub use coupon::{Coupon, CouponStatus};
pub use error::{ClaimRejection, CouponError, QuoteRejection, TransitionError};
pub use policy::{CouponPolicy, CouponPolicyBuilder, DiscountRule};
pub use runtime::{CouponRuntime, RuntimeParts};
pub use service::{CancelOutcome, ClaimOutcome, CouponService, QuoteOutcome, UseOutcome};
