use crate::coupon::CouponStatus;
use crate::types::PolicyId;

/// System faults. Anything here is either retried internally or surfaced to
/// the caller as a "try again" signal; expected business outcomes live in the
/// rejection enums below.
#[derive(thiserror::Error, Debug)]
pub enum CouponError {
    #[error("storage failure: {0}")]
    Storage(#[from] sled::Error),
    #[error("failed to encode record: {0}")]
    Encode(String),
    #[error("failed to decode record: {0}")]
    Decode(#[from] minicbor::decode::Error),
    #[error("coupon policy {0} not found")]
    PolicyNotFound(PolicyId),
    #[error("coupon policy code {0} is already taken")]
    DuplicatePolicyCode(String),
    #[error(transparent)]
    InvalidPolicy(#[from] PolicyError),
    #[error(transparent)]
    Counter(#[from] CounterError),
    #[error("quota counter did not answer within the admission timeout")]
    CounterTimeout,
    #[error("issuance channel is closed")]
    ChannelClosed,
    #[error("issuance channel did not accept the message within the enqueue timeout")]
    EnqueueTimeout,
    #[error("failed to generate coupon code: {0}")]
    CodeGeneration(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CouponError {
    /// Faults worth retrying with backoff. Everything else is permanent for
    /// the message or request that hit it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CouponError::Storage(_)
                | CouponError::Counter(CounterError::Unavailable(_) | CounterError::Storage(_))
                | CouponError::CounterTimeout
                | CouponError::EnqueueTimeout
        )
    }

    pub(crate) fn encode<E: std::fmt::Display>(err: E) -> Self {
        CouponError::Encode(err.to_string())
    }
}

/// Why a claim was refused at admission. Expected under load, not a failure.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimRejection {
    #[error("coupon quantity exhausted")]
    QuotaExceeded,
    #[error("coupon policy not active yet")]
    PolicyNotActive,
    #[error("coupon policy expired")]
    PolicyExpired,
}

/// Illegal lifecycle transitions on a single coupon.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionError {
    #[error("coupon has already been used")]
    AlreadyUsed,
    #[error("coupon has expired")]
    Expired,
    #[error("coupon canceled")]
    Canceled,
    #[error("coupon issuance has not completed")]
    Pending,
    #[error("coupon has not been used")]
    NotUsed,
    #[error("coupon cannot move from {from:?} to {to:?}")]
    Illegal { from: CouponStatus, to: CouponStatus },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("coupon policy is missing {0}")]
    MissingField(&'static str),
    #[error("coupon policy total quantity must be at least 1")]
    ZeroQuantity,
    #[error("coupon policy start time must be before its end time")]
    EmptyWindow,
    #[error("invalid discount rule: {0}")]
    InvalidDiscount(&'static str),
    #[error("coupon policy end time can only be extended")]
    ShortenedWindow,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscountError {
    #[error("order amount {actual} is below coupon minimum requirement {minimum}")]
    BelowMinimum { minimum: u64, actual: u64 },
}

/// Why a coupon cannot be applied to an order.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteRejection {
    #[error(transparent)]
    Coupon(#[from] TransitionError),
    #[error(transparent)]
    Discount(#[from] DiscountError),
}

#[derive(thiserror::Error, Debug)]
pub enum CounterError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    #[error("counter value for {0} is corrupt")]
    Corrupt(String),
    #[error(transparent)]
    Storage(#[from] sled::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}
