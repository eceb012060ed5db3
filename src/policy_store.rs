//! Durable record of coupon policies
use async_trait::async_trait;
use chrono::Utc;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};

use crate::error::CouponError;
use crate::policy::CouponPolicy;
use crate::types::{PolicyId, TimeStamp};

#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn get_policy(&self, id: &PolicyId) -> Result<Option<CouponPolicy>, CouponError>;

    async fn get_policy_by_code(&self, code: &str) -> Result<Option<CouponPolicy>, CouponError>;

    /// Store a new policy. Codes are unique across policies.
    async fn insert_policy(&self, policy: &CouponPolicy) -> Result<(), CouponError>;

    /// Push `end_time` later; shortening is refused.
    async fn extend_end_time(
        &self,
        id: &PolicyId,
        end_time: TimeStamp<Utc>,
        now: TimeStamp<Utc>,
    ) -> Result<CouponPolicy, CouponError>;

    async fn list_policies(&self) -> Result<Vec<CouponPolicy>, CouponError>;
}

pub struct SledPolicyStore {
    policies: Tree,
    codes: Tree,
}

impl SledPolicyStore {
    pub const POLICIES_TREE: &'static str = "coupon_policies";
    pub const CODES_TREE: &'static str = "coupon_policy_codes";

    pub fn open(db: &Db) -> Result<Self, CouponError> {
        Ok(Self {
            policies: db.open_tree(Self::POLICIES_TREE)?,
            codes: db.open_tree(Self::CODES_TREE)?,
        })
    }

    fn decode(bytes: &[u8]) -> Result<CouponPolicy, CouponError> {
        Ok(minicbor::decode(bytes)?)
    }
}

#[async_trait]
impl PolicyStore for SledPolicyStore {
    async fn get_policy(&self, id: &PolicyId) -> Result<Option<CouponPolicy>, CouponError> {
        self.policies
            .get(id.as_str())?
            .map(|bytes| Self::decode(&bytes))
            .transpose()
    }

    async fn get_policy_by_code(&self, code: &str) -> Result<Option<CouponPolicy>, CouponError> {
        let Some(id) = self.codes.get(code)? else {
            return Ok(None);
        };
        self.policies
            .get(id)?
            .map(|bytes| Self::decode(&bytes))
            .transpose()
    }

    async fn insert_policy(&self, policy: &CouponPolicy) -> Result<(), CouponError> {
        let encoded = minicbor::to_vec(policy).map_err(CouponError::encode)?;
        let id = policy.id.as_str().as_bytes();
        let code = policy.code.as_bytes();

        // policy row and code index land together or not at all
        (&self.policies, &self.codes)
            .transaction(|(policies, codes)| {
                if codes.get(code)?.is_some() {
                    return Err(ConflictableTransactionError::Abort(
                        CouponError::DuplicatePolicyCode(policy.code.clone()),
                    ));
                }
                codes.insert(code, id)?;
                policies.insert(id, encoded.as_slice())?;
                Ok(())
            })
            .map_err(|e| match e {
                TransactionError::Abort(e) => e,
                TransactionError::Storage(e) => CouponError::Storage(e),
            })
    }

    async fn extend_end_time(
        &self,
        id: &PolicyId,
        end_time: TimeStamp<Utc>,
        now: TimeStamp<Utc>,
    ) -> Result<CouponPolicy, CouponError> {
        loop {
            let current = self
                .policies
                .get(id.as_str())?
                .ok_or_else(|| CouponError::PolicyNotFound(id.clone()))?;
            let extended = Self::decode(&current)?.extended_to(end_time, now)?;
            let encoded = minicbor::to_vec(&extended).map_err(CouponError::encode)?;

            // a concurrent admin edit makes us re-read and re-validate
            if self
                .policies
                .compare_and_swap(id.as_str(), Some(&current), Some(encoded))?
                .is_ok()
            {
                return Ok(extended);
            }
        }
    }

    async fn list_policies(&self) -> Result<Vec<CouponPolicy>, CouponError> {
        self.policies
            .iter()
            .values()
            .map(|bytes| Self::decode(&bytes?))
            .collect()
    }
}
