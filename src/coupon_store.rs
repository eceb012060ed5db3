//! Durable record of issued coupons.
//!
//! Rows live in one tree keyed by coupon id. A second tree holds every index
//! the issuance path needs, so the idempotent insert is a single two-tree
//! transaction:
//!
//! - `code␟{code}` → coupon id
//! - `request␟{request}` → coupon id (redelivery detection)
//! - `claim␟{sha256(policy,user)}` → coupon id (one coupon per user per policy)
//! - `user␟{user}␟{id}`, `policy␟{policy}␟{id}` → listing entries
//! - `issued␟{policy}` → committed count, big-endian u64
use async_trait::async_trait;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use sled::{Db, Transactional, Tree};

use crate::coupon::Coupon;
use crate::error::CouponError;
use crate::types::{CouponCode, CouponId, PolicyId, RequestId, UserId};
use crate::utils::claim_digest;

const SEP: char = '\u{1f}';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(Coupon),
    /// The same request was stored before; this is a redelivery
    AlreadyIssued(Coupon),
    /// The user already holds a coupon of this policy from another request
    DuplicateClaim(Coupon),
    /// Committed coupons already reach the policy quantity
    QuotaExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapOutcome {
    Swapped(Coupon),
    /// Row changed since it was read; carries what is stored now
    Conflict(Option<Coupon>),
}

#[async_trait]
pub trait CouponStore: Send + Sync {
    /// Idempotent issuance insert guarded by the request index, the
    /// `(policy, user)` unique index and the committed count.
    async fn insert_pending(
        &self,
        coupon: Coupon,
        total_quantity: u64,
    ) -> Result<InsertOutcome, CouponError>;

    /// Replace `current` with `next` only if the stored row still equals `current`.
    async fn compare_and_swap(
        &self,
        current: &Coupon,
        next: Coupon,
    ) -> Result<SwapOutcome, CouponError>;

    async fn find_by_id(&self, id: &CouponId) -> Result<Option<Coupon>, CouponError>;

    async fn find_by_code(&self, code: &CouponCode) -> Result<Option<Coupon>, CouponError>;

    async fn find_by_request(&self, request: &RequestId) -> Result<Option<Coupon>, CouponError>;

    async fn find_by_claim(
        &self,
        policy_id: &PolicyId,
        user_id: &UserId,
    ) -> Result<Option<Coupon>, CouponError>;

    async fn list_by_user(&self, user_id: &UserId) -> Result<Vec<Coupon>, CouponError>;

    async fn list_by_policy(&self, policy_id: &PolicyId) -> Result<Vec<Coupon>, CouponError>;

    /// Coupons ever committed for the policy
    async fn issued_count(&self, policy_id: &PolicyId) -> Result<u64, CouponError>;
}

pub struct SledCouponStore {
    coupons: Tree,
    index: Tree,
}

fn code_key(code: &CouponCode) -> String {
    format!("code{SEP}{code}")
}
fn request_key(request: &RequestId) -> String {
    format!("request{SEP}{request}")
}
fn claim_key(policy_id: &PolicyId, user_id: &UserId) -> String {
    format!("claim{SEP}{}", claim_digest(policy_id, user_id))
}
fn user_prefix(user_id: &UserId) -> String {
    format!("user{SEP}{user_id}{SEP}")
}
fn policy_prefix(policy_id: &PolicyId) -> String {
    format!("policy{SEP}{policy_id}{SEP}")
}
fn issued_key(policy_id: &PolicyId) -> String {
    format!("issued{SEP}{policy_id}")
}

fn decode_count(bytes: Option<&[u8]>) -> u64 {
    bytes
        .and_then(|b| <[u8; 8]>::try_from(b).ok())
        .map(u64::from_be_bytes)
        .unwrap_or(0)
}

fn read_row(
    coupons: &TransactionalTree,
    id: &[u8],
) -> ConflictableTransactionResult<Coupon, CouponError> {
    let Some(bytes) = coupons.get(id)? else {
        return Err(ConflictableTransactionError::Abort(CouponError::Decode(
            minicbor::decode::Error::message("index points at a missing coupon row"),
        )));
    };
    minicbor::decode(&bytes).map_err(|e| ConflictableTransactionError::Abort(e.into()))
}

impl SledCouponStore {
    pub const COUPONS_TREE: &'static str = "coupons";
    pub const INDEX_TREE: &'static str = "coupon_index";

    pub fn open(db: &Db) -> Result<Self, CouponError> {
        Ok(Self {
            coupons: db.open_tree(Self::COUPONS_TREE)?,
            index: db.open_tree(Self::INDEX_TREE)?,
        })
    }

    fn load(&self, id: &[u8]) -> Result<Option<Coupon>, CouponError> {
        self.coupons
            .get(id)?
            .map(|bytes| minicbor::decode(&bytes).map_err(CouponError::from))
            .transpose()
    }

    fn load_indexed(&self, key: &str) -> Result<Option<Coupon>, CouponError> {
        match self.index.get(key)? {
            Some(id) => self.load(&id),
            None => Ok(None),
        }
    }

    fn list_prefix(&self, prefix: &str) -> Result<Vec<Coupon>, CouponError> {
        let mut out = Vec::new();
        for entry in self.index.scan_prefix(prefix) {
            let (key, _) = entry?;
            let id = &key[prefix.len()..];
            if let Some(coupon) = self.load(id)? {
                out.push(coupon);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl CouponStore for SledCouponStore {
    async fn insert_pending(
        &self,
        coupon: Coupon,
        total_quantity: u64,
    ) -> Result<InsertOutcome, CouponError> {
        let encoded = minicbor::to_vec(&coupon).map_err(CouponError::encode)?;
        let id = coupon.id.as_str().as_bytes();
        let request = request_key(&coupon.request_id);
        let claim = claim_key(&coupon.policy_id, &coupon.user_id);
        let issued = issued_key(&coupon.policy_id);
        let code = code_key(&coupon.code);
        let by_user = format!("{}{}", user_prefix(&coupon.user_id), coupon.id);
        let by_policy = format!("{}{}", policy_prefix(&coupon.policy_id), coupon.id);

        (&self.coupons, &self.index)
            .transaction(|(coupons, index)| {
                if let Some(existing) = index.get(request.as_bytes())? {
                    return Ok(InsertOutcome::AlreadyIssued(read_row(coupons, &existing)?));
                }
                if let Some(existing) = index.get(claim.as_bytes())? {
                    return Ok(InsertOutcome::DuplicateClaim(read_row(coupons, &existing)?));
                }
                let committed = decode_count(index.get(issued.as_bytes())?.as_deref());
                if committed >= total_quantity {
                    return Ok(InsertOutcome::QuotaExhausted);
                }

                coupons.insert(id, encoded.as_slice())?;
                index.insert(code.as_bytes(), id)?;
                index.insert(request.as_bytes(), id)?;
                index.insert(claim.as_bytes(), id)?;
                index.insert(by_user.as_bytes(), &b""[..])?;
                index.insert(by_policy.as_bytes(), &b""[..])?;
                index.insert(issued.as_bytes(), &(committed + 1).to_be_bytes()[..])?;
                Ok(InsertOutcome::Inserted(coupon.clone()))
            })
            .map_err(|e| match e {
                TransactionError::Abort(e) => e,
                TransactionError::Storage(e) => CouponError::Storage(e),
            })
    }

    async fn compare_and_swap(
        &self,
        current: &Coupon,
        next: Coupon,
    ) -> Result<SwapOutcome, CouponError> {
        let expected = minicbor::to_vec(current).map_err(CouponError::encode)?;
        let proposed = minicbor::to_vec(&next).map_err(CouponError::encode)?;

        match self
            .coupons
            .compare_and_swap(current.id.as_str(), Some(expected), Some(proposed))?
        {
            Ok(()) => Ok(SwapOutcome::Swapped(next)),
            Err(conflict) => {
                let stored = conflict
                    .current
                    .map(|bytes| minicbor::decode(&bytes))
                    .transpose()?;
                Ok(SwapOutcome::Conflict(stored))
            }
        }
    }

    async fn find_by_id(&self, id: &CouponId) -> Result<Option<Coupon>, CouponError> {
        self.load(id.as_str().as_bytes())
    }

    async fn find_by_code(&self, code: &CouponCode) -> Result<Option<Coupon>, CouponError> {
        self.load_indexed(&code_key(code))
    }

    async fn find_by_request(&self, request: &RequestId) -> Result<Option<Coupon>, CouponError> {
        self.load_indexed(&request_key(request))
    }

    async fn find_by_claim(
        &self,
        policy_id: &PolicyId,
        user_id: &UserId,
    ) -> Result<Option<Coupon>, CouponError> {
        self.load_indexed(&claim_key(policy_id, user_id))
    }

    async fn list_by_user(&self, user_id: &UserId) -> Result<Vec<Coupon>, CouponError> {
        self.list_prefix(&user_prefix(user_id))
    }

    async fn list_by_policy(&self, policy_id: &PolicyId) -> Result<Vec<Coupon>, CouponError> {
        self.list_prefix(&policy_prefix(policy_id))
    }

    async fn issued_count(&self, policy_id: &PolicyId) -> Result<u64, CouponError> {
        Ok(decode_count(
            self.index.get(issued_key(policy_id))?.as_deref(),
        ))
    }
}
