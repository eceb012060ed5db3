//! Code generation and key derivation helpers

use bech32::Bech32m;
use uuid7::uuid7;

use crate::error::CouponError;
use crate::types::{CouponCode, PolicyId, UserId};

/// Human-readable prefix of every coupon code
pub const COUPON_CODE_HRP: &str = "cpn";

// construct a unique id then encode using bech32m under the given prefix
pub fn new_uuid_to_bech32(hrp: &str) -> Result<String, CouponError> {
    let hrp = bech32::Hrp::parse(hrp).map_err(|e| CouponError::CodeGeneration(e.to_string()))?;
    bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())
        .map_err(|e| CouponError::CodeGeneration(e.to_string()))
}

pub fn new_coupon_code() -> Result<CouponCode, CouponError> {
    new_uuid_to_bech32(COUPON_CODE_HRP).map(CouponCode::from)
}

/// Digest naming the (policy, user) pair. Used as the unique-claim index key.
pub fn claim_digest(policy_id: &PolicyId, user_id: &UserId) -> String {
    // unit separator keeps "ab"+"c" and "a"+"bc" apart
    sha256::digest(format!("{}\u{1f}{}", policy_id, user_id))
}

/// Stable partition for a policy: every message of one policy lands on the
/// same partition no matter which process publishes it.
pub fn partition_for(policy_id: &PolicyId, partitions: usize) -> usize {
    if partitions <= 1 {
        return 0;
    }
    let digest = sha256::digest(policy_id.as_str());
    let prefix = hex::decode(&digest[..16]).unwrap_or_default();
    let mut word = [0u8; 8];
    let len = prefix.len().min(8);
    word[..len].copy_from_slice(&prefix[..len]);
    (u64::from_be_bytes(word) % partitions as u64) as usize
}
