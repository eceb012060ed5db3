//! Issuance messages the worker gave up on. Nothing here is replayed
//! automatically; an operator inspects and resolves each entry.
use async_trait::async_trait;
use chrono::Utc;
use sled::{Db, Tree};

use crate::error::CouponError;
use crate::types::{PolicyId, RequestId, TimeStamp};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadReason {
    #[n(0)]
    Undecodable,
    #[n(1)]
    PolicyMissing,
    #[n(2)]
    RetriesExhausted,
    #[n(3)]
    Permanent,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub partition: u32,
    #[n(2)]
    pub offset: u64,
    #[n(3)]
    pub request_id: Option<RequestId>,
    #[n(4)]
    pub policy_id: Option<PolicyId>,
    #[n(5)]
    pub reason: DeadReason,
    #[n(6)]
    pub error: String,
    #[n(7)]
    pub attempts: u32,
    #[n(8)]
    pub payload: Vec<u8>,
    #[n(9)]
    pub occurred_at: TimeStamp<Utc>,
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn push(&self, letter: DeadLetter) -> Result<(), CouponError>;

    /// Oldest first
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>, CouponError>;
}

pub struct SledDeadLetters {
    letters: Tree,
}

impl SledDeadLetters {
    pub const DEAD_LETTER_TREE: &'static str = "issuance_dead_letters";

    pub fn open(db: &Db) -> Result<Self, CouponError> {
        Ok(Self {
            letters: db.open_tree(Self::DEAD_LETTER_TREE)?,
        })
    }
}

#[async_trait]
impl DeadLetterSink for SledDeadLetters {
    async fn push(&self, letter: DeadLetter) -> Result<(), CouponError> {
        let encoded = minicbor::to_vec(&letter).map_err(CouponError::encode)?;
        // ids are uuid7, so key order is arrival order
        self.letters.insert(letter.id.as_bytes(), encoded)?;
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>, CouponError> {
        self.letters
            .iter()
            .values()
            .take(limit)
            .map(|bytes| -> Result<DeadLetter, CouponError> { Ok(minicbor::decode(&bytes?)?) })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn letter(reason: DeadReason) -> DeadLetter {
        DeadLetter {
            id: uuid7::uuid7().to_string(),
            partition: 0,
            offset: 3,
            request_id: Some(RequestId::generate()),
            policy_id: None,
            reason,
            error: "boom".into(),
            attempts: 1,
            payload: vec![0xff, 0x00],
            occurred_at: TimeStamp::new(),
        }
    }

    #[tokio::test]
    async fn letters_come_back_in_arrival_order() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let sink = SledDeadLetters::open(&db).unwrap();

        let first = letter(DeadReason::Undecodable);
        let second = letter(DeadReason::RetriesExhausted);
        sink.push(first.clone()).await.unwrap();
        sink.push(second.clone()).await.unwrap();

        assert_eq!(sink.list(10).await.unwrap(), vec![first.clone(), second]);
        assert_eq!(sink.list(1).await.unwrap(), vec![first]);
    }
}
