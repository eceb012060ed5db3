//! Per-policy quota counters and the allocator built on them.
//!
//! The counter is advisory: it decides admission quickly, and the coupon
//! store stays the record of what was actually issued. Every grant is a
//! single atomic decrement; a negative result is undone with a single
//! atomic increment and reported as a denial.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use sled::{Db, Tree};

use crate::error::{CounterError, CouponError};
use crate::policy::CouponPolicy;
use crate::types::{Clock, PolicyId, TimeStamp};

const RESTORE_ATTEMPTS: u32 = 3;

/// Atomic integer counters with optional expiry. Reads and writes of an
/// expired key behave as if the key were absent.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically subtract one. `None` when the key is absent.
    async fn decrement(&self, key: &str) -> Result<Option<i64>, CounterError>;

    /// Atomically add one. `None` when the key is absent.
    async fn increment(&self, key: &str) -> Result<Option<i64>, CounterError>;

    async fn get(&self, key: &str) -> Result<Option<i64>, CounterError>;

    /// Write `value`. With `only_if_absent` an existing live key is left alone
    /// and `false` is returned.
    async fn set(
        &self,
        key: &str,
        value: i64,
        expires_at: Option<TimeStamp<Utc>>,
        only_if_absent: bool,
    ) -> Result<bool, CounterError>;

    /// Move the expiry of a live key. `false` when the key is absent.
    async fn expire_at(&self, key: &str, at: TimeStamp<Utc>) -> Result<bool, CounterError>;

    async fn remove(&self, key: &str) -> Result<(), CounterError>;

    /// Drop expired keys eagerly; returns how many were dropped
    async fn sweep_expired(&self) -> Result<usize, CounterError> {
        Ok(0)
    }
}

#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    value: i64,
    expires_at: Option<TimeStamp<Utc>>,
}

impl CounterEntry {
    fn is_expired(&self, now: &TimeStamp<Utc>) -> bool {
        self.expires_at.is_some_and(|at| *now >= at)
    }
}

/// In-process counters. Each dashmap shard lock makes a single operation atomic.
pub struct MemoryCounterStore {
    entries: DashMap<String, CounterEntry>,
    clock: Arc<dyn Clock>,
}

impl MemoryCounterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Drop every expired key; returns how many were dropped
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(&now));
        before.saturating_sub(self.entries.len())
    }

    fn add(&self, key: &str, delta: i64) -> Option<i64> {
        let now = self.clock.now();
        let mut entry = self.entries.get_mut(key)?;
        if entry.is_expired(&now) {
            drop(entry);
            self.entries.remove_if(key, |_, e| e.is_expired(&now));
            return None;
        }
        entry.value += delta;
        Some(entry.value)
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn decrement(&self, key: &str) -> Result<Option<i64>, CounterError> {
        Ok(self.add(key, -1))
    }

    async fn increment(&self, key: &str) -> Result<Option<i64>, CounterError> {
        Ok(self.add(key, 1))
    }

    async fn get(&self, key: &str) -> Result<Option<i64>, CounterError> {
        let now = self.clock.now();
        Ok(self
            .entries
            .get(key)
            .filter(|e| !e.is_expired(&now))
            .map(|e| e.value))
    }

    async fn set(
        &self,
        key: &str,
        value: i64,
        expires_at: Option<TimeStamp<Utc>>,
        only_if_absent: bool,
    ) -> Result<bool, CounterError> {
        let now = self.clock.now();
        let fresh = CounterEntry { value, expires_at };
        match self.entries.entry(key.to_owned()) {
            Entry::Occupied(mut slot) => {
                if only_if_absent && !slot.get().is_expired(&now) {
                    return Ok(false);
                }
                slot.insert(fresh);
                Ok(true)
            }
            Entry::Vacant(slot) => {
                slot.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn expire_at(&self, key: &str, at: TimeStamp<Utc>) -> Result<bool, CounterError> {
        let now = self.clock.now();
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(&now) => {
                entry.expires_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove(&self, key: &str) -> Result<(), CounterError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn sweep_expired(&self) -> Result<usize, CounterError> {
        Ok(self.purge_expired())
    }
}

/// Counters kept in a sled tree so they survive a restart.
///
/// Value layout: big-endian `i64` count followed by big-endian `i64` expiry
/// in unix millis (`i64::MAX` for none).
pub struct SledCounterStore {
    counters: Tree,
    clock: Arc<dyn Clock>,
}

const NO_EXPIRY: i64 = i64::MAX;

fn encode_entry(entry: CounterEntry) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(&entry.value.to_be_bytes());
    let expiry = entry
        .expires_at
        .map(|at| at.timestamp_millis())
        .unwrap_or(NO_EXPIRY);
    out.extend_from_slice(&expiry.to_be_bytes());
    out
}

fn decode_entry(bytes: &[u8]) -> Option<CounterEntry> {
    let value = <[u8; 8]>::try_from(bytes.get(..8)?).ok()?;
    let expiry = <[u8; 8]>::try_from(bytes.get(8..16)?).ok()?;
    let expiry = i64::from_be_bytes(expiry);
    Some(CounterEntry {
        value: i64::from_be_bytes(value),
        expires_at: (expiry != NO_EXPIRY).then(|| TimeStamp::from_millis(expiry)),
    })
}

impl SledCounterStore {
    pub const COUNTERS_TREE: &'static str = "quota_counters";

    pub fn open(db: &Db, clock: Arc<dyn Clock>) -> Result<Self, CounterError> {
        Ok(Self {
            counters: db.open_tree(Self::COUNTERS_TREE)?,
            clock,
        })
    }

    /// Drop every expired key; returns how many were dropped
    pub fn purge_expired(&self) -> Result<usize, CounterError> {
        let now = self.clock.now();
        let mut purged = 0;
        for entry in self.counters.iter() {
            let (key, bytes) = entry?;
            if decode_entry(&bytes).is_some_and(|e| e.is_expired(&now))
                && self
                    .counters
                    .compare_and_swap(&key, Some(&bytes), None::<&[u8]>)?
                    .is_ok()
            {
                purged += 1;
            }
        }
        Ok(purged)
    }

    fn add(&self, key: &str, delta: i64) -> Result<Option<i64>, CounterError> {
        let now = self.clock.now();
        let mut corrupt = false;
        let updated = self.counters.update_and_fetch(key, |old| {
            let old = old?;
            match decode_entry(old) {
                Some(entry) if entry.is_expired(&now) => None,
                Some(entry) => Some(encode_entry(CounterEntry {
                    value: entry.value + delta,
                    ..entry
                })),
                None => {
                    corrupt = true;
                    Some(old.to_vec())
                }
            }
        })?;
        if corrupt {
            return Err(CounterError::Corrupt(key.to_owned()));
        }
        Ok(updated.and_then(|bytes| decode_entry(&bytes)).map(|e| e.value))
    }
}

#[async_trait]
impl CounterStore for SledCounterStore {
    async fn decrement(&self, key: &str) -> Result<Option<i64>, CounterError> {
        self.add(key, -1)
    }

    async fn increment(&self, key: &str) -> Result<Option<i64>, CounterError> {
        self.add(key, 1)
    }

    async fn get(&self, key: &str) -> Result<Option<i64>, CounterError> {
        let now = self.clock.now();
        match self.counters.get(key)? {
            None => Ok(None),
            Some(bytes) => {
                let entry =
                    decode_entry(&bytes).ok_or_else(|| CounterError::Corrupt(key.to_owned()))?;
                Ok((!entry.is_expired(&now)).then_some(entry.value))
            }
        }
    }

    async fn set(
        &self,
        key: &str,
        value: i64,
        expires_at: Option<TimeStamp<Utc>>,
        only_if_absent: bool,
    ) -> Result<bool, CounterError> {
        let fresh = encode_entry(CounterEntry { value, expires_at });
        if !only_if_absent {
            self.counters.insert(key, fresh)?;
            return Ok(true);
        }
        loop {
            let now = self.clock.now();
            let current = self.counters.get(key)?;
            let live = current
                .as_deref()
                .and_then(decode_entry)
                .is_some_and(|e| !e.is_expired(&now));
            if live {
                return Ok(false);
            }
            if self
                .counters
                .compare_and_swap(key, current, Some(fresh.as_slice()))?
                .is_ok()
            {
                return Ok(true);
            }
        }
    }

    async fn expire_at(&self, key: &str, at: TimeStamp<Utc>) -> Result<bool, CounterError> {
        let now = self.clock.now();
        let mut found = false;
        self.counters.update_and_fetch(key, |old| {
            let old = old?;
            match decode_entry(old) {
                Some(entry) if !entry.is_expired(&now) => {
                    found = true;
                    Some(encode_entry(CounterEntry {
                        expires_at: Some(at),
                        ..entry
                    }))
                }
                _ => Some(old.to_vec()),
            }
        })?;
        Ok(found)
    }

    async fn remove(&self, key: &str) -> Result<(), CounterError> {
        self.counters.remove(key)?;
        Ok(())
    }

    async fn sweep_expired(&self) -> Result<usize, CounterError> {
        self.purge_expired()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Granted { remaining: i64 },
    Denied,
    /// No live counter for the policy; it has to be reconciled first
    Uninitialized,
}

/// Admission gate in front of the issuance channel. Every call is bounded by
/// `timeout`; a slow or failing counter store denies by returning an error.
#[derive(Clone)]
pub struct QuotaAllocator {
    store: Arc<dyn CounterStore>,
    timeout: Duration,
}

impl QuotaAllocator {
    pub fn new(store: Arc<dyn CounterStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn counter_key(policy_id: &PolicyId) -> String {
        format!("coupon:quota:{policy_id}")
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, CounterError>>,
    ) -> Result<T, CouponError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(CouponError::CounterTimeout),
        }
    }

    fn initial_value(policy: &CouponPolicy, issued: u64) -> i64 {
        i64::try_from(policy.total_quantity.saturating_sub(issued)).unwrap_or(i64::MAX)
    }

    /// Overwrite the counter with `total - issued`, expiring at the window end.
    pub async fn initialize(&self, policy: &CouponPolicy, issued: u64) -> Result<(), CouponError> {
        let key = Self::counter_key(&policy.id);
        let value = Self::initial_value(policy, issued);
        self.bounded(self.store.set(&key, value, Some(policy.end_time), false))
            .await?;
        tracing::info!(policy_id = %policy.id, remaining = value, "quota counter initialized");
        Ok(())
    }

    /// Same as `initialize` but leaves a live counter untouched. Returns
    /// whether this call wrote the counter.
    pub async fn ensure_initialized(
        &self,
        policy: &CouponPolicy,
        issued: u64,
    ) -> Result<bool, CouponError> {
        let key = Self::counter_key(&policy.id);
        let value = Self::initial_value(policy, issued);
        let written = self
            .bounded(self.store.set(&key, value, Some(policy.end_time), true))
            .await?;
        if written {
            tracing::info!(policy_id = %policy.id, remaining = value, "quota counter reconciled");
        }
        Ok(written)
    }

    pub async fn try_reserve(&self, policy_id: &PolicyId) -> Result<Reservation, CouponError> {
        let key = Self::counter_key(policy_id);
        match self.bounded(self.store.decrement(&key)).await? {
            None => Ok(Reservation::Uninitialized),
            Some(remaining) if remaining >= 0 => Ok(Reservation::Granted { remaining }),
            Some(_) => {
                // overshoot; hand the slot back before denying
                self.restore_overshoot(policy_id, &key).await?;
                Ok(Reservation::Denied)
            }
        }
    }

    /// Undo the decrement of a denied reservation. A counter left negative
    /// would hide a slot for good, so the increment is retried before the
    /// failure goes back to the caller.
    async fn restore_overshoot(&self, policy_id: &PolicyId, key: &str) -> Result<(), CouponError> {
        let mut attempt = 1;
        loop {
            match self.bounded(self.store.increment(key)).await {
                Ok(_) => return Ok(()),
                Err(e) if attempt < RESTORE_ATTEMPTS => {
                    tracing::warn!(
                        %policy_id,
                        attempt,
                        error = %e,
                        "retrying quota counter restore"
                    );
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        %policy_id,
                        attempts = attempt,
                        error = %e,
                        "failed to restore overshot quota counter; quota leaked"
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Give one slot back.
    pub async fn release(&self, policy_id: &PolicyId) -> Result<(), CouponError> {
        let key = Self::counter_key(policy_id);
        if self.bounded(self.store.increment(&key)).await?.is_none() {
            tracing::debug!(%policy_id, "release on missing quota counter ignored");
        }
        Ok(())
    }

    /// Slots left, clamped at zero. `None` when no live counter exists.
    pub async fn remaining(&self, policy_id: &PolicyId) -> Result<Option<u64>, CouponError> {
        let key = Self::counter_key(policy_id);
        let value = self.bounded(self.store.get(&key)).await?;
        Ok(value.map(|v| u64::try_from(v.max(0)).unwrap_or(0)))
    }

    /// Follow a window extension so the counter outlives the old end time.
    pub async fn extend(&self, policy: &CouponPolicy) -> Result<bool, CouponError> {
        let key = Self::counter_key(&policy.id);
        self.bounded(self.store.expire_at(&key, policy.end_time)).await
    }
}
