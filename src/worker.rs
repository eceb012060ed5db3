//! Issuance worker: turns admitted claims into durable coupons.
//!
//! One consumer task per partition. Each delivery is handled to completion
//! before the next one is taken, so a policy's messages commit in send order.
//! A failure never skips a message silently: transient faults are retried in
//! place with backoff, everything else ends in the dead-letter sink.
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backoff::RetryPolicy;
use crate::cache::CouponCache;
use crate::channel::{Delivery, IssuanceMessage, PartitionReceiver};
use crate::coupon::{Coupon, CouponStatus};
use crate::coupon_store::{CouponStore, InsertOutcome, SwapOutcome};
use crate::dead_letter::{DeadLetter, DeadLetterSink, DeadReason};
use crate::error::CouponError;
use crate::policy_store::PolicyStore;
use crate::quota::QuotaAllocator;
use crate::types::Clock;
use crate::utils::new_coupon_code;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueOutcome {
    /// New coupon committed and activated
    Issued(Coupon),
    /// Message seen before; the stored coupon is returned
    Redelivered(Coupon),
    /// User already holds a coupon of this policy; slot released
    DuplicateClaim(Coupon),
    /// Window closed before the message was processed; slot released
    PolicyExpired,
    /// Committed coupons already reach the quantity; nothing written
    QuotaExhausted,
    DeadLettered(DeadReason),
}

pub struct IssuanceWorker {
    policies: Arc<dyn PolicyStore>,
    coupons: Arc<dyn CouponStore>,
    quota: QuotaAllocator,
    dead_letters: Arc<dyn DeadLetterSink>,
    cache: Arc<CouponCache>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl IssuanceWorker {
    pub fn new(
        policies: Arc<dyn PolicyStore>,
        coupons: Arc<dyn CouponStore>,
        quota: QuotaAllocator,
        dead_letters: Arc<dyn DeadLetterSink>,
        cache: Arc<CouponCache>,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            policies,
            coupons,
            quota,
            dead_letters,
            cache,
            retry,
            clock,
        }
    }

    /// One attempt at issuing the coupon a message asks for.
    pub async fn process(&self, message: &IssuanceMessage) -> Result<IssueOutcome, CouponError> {
        if let Some(existing) = self.coupons.find_by_request(&message.request_id).await? {
            return Ok(IssueOutcome::Redelivered(self.activate(existing).await?));
        }

        let policy = self
            .policies
            .get_policy(&message.policy_id)
            .await?
            .ok_or_else(|| CouponError::PolicyNotFound(message.policy_id.clone()))?;

        let now = self.clock.now();
        if policy.has_ended(&now) {
            self.quota.release(&policy.id).await?;
            self.cache.invalidate_remaining(&policy.id);
            tracing::info!(
                request_id = %message.request_id,
                policy_id = %policy.id,
                "policy window closed before issuance, slot released"
            );
            return Ok(IssueOutcome::PolicyExpired);
        }

        let pending = Coupon::pending(
            new_coupon_code()?,
            policy.id.clone(),
            message.user_id.clone(),
            message.request_id.clone(),
            now,
        );

        match self
            .coupons
            .insert_pending(pending, policy.total_quantity)
            .await?
        {
            InsertOutcome::Inserted(coupon) => {
                let coupon = self.activate(coupon).await?;
                tracing::debug!(
                    request_id = %message.request_id,
                    policy_id = %policy.id,
                    user_id = %message.user_id,
                    coupon_code = %coupon.code,
                    "coupon issued"
                );
                Ok(IssueOutcome::Issued(coupon))
            }
            InsertOutcome::AlreadyIssued(coupon) => {
                Ok(IssueOutcome::Redelivered(self.activate(coupon).await?))
            }
            InsertOutcome::DuplicateClaim(existing) => {
                self.quota.release(&policy.id).await?;
                self.cache.invalidate_remaining(&policy.id);
                tracing::info!(
                    request_id = %message.request_id,
                    policy_id = %policy.id,
                    user_id = %message.user_id,
                    coupon_code = %existing.code,
                    "user already holds a coupon of this policy, slot released"
                );
                Ok(IssueOutcome::DuplicateClaim(existing))
            }
            InsertOutcome::QuotaExhausted => {
                tracing::warn!(
                    request_id = %message.request_id,
                    policy_id = %policy.id,
                    "committed coupons already reach the policy quantity; counter was likely reset"
                );
                Ok(IssueOutcome::QuotaExhausted)
            }
        }
    }

    /// Move a stored coupon out of `Pending`. Losing the swap means someone
    /// else already moved it; their version wins.
    async fn activate(&self, coupon: Coupon) -> Result<Coupon, CouponError> {
        if coupon.status != CouponStatus::Pending {
            return Ok(coupon);
        }
        let Ok(available) = coupon.activate(self.clock.now()) else {
            return Ok(coupon);
        };
        let current = match self.coupons.compare_and_swap(&coupon, available).await? {
            SwapOutcome::Swapped(current) => current,
            SwapOutcome::Conflict(Some(current)) => current,
            SwapOutcome::Conflict(None) => coupon,
        };
        self.cache.invalidate_coupon(&current.code);
        Ok(current)
    }

    /// Decode, process with retries, and dead-letter what cannot be processed.
    pub async fn handle_delivery(&self, delivery: &Delivery) -> IssueOutcome {
        let message = match IssuanceMessage::from_bytes(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(
                    partition = delivery.partition,
                    offset = delivery.offset,
                    error = %e,
                    "undecodable issuance message"
                );
                self.dead_letter(delivery, None, DeadReason::Undecodable, &e, 0)
                    .await;
                return IssueOutcome::DeadLettered(DeadReason::Undecodable);
            }
        };

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.process(&message).await {
                Ok(outcome) => return outcome,
                Err(e) if e.is_transient() && self.retry.allowed(attempts) => {
                    let delay = self.retry.delay_for(attempts);
                    tracing::warn!(
                        request_id = %message.request_id,
                        policy_id = %message.policy_id,
                        partition = delivery.partition,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "issuance attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    let reason = match &e {
                        CouponError::PolicyNotFound(_) => DeadReason::PolicyMissing,
                        e if e.is_transient() => DeadReason::RetriesExhausted,
                        _ => DeadReason::Permanent,
                    };
                    // no release here: whether the slot is still owed is unknown
                    tracing::error!(
                        request_id = %message.request_id,
                        policy_id = %message.policy_id,
                        user_id = %message.user_id,
                        partition = delivery.partition,
                        attempt = attempts,
                        error = %e,
                        ?reason,
                        "issuance abandoned, message dead-lettered; operator action required"
                    );
                    self.dead_letter(delivery, Some(&message), reason, &e, attempts)
                        .await;
                    return IssueOutcome::DeadLettered(reason);
                }
            }
        }
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        message: Option<&IssuanceMessage>,
        reason: DeadReason,
        error: &CouponError,
        attempts: u32,
    ) {
        let letter = DeadLetter {
            id: uuid7::uuid7().to_string(),
            partition: delivery.partition as u32,
            offset: delivery.offset,
            request_id: message.map(|m| m.request_id.clone()),
            policy_id: message.map(|m| m.policy_id.clone()),
            reason,
            error: error.to_string(),
            attempts,
            payload: delivery.payload.clone(),
            occurred_at: self.clock.now(),
        };
        if let Err(e) = self.dead_letters.push(letter).await {
            tracing::error!(
                partition = delivery.partition,
                offset = delivery.offset,
                payload = %hex::encode(&delivery.payload),
                error = %e,
                "failed to store dead letter; message is lost"
            );
        }
    }
}

/// Running consumer tasks, one per partition.
pub struct WorkerPool {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(worker: Arc<IssuanceWorker>, receivers: Vec<PartitionReceiver>) -> Self {
        let token = CancellationToken::new();
        let handles = receivers
            .into_iter()
            .map(|receiver| tokio::spawn(consume(worker.clone(), receiver, token.child_token())))
            .collect();
        Self { token, handles }
    }

    /// Stop after the delivery each task is currently handling.
    pub async fn shutdown(self) {
        self.token.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "issuance consumer task failed");
            }
        }
    }
}

async fn consume(
    worker: Arc<IssuanceWorker>,
    mut receiver: PartitionReceiver,
    token: CancellationToken,
) {
    let partition = receiver.partition();
    tracing::debug!(partition, "issuance consumer started");
    loop {
        let delivery = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            delivery = receiver.recv() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };
        let outcome = worker.handle_delivery(&delivery).await;
        tracing::trace!(partition, offset = delivery.offset, ?outcome, "delivery handled");
    }
    tracing::debug!(partition, "issuance consumer stopped");
}
