//! In-process issuance channel.
//!
//! Messages are keyed by policy: every message of one policy lands on the
//! same partition, and each partition is a FIFO drained by a single consumer.
//! Delivery is at-least-once from the worker's point of view; a message counts
//! as in flight from `publish` until its `Delivery` is dropped.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Notify, mpsc};

use crate::error::CouponError;
use crate::types::{PolicyId, RequestId, TimeStamp, UserId};
use crate::utils::partition_for;

/// Request to issue one coupon, produced by admission.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct IssuanceMessage {
    #[n(0)]
    pub request_id: RequestId,
    #[n(1)]
    pub policy_id: PolicyId,
    #[n(2)]
    pub user_id: UserId,
    #[n(3)]
    pub enqueued_at: TimeStamp<Utc>,
}

impl IssuanceMessage {
    pub fn new(policy_id: PolicyId, user_id: UserId, now: TimeStamp<Utc>) -> Self {
        Self {
            request_id: RequestId::generate(),
            policy_id,
            user_id,
            enqueued_at: now,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CouponError> {
        minicbor::to_vec(self).map_err(CouponError::encode)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CouponError> {
        Ok(minicbor::decode(bytes)?)
    }
}

#[async_trait]
pub trait IssuancePublisher: Send + Sync {
    /// Hand the message to the channel. An `Err` means it was not accepted
    /// and the caller still owns the reserved slot.
    async fn publish(&self, message: &IssuanceMessage) -> Result<(), CouponError>;
}

#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

struct InFlightGuard(Arc<InFlight>);

impl InFlightGuard {
    fn acquire(inflight: &Arc<InFlight>) -> Self {
        inflight.count.fetch_add(1, Ordering::SeqCst);
        Self(inflight.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// One message as seen by a consumer. Dropping it acknowledges it.
pub struct Delivery {
    pub partition: usize,
    pub offset: u64,
    pub payload: Vec<u8>,
    _ack: InFlightGuard,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("partition", &self.partition)
            .field("offset", &self.offset)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

pub struct PartitionReceiver {
    partition: usize,
    rx: mpsc::Receiver<Delivery>,
}

impl PartitionReceiver {
    pub fn partition(&self) -> usize {
        self.partition
    }

    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

pub struct PartitionedChannel {
    senders: Vec<mpsc::Sender<Delivery>>,
    offsets: Vec<AtomicU64>,
    inflight: Arc<InFlight>,
    closed: AtomicBool,
    enqueue_timeout: Duration,
}

impl PartitionedChannel {
    /// Build the channel and one receiver per partition.
    pub fn new(
        partitions: usize,
        capacity: usize,
        enqueue_timeout: Duration,
    ) -> (Self, Vec<PartitionReceiver>) {
        let partitions = partitions.max(1);
        let mut senders = Vec::with_capacity(partitions);
        let mut receivers = Vec::with_capacity(partitions);
        for partition in 0..partitions {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            senders.push(tx);
            receivers.push(PartitionReceiver { partition, rx });
        }
        let channel = Self {
            senders,
            offsets: (0..partitions).map(|_| AtomicU64::new(0)).collect(),
            inflight: Arc::new(InFlight::default()),
            closed: AtomicBool::new(false),
            enqueue_timeout,
        };
        (channel, receivers)
    }

    pub fn partitions(&self) -> usize {
        self.senders.len()
    }

    /// Publish an already encoded payload under `key`.
    pub async fn publish_payload(
        &self,
        key: &PolicyId,
        payload: Vec<u8>,
    ) -> Result<(), CouponError> {
        // counted before the closed check: `wait_idle` after `close` either
        // sees this publish in flight or this publish sees the channel closed
        let ack = InFlightGuard::acquire(&self.inflight);
        if self.closed.load(Ordering::SeqCst) {
            return Err(CouponError::ChannelClosed);
        }
        let partition = partition_for(key, self.senders.len());
        let delivery = Delivery {
            partition,
            offset: self.offsets[partition].fetch_add(1, Ordering::SeqCst),
            payload,
            _ack: ack,
        };

        // a rejected delivery is dropped here, which also releases its in-flight mark
        let sender = &self.senders[partition];
        match tokio::time::timeout(self.enqueue_timeout, sender.send(delivery)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(CouponError::ChannelClosed),
            Err(_) => Err(CouponError::EnqueueTimeout),
        }
    }

    /// Stop accepting new messages. Queued ones are still delivered.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.count.load(Ordering::SeqCst)
    }

    /// Resolve once every published message has been consumed and acknowledged.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.inflight.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            idle.await;
        }
    }
}

#[async_trait]
impl IssuancePublisher for PartitionedChannel {
    async fn publish(&self, message: &IssuanceMessage) -> Result<(), CouponError> {
        let payload = message.to_bytes()?;
        self.publish_payload(&message.policy_id, payload).await?;
        tracing::trace!(
            request_id = %message.request_id,
            policy_id = %message.policy_id,
            "issuance message published"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(policy: &str, user: &str) -> IssuanceMessage {
        IssuanceMessage::new(PolicyId::from(policy), UserId::from(user), TimeStamp::new())
    }

    #[tokio::test]
    async fn same_policy_keeps_send_order_on_one_partition() {
        let (channel, mut receivers) = PartitionedChannel::new(4, 16, Duration::from_millis(50));
        let sent: Vec<_> = (0..5).map(|i| message("policy-a", &format!("u{i}"))).collect();
        for m in &sent {
            channel.publish(m).await.unwrap();
        }

        let partition = partition_for(&PolicyId::from("policy-a"), 4);
        let receiver = &mut receivers[partition];
        for (offset, expected) in sent.iter().enumerate() {
            let delivery = receiver.recv().await.unwrap();
            assert_eq!(delivery.partition, partition);
            assert_eq!(delivery.offset, offset as u64);
            assert_eq!(&IssuanceMessage::from_bytes(&delivery.payload).unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn in_flight_drops_to_zero_once_deliveries_are_acknowledged() {
        let (channel, mut receivers) = PartitionedChannel::new(1, 8, Duration::from_millis(50));
        channel.publish(&message("p", "a")).await.unwrap();
        channel.publish(&message("p", "b")).await.unwrap();
        assert_eq!(channel.in_flight(), 2);

        let first = receivers[0].recv().await.unwrap();
        let second = receivers[0].recv().await.unwrap();
        drop(first);
        assert_eq!(channel.in_flight(), 1);

        let waiter = tokio::spawn(async move {
            drop(second);
        });
        channel.wait_idle().await;
        waiter.await.unwrap();
        assert_eq!(channel.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn full_partition_times_out() {
        let (channel, _receivers) = PartitionedChannel::new(1, 1, Duration::from_millis(50));
        channel.publish(&message("p", "a")).await.unwrap();

        let err = channel.publish(&message("p", "b")).await.unwrap_err();
        assert!(matches!(err, CouponError::EnqueueTimeout));
        // the rejected message is not counted
        assert_eq!(channel.in_flight(), 1);
    }

    #[tokio::test]
    async fn closed_channel_refuses_publish() {
        let (channel, _receivers) = PartitionedChannel::new(2, 4, Duration::from_millis(50));
        channel.close();
        let err = channel.publish(&message("p", "a")).await.unwrap_err();
        assert!(matches!(err, CouponError::ChannelClosed));
        assert_eq!(channel.in_flight(), 0);
    }

    #[tokio::test]
    async fn publish_pending_at_close_is_awaited_by_wait_idle() {
        let (channel, mut receivers) = PartitionedChannel::new(1, 1, Duration::from_secs(5));
        let channel = Arc::new(channel);
        channel.publish(&message("p", "a")).await.unwrap();

        // partition is full, so this publish parks inside the channel
        let pending = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.publish(&message("p", "b")).await })
        };
        while channel.in_flight() < 2 {
            tokio::task::yield_now().await;
        }
        channel.close();

        let consumer = tokio::spawn(async move {
            let mut seen = 0;
            while seen < 2 {
                if receivers[0].recv().await.is_some() {
                    seen += 1;
                }
            }
            seen
        });
        channel.wait_idle().await;

        assert_eq!(consumer.await.unwrap(), 2);
        assert!(pending.await.unwrap().is_ok());
        assert_eq!(channel.in_flight(), 0);
    }
}
