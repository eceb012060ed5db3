//! Wiring of stores, counter, channel, workers and service into one process.
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::CouponCache;
use crate::channel::{IssuancePublisher, PartitionedChannel};
use crate::config::CouponConfig;
use crate::coupon_store::{CouponStore, SledCouponStore};
use crate::dead_letter::{DeadLetterSink, SledDeadLetters};
use crate::error::CouponError;
use crate::policy_store::{PolicyStore, SledPolicyStore};
use crate::quota::{CounterStore, QuotaAllocator, SledCounterStore};
use crate::service::CouponService;
use crate::types::{Clock, SystemClock};
use crate::worker::{IssuanceWorker, WorkerPool};

/// Collaborators a runtime is assembled from.
pub struct RuntimeParts {
    pub policies: Arc<dyn PolicyStore>,
    pub coupons: Arc<dyn CouponStore>,
    pub counters: Arc<dyn CounterStore>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
    pub clock: Arc<dyn Clock>,
}

impl RuntimeParts {
    /// sled-backed parts sharing one database
    pub fn sled(db: &sled::Db, clock: Arc<dyn Clock>) -> Result<Self, CouponError> {
        Ok(Self {
            policies: Arc::new(SledPolicyStore::open(db)?),
            coupons: Arc::new(SledCouponStore::open(db)?),
            counters: Arc::new(SledCounterStore::open(db, clock.clone())?),
            dead_letters: Arc::new(SledDeadLetters::open(db)?),
            clock,
        })
    }
}

pub struct CouponRuntime {
    service: Arc<CouponService>,
    channel: Arc<PartitionedChannel>,
    pool: WorkerPool,
    sweeper: Option<(CancellationToken, JoinHandle<()>)>,
    db: Option<sled::Db>,
}

impl CouponRuntime {
    /// Open the sled database under `config.data_dir` and start the workers.
    pub fn open(config: &CouponConfig) -> Result<Self, CouponError> {
        config.validate()?;
        let db = sled::open(&config.data_dir)?;
        let parts = RuntimeParts::sled(&db, Arc::new(SystemClock))?;
        let mut runtime = Self::with_parts(parts, config)?;
        runtime.db = Some(db);
        tracing::info!(data_dir = %config.data_dir.display(), "coupon runtime opened");
        Ok(runtime)
    }

    /// Start the workers over caller-supplied collaborators.
    pub fn with_parts(parts: RuntimeParts, config: &CouponConfig) -> Result<Self, CouponError> {
        config.validate()?;
        let (channel, receivers) = PartitionedChannel::new(
            config.partitions,
            config.channel_capacity,
            config.enqueue_timeout(),
        );
        let channel = Arc::new(channel);
        let quota = QuotaAllocator::new(parts.counters.clone(), config.allocator_timeout());
        let cache = Arc::new(CouponCache::new(
            config.cache.enabled,
            config.cache_max_ttl(),
            parts.clock.clone(),
        ));

        let worker = Arc::new(IssuanceWorker::new(
            parts.policies.clone(),
            parts.coupons.clone(),
            quota.clone(),
            parts.dead_letters.clone(),
            cache.clone(),
            config.retry.clone(),
            parts.clock.clone(),
        ));
        let pool = WorkerPool::spawn(worker, receivers);

        let publisher: Arc<dyn IssuancePublisher> = channel.clone();
        let service = Arc::new(CouponService::new(
            parts.policies,
            parts.coupons,
            quota,
            publisher,
            parts.dead_letters,
            cache,
            parts.clock,
            config.enqueue_timeout(),
        ));

        let sweeper = (config.counter_purge_interval_ms > 0).then(|| {
            spawn_counter_sweeper(
                parts.counters,
                Duration::from_millis(config.counter_purge_interval_ms),
            )
        });

        tracing::info!(
            partitions = channel.partitions(),
            channel_capacity = config.channel_capacity,
            "issuance workers started"
        );
        Ok(Self {
            service,
            channel,
            pool,
            sweeper,
            db: None,
        })
    }

    pub fn service(&self) -> Arc<CouponService> {
        self.service.clone()
    }

    /// Resolve once every accepted claim has been processed by a worker.
    pub async fn drain(&self) {
        self.channel.wait_idle().await;
    }

    /// Stop accepting claims, finish what is queued, stop workers and flush.
    pub async fn shutdown(self) -> Result<(), CouponError> {
        self.channel.close();
        self.channel.wait_idle().await;
        self.pool.shutdown().await;
        if let Some((token, handle)) = self.sweeper {
            token.cancel();
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "counter sweeper task failed");
            }
        }
        if let Some(db) = self.db {
            db.flush_async().await?;
        }
        tracing::info!("coupon runtime stopped");
        Ok(())
    }
}

fn spawn_counter_sweeper(
    counters: Arc<dyn CounterStore>,
    interval: Duration,
) -> (CancellationToken, JoinHandle<()>) {
    let token = CancellationToken::new();
    let stop = token.clone();
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => match counters.sweep_expired().await {
                    Ok(0) => {}
                    Ok(purged) => tracing::debug!(purged, "expired quota counters swept"),
                    Err(e) => tracing::warn!(error = %e, "quota counter sweep failed"),
                },
            }
        }
    });
    (token, handle)
}
