use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::RetryPolicy;
use crate::error::ConfigError;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CouponConfig {
    /// Directory of the sled database
    pub data_dir: PathBuf,
    /// Issuance channel partitions, one consumer task each
    pub partitions: usize,
    /// Buffered messages per partition
    pub channel_capacity: usize,
    pub allocator_timeout_ms: u64,
    pub enqueue_timeout_ms: u64,
    /// How often expired quota counters are swept; 0 disables the sweep
    pub counter_purge_interval_ms: u64,
    pub retry: RetryPolicy,
    pub cache: CacheConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_ttl_secs: u64,
}

impl Default for CouponConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("flash-coupon-data"),
            partitions: 8,
            channel_capacity: 1_024,
            allocator_timeout_ms: 100,
            enqueue_timeout_ms: 200,
            counter_purge_interval_ms: 60_000,
            retry: RetryPolicy::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_ttl_secs: 30,
        }
    }
}

impl CouponConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: CouponConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.partitions == 0 {
            return Err(ConfigError::Invalid("partitions must be at least 1"));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid("channel_capacity must be at least 1"));
        }
        if self.allocator_timeout_ms == 0 || self.enqueue_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be at least 1ms"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1"));
        }
        if self.retry.factor < 1.0 || !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::Invalid(
                "retry.factor must be >= 1 and retry.jitter within [0, 1]",
            ));
        }
        if self.retry.base_ms > self.retry.cap_ms {
            return Err(ConfigError::Invalid("retry.base_ms cannot exceed retry.cap_ms"));
        }
        Ok(())
    }

    pub fn allocator_timeout(&self) -> Duration {
        Duration::from_millis(self.allocator_timeout_ms)
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn cache_max_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.max_ttl_secs)
    }
}
