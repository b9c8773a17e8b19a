//! Configuration for the cache system

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Environment variable prefix read by [`CacheConfig::from_env`]
pub const ENV_PREFIX: &str = "RESOURCE_CACHE_";

/// Configuration for the provider cache and its backing store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Time-to-live applied to records that carry no TTL of their own
    /// None keeps such records until they are evicted
    pub default_ttl: Option<Duration>,

    /// TTL jitter factor (0.0 - 1.0)
    /// Spreads expirations of records written in the same run
    pub ttl_jitter: f64,

    /// Enable automatic cleanup of expired entries
    pub enable_auto_cleanup: bool,

    /// Interval for automatic cleanup checks
    pub cleanup_interval: Duration,

    /// Records upserted per store call
    pub max_merge_batch_size: usize,

    /// Keys evicted per store call
    pub max_evict_batch_size: usize,

    /// Keys fetched per store call
    pub max_get_batch_size: usize,

    /// Skip writes whose content hash is unchanged
    pub hashing_enabled: bool,

    /// Number of shards in the per-scope lock table
    pub lock_shards: usize,

    /// Upper bound on one agent's `load_data`
    pub agent_timeout: Duration,

    /// Retries of a scope merge after a store conflict
    pub merge_retry_attempts: u32,

    /// Enable metrics collection
    pub enable_metrics: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: None,
            // 10% jitter
            ttl_jitter: 0.10,
            enable_auto_cleanup: true,
            // Cleanup every 5 minutes
            cleanup_interval: Duration::from_secs(300),
            max_merge_batch_size: 500,
            max_evict_batch_size: 500,
            max_get_batch_size: 1000,
            hashing_enabled: true,
            lock_shards: 16,
            // 15 minutes, matching a long-running cloud inventory poll
            agent_timeout: Duration::from_secs(15 * 60),
            merge_retry_attempts: 3,
            enable_metrics: true,
        }
    }
}

impl CacheConfig {
    /// Create a new builder for cache configuration
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_merge_batch_size == 0 {
            return Err(CacheError::ConfigError(
                "max_merge_batch_size must be greater than 0".to_string(),
            ));
        }

        if self.max_evict_batch_size == 0 {
            return Err(CacheError::ConfigError(
                "max_evict_batch_size must be greater than 0".to_string(),
            ));
        }

        if self.max_get_batch_size == 0 {
            return Err(CacheError::ConfigError(
                "max_get_batch_size must be greater than 0".to_string(),
            ));
        }

        if self.lock_shards == 0 {
            return Err(CacheError::ConfigError(
                "lock_shards must be greater than 0".to_string(),
            ));
        }

        if self.ttl_jitter < 0.0 || self.ttl_jitter > 1.0 {
            return Err(CacheError::ConfigError(
                "ttl_jitter must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.agent_timeout.is_zero() {
            return Err(CacheError::ConfigError(
                "agent_timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Apply jitter to a TTL
    pub fn ttl_with_jitter(&self, ttl: Duration) -> Duration {
        if self.ttl_jitter == 0.0 {
            return ttl;
        }

        let base_secs = ttl.as_secs_f64();
        let jitter_range = base_secs * self.ttl_jitter;
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range;
        let final_secs = (base_secs + jitter).max(1.0);

        Duration::from_secs_f64(final_secs)
    }

    /// Resolve the effective TTL for a record, if any
    pub fn effective_ttl(&self, record_ttl_seconds: Option<u64>) -> Option<Duration> {
        record_ttl_seconds
            .map(Duration::from_secs)
            .or(self.default_ttl)
            .map(|ttl| self.ttl_with_jitter(ttl))
    }

    /// Load configuration from `RESOURCE_CACHE_*` environment variables
    ///
    /// A `.env` file in the working directory is read first if present.
    /// Unset variables keep their defaults; durations are in seconds.
    pub fn from_env() -> Result<Self> {
        if dotenv::dotenv().is_ok() {
            debug!("Loaded .env file");
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| lookup(&format!("{}{}", ENV_PREFIX, suffix));
        let mut builder = CacheConfig::builder();

        if let Some(v) = var("DEFAULT_TTL_SECS") {
            builder = builder.default_ttl(Duration::from_secs(parse(&v, "DEFAULT_TTL_SECS")?));
        }
        if let Some(v) = var("TTL_JITTER") {
            builder = builder.ttl_jitter(parse(&v, "TTL_JITTER")?);
        }
        if let Some(v) = var("ENABLE_AUTO_CLEANUP") {
            builder = builder.enable_auto_cleanup(parse(&v, "ENABLE_AUTO_CLEANUP")?);
        }
        if let Some(v) = var("CLEANUP_INTERVAL_SECS") {
            builder = builder.cleanup_interval(Duration::from_secs(parse(&v, "CLEANUP_INTERVAL_SECS")?));
        }
        if let Some(v) = var("MAX_MERGE_BATCH_SIZE") {
            builder = builder.max_merge_batch_size(parse(&v, "MAX_MERGE_BATCH_SIZE")?);
        }
        if let Some(v) = var("MAX_EVICT_BATCH_SIZE") {
            builder = builder.max_evict_batch_size(parse(&v, "MAX_EVICT_BATCH_SIZE")?);
        }
        if let Some(v) = var("MAX_GET_BATCH_SIZE") {
            builder = builder.max_get_batch_size(parse(&v, "MAX_GET_BATCH_SIZE")?);
        }
        if let Some(v) = var("HASHING_ENABLED") {
            builder = builder.hashing_enabled(parse(&v, "HASHING_ENABLED")?);
        }
        if let Some(v) = var("LOCK_SHARDS") {
            builder = builder.lock_shards(parse(&v, "LOCK_SHARDS")?);
        }
        if let Some(v) = var("AGENT_TIMEOUT_SECS") {
            builder = builder.agent_timeout(Duration::from_secs(parse(&v, "AGENT_TIMEOUT_SECS")?));
        }
        if let Some(v) = var("MERGE_RETRY_ATTEMPTS") {
            builder = builder.merge_retry_attempts(parse(&v, "MERGE_RETRY_ATTEMPTS")?);
        }
        if let Some(v) = var("ENABLE_METRICS") {
            builder = builder.enable_metrics(parse(&v, "ENABLE_METRICS")?);
        }

        let config = builder.build();
        config.validate()?;
        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(value: &str, name: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| {
        CacheError::ConfigError(format!("{}{} = '{}': {}", ENV_PREFIX, name, value, e))
    })
}

/// Builder for cache configuration
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    default_ttl: Option<Duration>,
    ttl_jitter: Option<f64>,
    enable_auto_cleanup: Option<bool>,
    cleanup_interval: Option<Duration>,
    max_merge_batch_size: Option<usize>,
    max_evict_batch_size: Option<usize>,
    max_get_batch_size: Option<usize>,
    hashing_enabled: Option<bool>,
    lock_shards: Option<usize>,
    agent_timeout: Option<Duration>,
    merge_retry_attempts: Option<u32>,
    enable_metrics: Option<bool>,
}

impl CacheConfigBuilder {
    /// Set the default TTL for records without one
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Set TTL jitter factor (0.0 - 1.0)
    pub fn ttl_jitter(mut self, jitter: f64) -> Self {
        self.ttl_jitter = Some(jitter);
        self
    }

    /// Enable or disable automatic cleanup
    pub fn enable_auto_cleanup(mut self, enable: bool) -> Self {
        self.enable_auto_cleanup = Some(enable);
        self
    }

    /// Set cleanup interval
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = Some(interval);
        self
    }

    /// Set the merge batch size
    pub fn max_merge_batch_size(mut self, size: usize) -> Self {
        self.max_merge_batch_size = Some(size);
        self
    }

    /// Set the evict batch size
    pub fn max_evict_batch_size(mut self, size: usize) -> Self {
        self.max_evict_batch_size = Some(size);
        self
    }

    /// Set the get batch size
    pub fn max_get_batch_size(mut self, size: usize) -> Self {
        self.max_get_batch_size = Some(size);
        self
    }

    /// Enable or disable unchanged-write skipping
    pub fn hashing_enabled(mut self, enable: bool) -> Self {
        self.hashing_enabled = Some(enable);
        self
    }

    /// Set the lock table shard count
    pub fn lock_shards(mut self, shards: usize) -> Self {
        self.lock_shards = Some(shards);
        self
    }

    /// Set the agent run timeout
    pub fn agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = Some(timeout);
        self
    }

    /// Set merge retry attempts after conflicts
    pub fn merge_retry_attempts(mut self, attempts: u32) -> Self {
        self.merge_retry_attempts = Some(attempts);
        self
    }

    /// Enable or disable metrics collection
    pub fn enable_metrics(mut self, enable: bool) -> Self {
        self.enable_metrics = Some(enable);
        self
    }

    /// Build the cache configuration
    pub fn build(self) -> CacheConfig {
        let defaults = CacheConfig::default();

        CacheConfig {
            default_ttl: self.default_ttl.or(defaults.default_ttl),
            ttl_jitter: self.ttl_jitter.unwrap_or(defaults.ttl_jitter),
            enable_auto_cleanup: self
                .enable_auto_cleanup
                .unwrap_or(defaults.enable_auto_cleanup),
            cleanup_interval: self.cleanup_interval.unwrap_or(defaults.cleanup_interval),
            max_merge_batch_size: self
                .max_merge_batch_size
                .unwrap_or(defaults.max_merge_batch_size),
            max_evict_batch_size: self
                .max_evict_batch_size
                .unwrap_or(defaults.max_evict_batch_size),
            max_get_batch_size: self
                .max_get_batch_size
                .unwrap_or(defaults.max_get_batch_size),
            hashing_enabled: self.hashing_enabled.unwrap_or(defaults.hashing_enabled),
            lock_shards: self.lock_shards.unwrap_or(defaults.lock_shards),
            agent_timeout: self.agent_timeout.unwrap_or(defaults.agent_timeout),
            merge_retry_attempts: self
                .merge_retry_attempts
                .unwrap_or(defaults.merge_retry_attempts),
            enable_metrics: self.enable_metrics.unwrap_or(defaults.enable_metrics),
        }
    }
}
