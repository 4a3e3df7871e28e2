//! Configuration Module
//!
//! Plain configuration values for every cache layer, loadable from environment
//! variables. Validation happens eagerly when the factory assembles a cache.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{CacheError, Result};

/// Top level cache configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// In-process tier
    pub embedded: EmbeddedConfig,
    /// Write-back settings applied to the remote tier
    pub background: BackgroundConfig,
    /// Memcached remote tier, if configured
    pub memcached: Option<MemcachedConfig>,
    /// Redis remote tier, if configured
    pub redis: Option<RedisConfig>,
    /// Snappy-compress values sent to the remote tier
    pub compression: bool,
}

/// Embedded (in-process) cache limits.
///
/// A zero limit means unlimited; at least one of `max_size_bytes` and
/// `max_size_items` must be set when `enabled` is true.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddedConfig {
    pub enabled: bool,
    pub max_size_bytes: usize,
    pub max_size_items: usize,
    /// Entries older than this are purged; zero disables the purge task
    pub ttl: Duration,
    pub purge_interval: Duration,
}

impl Default for EmbeddedConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_size_bytes: 0,
            max_size_items: 0,
            ttl: Duration::ZERO,
            purge_interval: Duration::from_secs(60),
        }
    }
}

/// Background write-back settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackgroundConfig {
    /// Number of worker tasks forwarding batches
    pub workers: usize,
    /// Queue capacity, in batches
    pub queue_capacity: usize,
    /// Total bytes allowed in flight across all queued batches
    pub max_queued_bytes: usize,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            queue_capacity: 10_000,
            max_queued_bytes: 1 << 30,
        }
    }
}

/// Circuit breaker settings for a remote dialer.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker; zero disables breakers
    pub failure_threshold: u32,
    /// How long the breaker stays open before allowing a trial request
    pub open_timeout: Duration,
    /// Period after which the closed-state failure count is reset
    pub reset_interval: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            open_timeout: Duration::from_secs(10),
            reset_interval: Duration::from_secs(10),
        }
    }
}

/// Memcached remote tier.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemcachedConfig {
    /// `host:port` entries, resolved on every refresh
    pub addresses: Vec<String>,
    /// Per operation deadline, also used when dialing
    pub timeout: Duration,
    pub max_idle_conns: usize,
    /// Values above this size are not sent to memcached
    pub max_item_size: usize,
    pub update_interval: Duration,
    /// Use the consistent hash ring instead of hash-modulo selection
    pub consistent_hash: bool,
    /// Keys per fetch sub-batch; zero disables batching
    pub batch_size: usize,
    /// Fetch worker count; zero disables batching
    pub parallelism: usize,
    /// Expiry applied to stored values; zero means no expiry
    pub default_validity: Duration,
    pub breaker: BreakerConfig,
}

impl Default for MemcachedConfig {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            timeout: Duration::from_millis(100),
            max_idle_conns: 16,
            max_item_size: 1 << 20,
            update_interval: Duration::from_secs(60),
            consistent_hash: true,
            batch_size: 1024,
            parallelism: 100,
            default_validity: Duration::ZERO,
            breaker: BreakerConfig::default(),
        }
    }
}

/// Redis remote tier.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// One `redis://` URL, or several node URLs in cluster mode
    pub endpoints: Vec<String>,
    pub cluster: bool,
    pub timeout: Duration,
    /// Expiry applied to stored values; zero means no expiry
    pub expiration: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            cluster: false,
            timeout: Duration::from_millis(500),
            expiration: Duration::ZERO,
        }
    }
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `TIERCACHE_EMBEDDED_ENABLED` - enable the in-process tier (default: false)
    /// - `TIERCACHE_EMBEDDED_MAX_BYTES` / `TIERCACHE_EMBEDDED_MAX_ITEMS` - limits (default: 0)
    /// - `TIERCACHE_EMBEDDED_TTL_SECS` - entry TTL (default: 0, no purge)
    /// - `TIERCACHE_BACKGROUND_WORKERS` / `_QUEUE` / `_MAX_BYTES` - write-back settings
    /// - `TIERCACHE_MEMCACHED_ADDRESSES` - comma separated; presence enables memcached
    /// - `TIERCACHE_MEMCACHED_BATCH_SIZE` / `_PARALLELISM` - batched fetch settings
    /// - `TIERCACHE_REDIS_ENDPOINTS` - comma separated; presence enables redis
    /// - `TIERCACHE_REDIS_CLUSTER` - cluster mode (default: false)
    /// - `TIERCACHE_COMPRESSION` - snappy for the remote tier (default: false)
    pub fn from_env() -> Self {
        let embedded_defaults = EmbeddedConfig::default();
        let embedded = EmbeddedConfig {
            enabled: env_or("TIERCACHE_EMBEDDED_ENABLED", false),
            max_size_bytes: env_or("TIERCACHE_EMBEDDED_MAX_BYTES", 0),
            max_size_items: env_or("TIERCACHE_EMBEDDED_MAX_ITEMS", 0),
            ttl: Duration::from_secs(env_or("TIERCACHE_EMBEDDED_TTL_SECS", 0)),
            purge_interval: embedded_defaults.purge_interval,
        };

        let background_defaults = BackgroundConfig::default();
        let background = BackgroundConfig {
            workers: env_or("TIERCACHE_BACKGROUND_WORKERS", background_defaults.workers),
            queue_capacity: env_or(
                "TIERCACHE_BACKGROUND_QUEUE",
                background_defaults.queue_capacity,
            ),
            max_queued_bytes: env_or(
                "TIERCACHE_BACKGROUND_MAX_BYTES",
                background_defaults.max_queued_bytes,
            ),
        };

        let memcached = env_list("TIERCACHE_MEMCACHED_ADDRESSES").map(|addresses| {
            let defaults = MemcachedConfig::default();
            MemcachedConfig {
                addresses,
                batch_size: env_or("TIERCACHE_MEMCACHED_BATCH_SIZE", defaults.batch_size),
                parallelism: env_or("TIERCACHE_MEMCACHED_PARALLELISM", defaults.parallelism),
                ..defaults
            }
        });

        let redis = env_list("TIERCACHE_REDIS_ENDPOINTS").map(|endpoints| RedisConfig {
            endpoints,
            cluster: env_or("TIERCACHE_REDIS_CLUSTER", false),
            ..RedisConfig::default()
        });

        Self {
            embedded,
            background,
            memcached,
            redis,
            compression: env_or("TIERCACHE_COMPRESSION", false),
        }
    }

    // == Validate ==
    /// Rejects configurations that cannot be assembled into a cache.
    pub fn validate(&self) -> Result<()> {
        if self.embedded.enabled
            && self.embedded.max_size_bytes == 0
            && self.embedded.max_size_items == 0
        {
            return Err(CacheError::Config(
                "embedded cache enabled without max_size_bytes or max_size_items".to_string(),
            ));
        }

        if self.memcached.is_some() && self.redis.is_some() {
            return Err(CacheError::Config(
                "memcached and redis cannot both be configured".to_string(),
            ));
        }

        if let Some(memcached) = &self.memcached {
            if memcached.addresses.is_empty() {
                return Err(CacheError::Config("memcached has no addresses".to_string()));
            }
        }

        if let Some(redis) = &self.redis {
            if redis.endpoints.is_empty() {
                return Err(CacheError::Config("redis has no endpoints".to_string()));
            }
            if !redis.cluster && redis.endpoints.len() > 1 {
                return Err(CacheError::Config(
                    "multiple redis endpoints require cluster mode".to_string(),
                ));
            }
        }

        Ok(())
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_list(name: &str) -> Option<Vec<String>> {
    let raw = env::var(name).ok()?;
    let items: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}
