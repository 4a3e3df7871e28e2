//! Cache assembly from configuration.

use std::sync::Arc;

use tracing::info;

use crate::cache::{
    BackgroundCache, Cache, CacheType, CollectStats, EmbeddedCache, InstrumentedCache,
    SnappyCache, StopOnce, TieredCache,
};
use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::remote::{DnsResolver, MemcachedCache, RedisCache, TextProtocolClient};

/// Builds the cache stack described by `config`.
///
/// Tiers, fastest first: the embedded cache when enabled, then at most one
/// remote backend. The remote tier is compressed (optionally), instrumented
/// and written back in the background. Every tier collects request stats,
/// a multi-tier stack is instrumented as a whole, and the result stops once.
///
/// With nothing configured the result is an empty tiered cache; see
/// [`is_empty_tiered`](crate::cache::is_empty_tiered).
pub async fn new_cache(
    name: &str,
    cache_type: CacheType,
    config: &Config,
) -> Result<Arc<dyn Cache>> {
    config.validate()?;

    let mut tiers: Vec<Arc<dyn Cache>> = Vec::new();

    if config.embedded.enabled {
        let embedded = EmbeddedCache::new(
            format!("{name}embedded"),
            cache_type,
            &config.embedded,
            None,
        )
        .ok_or_else(|| CacheError::Config("embedded cache has zero capacity".into()))?;
        tiers.push(Arc::new(CollectStats::new(Arc::new(embedded))));
    }

    if let Some(remote) = remote_tier(name, cache_type, config).await? {
        tiers.push(Arc::new(CollectStats::new(remote)));
    }

    let tier_count = tiers.len();
    let mut cache = TieredCache::new(cache_type, tiers);
    if tier_count > 1 {
        cache = Arc::new(InstrumentedCache::new(format!("{name}tiered"), cache));
    }

    info!(cache = %name, cache_type = %cache_type, tiers = tier_count, "cache assembled");
    Ok(Arc::new(StopOnce::new(cache)))
}

async fn remote_tier(
    name: &str,
    cache_type: CacheType,
    config: &Config,
) -> Result<Option<Arc<dyn Cache>>> {
    let (label, mut remote): (&str, Arc<dyn Cache>) = match (&config.memcached, &config.redis) {
        (Some(memcached), None) => {
            let client = TextProtocolClient::connect(
                format!("{name}memcached"),
                memcached.clone(),
                Arc::new(DnsResolver),
            )
            .await?;
            let cache: Arc<dyn Cache> = Arc::new(MemcachedCache::new(
                format!("{name}memcached"),
                cache_type,
                memcached,
                Arc::new(client),
            ));
            ("memcached", cache)
        }
        (None, Some(redis)) => {
            let cache = RedisCache::connect(format!("{name}redis"), cache_type, redis).await?;
            let cache: Arc<dyn Cache> = Arc::new(cache);
            ("redis", cache)
        }
        (None, None) => return Ok(None),
        (Some(_), Some(_)) => {
            return Err(CacheError::Config(
                "memcached and redis cannot both be configured".into(),
            ))
        }
    };

    if config.compression {
        remote = Arc::new(SnappyCache::new(remote));
    }
    remote = Arc::new(InstrumentedCache::new(format!("{name}{label}"), remote));
    Ok(Some(Arc::new(BackgroundCache::new(
        format!("{name}{label}"),
        &config.background,
        remote,
    ))))
}
