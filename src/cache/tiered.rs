//! Tiered Cache Module
//!
//! Composes caches ordered fastest first into one logical cache with
//! read-through backfill.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::cache::{check_lengths, Cache, CacheType, Fetched};
use crate::context::RequestContext;
use crate::error::{CacheError, Result};

// == Tiered Cache ==
/// An ordered list of cache tiers.
pub struct TieredCache {
    tiers: Vec<Arc<dyn Cache>>,
    cache_type: CacheType,
}

impl TieredCache {
    /// Builds the composite; a single tier is returned as-is.
    pub fn new(cache_type: CacheType, mut tiers: Vec<Arc<dyn Cache>>) -> Arc<dyn Cache> {
        if tiers.len() == 1 {
            return tiers.remove(0);
        }
        Arc::new(Self { tiers, cache_type })
    }

    pub fn tiers(&self) -> &[Arc<dyn Cache>] {
        &self.tiers
    }
}

/// True when `cache` is a tiered composite with no tiers, i.e. a no-op cache.
pub fn is_empty_tiered(cache: &dyn Cache) -> bool {
    cache.tier_count() == Some(0)
}

#[async_trait]
impl Cache for TieredCache {
    /// Stores into every tier; the last tier error, if any, is returned.
    async fn store(
        &self,
        ctx: &RequestContext,
        keys: Vec<String>,
        values: Vec<Vec<u8>>,
    ) -> Result<()> {
        check_lengths(&keys, &values)?;

        let mut last_err: Option<CacheError> = None;
        for (i, tier) in self.tiers.iter().enumerate() {
            if let Err(err) = tier.store(ctx, keys.clone(), values.clone()).await {
                warn!(tier = i, error = %err, "tier store failed");
                last_err = Some(err);
            }
        }
        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn fetch(&self, ctx: &RequestContext, keys: Vec<String>) -> Result<Fetched> {
        let mut found: HashMap<String, Vec<u8>> = HashMap::with_capacity(keys.len());
        let mut missing = keys.clone();

        for (i, tier) in self.tiers.iter().enumerate() {
            if missing.is_empty() {
                break;
            }

            let fetched = match tier.fetch(ctx, missing.clone()).await {
                Ok(fetched) => fetched,
                Err(err) => {
                    warn!(tier = i, error = %err, "tier fetch failed, treating as miss");
                    continue;
                }
            };
            missing = fetched.missing;

            if !fetched.found.is_empty() {
                for (j, faster) in self.tiers[..i].iter().enumerate() {
                    if let Err(err) = faster
                        .store(ctx, fetched.found.clone(), fetched.values.clone())
                        .await
                    {
                        debug!(tier = j, error = %err, "backfill failed");
                    }
                }
            }

            found.extend(fetched.found.into_iter().zip(fetched.values));
        }

        let mut result = Fetched::default();
        for key in keys {
            match found.get(&key).cloned() {
                Some(value) => {
                    result.found.push(key);
                    result.values.push(value);
                }
                None => result.missing.push(key),
            }
        }
        Ok(result)
    }

    async fn stop(&self) {
        for tier in &self.tiers {
            tier.stop().await;
        }
    }

    fn cache_type(&self) -> CacheType {
        self.cache_type
    }

    fn tier_count(&self) -> Option<usize> {
        Some(self.tiers.len())
    }
}
