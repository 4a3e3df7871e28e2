//! Key generation namespacing.

use std::sync::Arc;

use async_trait::async_trait;

use crate::cache::{Cache, CacheType, Fetched};
use crate::context::RequestContext;
use crate::error::Result;

/// Prefixes keys with the request's generation tag.
///
/// With tag `g`, key `k` is stored as `g:k`; keys in results are stripped back
/// to their original form. Without a tag every call passes through.
pub struct GenerationCache {
    inner: Arc<dyn Cache>,
}

impl GenerationCache {
    pub fn new(inner: Arc<dyn Cache>) -> Self {
        Self { inner }
    }
}

fn prefix_for(generation: &str) -> String {
    format!("{generation}:")
}

fn add_prefix(prefix: &str, keys: Vec<String>) -> Vec<String> {
    keys.into_iter().map(|k| format!("{prefix}{k}")).collect()
}

fn strip_prefix(prefix_len: usize, keys: Vec<String>) -> Vec<String> {
    keys.into_iter()
        .map(|mut k| {
            k.drain(..prefix_len.min(k.len()));
            k
        })
        .collect()
}

#[async_trait]
impl Cache for GenerationCache {
    async fn store(
        &self,
        ctx: &RequestContext,
        keys: Vec<String>,
        values: Vec<Vec<u8>>,
    ) -> Result<()> {
        match ctx.generation() {
            Some(generation) => {
                let prefix = prefix_for(generation);
                self.inner.store(ctx, add_prefix(&prefix, keys), values).await
            }
            None => self.inner.store(ctx, keys, values).await,
        }
    }

    async fn fetch(&self, ctx: &RequestContext, keys: Vec<String>) -> Result<Fetched> {
        let Some(generation) = ctx.generation() else {
            return self.inner.fetch(ctx, keys).await;
        };

        let prefix = prefix_for(generation);
        let fetched = self.inner.fetch(ctx, add_prefix(&prefix, keys)).await?;
        Ok(Fetched {
            found: strip_prefix(prefix.len(), fetched.found),
            values: fetched.values,
            missing: strip_prefix(prefix.len(), fetched.missing),
        })
    }

    async fn stop(&self) {
        self.inner.stop().await;
    }

    fn cache_type(&self) -> CacheType {
        self.inner.cache_type()
    }
}
