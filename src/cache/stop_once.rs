//! Idempotent stop decorator.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::cache::{Cache, CacheType, Fetched};
use crate::context::RequestContext;
use crate::error::Result;

/// Runs the wrapped cache's `stop` exactly once, however often and however
/// concurrently it is called. Later callers wait for the first stop to finish.
pub struct StopOnce {
    inner: Arc<dyn Cache>,
    stopped: OnceCell<()>,
}

impl StopOnce {
    pub fn new(inner: Arc<dyn Cache>) -> Self {
        Self {
            inner,
            stopped: OnceCell::new(),
        }
    }
}

#[async_trait]
impl Cache for StopOnce {
    async fn store(
        &self,
        ctx: &RequestContext,
        keys: Vec<String>,
        values: Vec<Vec<u8>>,
    ) -> Result<()> {
        self.inner.store(ctx, keys, values).await
    }

    async fn fetch(&self, ctx: &RequestContext, keys: Vec<String>) -> Result<Fetched> {
        self.inner.fetch(ctx, keys).await
    }

    async fn stop(&self) {
        self.stopped
            .get_or_init(|| async {
                self.inner.stop().await;
            })
            .await;
    }

    fn cache_type(&self) -> CacheType {
        self.inner.cache_type()
    }

    fn tier_count(&self) -> Option<usize> {
        self.inner.tier_count()
    }
}
