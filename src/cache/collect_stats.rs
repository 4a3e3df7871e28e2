//! Request stats collection decorator.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::cache::{Cache, CacheType, Fetched};
use crate::context::RequestContext;
use crate::error::Result;

/// Adds per-call counters to the request's [`RequestStats`], when present.
///
/// [`RequestStats`]: crate::context::RequestStats
pub struct CollectStats {
    inner: Arc<dyn Cache>,
}

impl CollectStats {
    pub fn new(inner: Arc<dyn Cache>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Cache for CollectStats {
    async fn store(
        &self,
        ctx: &RequestContext,
        keys: Vec<String>,
        values: Vec<Vec<u8>>,
    ) -> Result<()> {
        if let Some(stats) = ctx.stats() {
            stats.add_entries_stored(self.cache_type(), keys.len());
        }
        self.inner.store(ctx, keys, values).await
    }

    async fn fetch(&self, ctx: &RequestContext, keys: Vec<String>) -> Result<Fetched> {
        let Some(stats) = ctx.stats() else {
            return self.inner.fetch(ctx, keys).await;
        };

        let cache_type = self.cache_type();
        let requested = keys.len();
        let started = Instant::now();
        stats.add_request(cache_type);

        let result = self.inner.fetch(ctx, keys).await;
        let (found, bytes) = match &result {
            Ok(fetched) => (fetched.found.len(), fetched.value_bytes()),
            Err(_) => (0, 0),
        };
        stats.add_fetch(cache_type, requested, found, bytes, started.elapsed());
        result
    }

    async fn stop(&self) {
        self.inner.stop().await;
    }

    fn cache_type(&self) -> CacheType {
        self.inner.cache_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MockCache;
    use crate::context::RequestStats;

    #[tokio::test]
    async fn test_counters_accumulate_into_context() {
        let mock = Arc::new(MockCache::with_type(CacheType::Chunk));
        mock.insert("a", "12345");
        let cache = CollectStats::new(mock);
        let stats = Arc::new(RequestStats::new());
        let ctx = RequestContext::new().with_stats(stats.clone());

        cache.fetch(&ctx, vec!["a".into(), "b".into()]).await.unwrap();
        cache
            .store(&ctx, vec!["c".into(), "d".into()], vec![vec![], vec![]])
            .await
            .unwrap();

        let chunk = stats.get(CacheType::Chunk);
        assert_eq!(chunk.requests, 1);
        assert_eq!(chunk.entries_requested, 2);
        assert_eq!(chunk.entries_found, 1);
        assert_eq!(chunk.bytes_received, 5);
        assert_eq!(chunk.entries_stored, 2);
    }

    #[tokio::test]
    async fn test_no_stats_in_context_is_fine() {
        let mock = Arc::new(MockCache::new());
        let cache = CollectStats::new(mock);
        let fetched = cache
            .fetch(&RequestContext::new(), vec!["a".into()])
            .await
            .unwrap();
        assert_eq!(fetched.missing, vec!["a"]);
    }
}
