//! Integration Tests for Cache Composition
//!
//! Exercises the public API end to end: embedded eviction, tiered backfill,
//! generation namespacing, write-back backpressure and factory assembly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tiercache::cache::{BackgroundCache, EmbeddedCache, GenerationCache, TieredCache};
use tiercache::config::{BackgroundConfig, EmbeddedConfig};
use tiercache::{
    new_cache, Cache, CacheType, Config, Fetched, RequestContext, RequestStats, Result,
};
use tokio::sync::Semaphore;

// == Helper Functions ==

fn embedded_config(max_items: usize) -> EmbeddedConfig {
    EmbeddedConfig {
        enabled: true,
        max_size_items: max_items,
        ..EmbeddedConfig::default()
    }
}

fn keys(names: &[&str]) -> Vec<String> {
    names.iter().map(|k| k.to_string()).collect()
}

/// Unbounded map-backed tier that counts fetches.
#[derive(Default)]
struct MemoryCache {
    data: Mutex<HashMap<String, Vec<u8>>>,
    fetch_calls: AtomicUsize,
}

impl MemoryCache {
    fn insert(&self, key: &str, value: &str) {
        self.data.lock().insert(key.to_string(), value.as_bytes().to_vec());
    }

    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.data.lock().get(key).cloned()
    }

    fn len(&self) -> usize {
        self.data.lock().len()
    }

    fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn store(
        &self,
        _ctx: &RequestContext,
        keys: Vec<String>,
        values: Vec<Vec<u8>>,
    ) -> Result<()> {
        self.data.lock().extend(keys.into_iter().zip(values));
        Ok(())
    }

    async fn fetch(&self, _ctx: &RequestContext, keys: Vec<String>) -> Result<Fetched> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let data = self.data.lock();
        let mut fetched = Fetched::default();
        for key in keys {
            match data.get(&key) {
                Some(value) => {
                    fetched.values.push(value.clone());
                    fetched.found.push(key);
                }
                None => fetched.missing.push(key),
            }
        }
        Ok(fetched)
    }

    async fn stop(&self) {}

    fn cache_type(&self) -> CacheType {
        CacheType::Chunk
    }
}

/// Cache whose stores wait for a permit, to hold write-back workers busy.
struct SlowCache {
    permits: Semaphore,
    inner: MemoryCache,
}

impl SlowCache {
    fn new() -> Self {
        Self {
            permits: Semaphore::new(0),
            inner: MemoryCache::default(),
        }
    }
}

#[async_trait]
impl Cache for SlowCache {
    async fn store(
        &self,
        ctx: &RequestContext,
        keys: Vec<String>,
        values: Vec<Vec<u8>>,
    ) -> Result<()> {
        let permit = self.permits.acquire().await.expect("semaphore closed");
        permit.forget();
        self.inner.store(ctx, keys, values).await
    }

    async fn fetch(&self, ctx: &RequestContext, keys: Vec<String>) -> Result<Fetched> {
        self.inner.fetch(ctx, keys).await
    }

    async fn stop(&self) {
        self.permits.close();
    }

    fn cache_type(&self) -> CacheType {
        CacheType::Chunk
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

// == Embedded Cache ==

#[tokio::test]
async fn test_embedded_evicts_oldest_write() {
    let cache: EmbeddedCache<String, Vec<u8>> =
        EmbeddedCache::new("scenario", CacheType::Chunk, &embedded_config(2), None).unwrap();
    let ctx = RequestContext::new();

    cache
        .store(&ctx, keys(&["a", "b"]), vec![b"v1".to_vec(), b"v2".to_vec()])
        .await
        .unwrap();
    cache.store(&ctx, keys(&["c"]), vec![b"v3".to_vec()]).await.unwrap();

    assert_eq!(cache.get(&"a".to_string()), None);
    assert_eq!(cache.get(&"b".to_string()), Some(b"v2".to_vec()));
    assert_eq!(cache.get(&"c".to_string()), Some(b"v3".to_vec()));
}

// == Tiered Cache ==

#[tokio::test]
async fn test_tiered_backfills_faster_tier() {
    let l1 = Arc::new(
        EmbeddedCache::<String, Vec<u8>>::new("l1", CacheType::Chunk, &embedded_config(10), None)
            .unwrap(),
    );
    let l2 = Arc::new(MemoryCache::default());
    l2.insert("k", "remote");

    let tiers: Vec<Arc<dyn Cache>> = vec![l1.clone(), l2.clone()];
    let tiered = TieredCache::new(CacheType::Chunk, tiers);
    let fetched = tiered
        .fetch(&RequestContext::new(), keys(&["k", "absent"]))
        .await
        .unwrap();

    assert_eq!(fetched.found, vec!["k"]);
    assert_eq!(fetched.values, vec![b"remote".to_vec()]);
    assert_eq!(fetched.missing, vec!["absent"]);
    assert_eq!(l1.get(&"k".to_string()), Some(b"remote".to_vec()));

    // Second fetch is served by the first tier
    tiered.fetch(&RequestContext::new(), keys(&["k"])).await.unwrap();
    assert_eq!(l2.fetch_calls(), 1);
}

// == Generation Namespacing ==

#[tokio::test]
async fn test_generation_change_hides_previous_entries() {
    let backing = Arc::new(MemoryCache::default());
    let cache = GenerationCache::new(backing.clone());
    let gen1 = RequestContext::new().with_generation("1");
    let gen2 = RequestContext::new().with_generation("2");

    cache
        .store(&gen1, keys(&["x"]), vec![b"old".to_vec()])
        .await
        .unwrap();

    let same = cache.fetch(&gen1, keys(&["x"])).await.unwrap();
    assert_eq!(same.found, vec!["x"]);

    let changed = cache.fetch(&gen2, keys(&["x"])).await.unwrap();
    assert_eq!(changed.missing, vec!["x"]);
    assert!(backing.get("1:x").is_some());
}

// == Background Write-Back ==

#[tokio::test]
async fn test_background_drops_over_budget_and_delivers_rest() {
    let slow = Arc::new(SlowCache::new());
    let config = BackgroundConfig {
        workers: 1,
        queue_capacity: 100,
        max_queued_bytes: 20,
    };
    let cache = BackgroundCache::new("wb", &config, slow.clone());
    let ctx = RequestContext::new();

    // Each batch is 1 key byte + 9 value bytes: two fit in the budget
    for key in ["a", "b", "c", "d"] {
        cache
            .store(&ctx, keys(&[key]), vec![vec![0u8; 9]])
            .await
            .unwrap();
    }
    assert_eq!(cache.dropped_batches(), 2);

    slow.permits.add_permits(2);
    wait_for(|| slow.inner.len() == 2).await;
    assert!(slow.inner.get("a").is_some() && slow.inner.get("b").is_some());
    wait_for(|| cache.queued_bytes() == 0).await;

    cache.stop().await;
}

// == Factory ==

#[tokio::test]
async fn test_factory_collects_request_stats() {
    let config = Config {
        embedded: embedded_config(16),
        ..Config::default()
    };
    let cache = new_cache("stats", CacheType::Result, &config).await.unwrap();
    let stats = Arc::new(RequestStats::new());
    let ctx = RequestContext::new().with_stats(stats.clone());

    cache
        .store(&ctx, keys(&["q1"]), vec![b"rows".to_vec()])
        .await
        .unwrap();
    cache.fetch(&ctx, keys(&["q1", "q2"])).await.unwrap();

    let result = stats.get(CacheType::Result);
    assert_eq!(result.requests, 1);
    assert_eq!(result.entries_stored, 1);
    assert_eq!(result.entries_requested, 2);
    assert_eq!(result.entries_found, 1);
    assert_eq!(result.bytes_received, 4);

    cache.stop().await;
}

#[tokio::test]
async fn test_factory_without_backends_is_noop() {
    let cache = new_cache("env", CacheType::Chunk, &Config::default())
        .await
        .unwrap();
    assert!(tiercache::is_empty_tiered(cache.as_ref()));

    cache
        .store(&RequestContext::new(), keys(&["a"]), vec![b"1".to_vec()])
        .await
        .unwrap();
    let fetched = cache
        .fetch(&RequestContext::new(), keys(&["a"]))
        .await
        .unwrap();
    assert_eq!(fetched.missing, vec!["a"]);
}
