//! Batched memcached cache: splits large fetches into fixed-size sub-batches
//! served by a worker pool and reassembles them in input order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_128;

use super::client::MemcachedClient;
use super::protocol::is_valid_key;
use crate::cache::{check_lengths, Cache, CacheType, Fetched};
use crate::config::MemcachedConfig;
use crate::context::RequestContext;
use crate::error::{CacheError, Result};

/// One sub-batch of a fetch, tagged with its position.
struct Work {
    index: usize,
    keys: Vec<String>,
    results: mpsc::Sender<BatchResult>,
}

struct BatchResult {
    index: usize,
    outcome: Result<Fetched>,
}

/// Resolves once `rx` observes `true` or its sender is gone.
async fn stopped(rx: &mut watch::Receiver<bool>) {
    loop {
        let done = *rx.borrow_and_update();
        if done || rx.changed().await.is_err() {
            return;
        }
    }
}

/// The key sent on the wire; invalid memcached keys become a hex digest.
fn wire_key(key: &str) -> String {
    if is_valid_key(key) {
        key.to_string()
    } else {
        format!("{:032x}", xxh3_128(key.as_bytes()))
    }
}

/// One unbatched round trip, reported in `keys` order.
async fn fetch_direct(client: &dyn MemcachedClient, keys: Vec<String>) -> Result<Fetched> {
    let values = client.get_multi(&keys).await?;
    let mut fetched = Fetched::default();
    for key in keys {
        match values.get(&key).cloned() {
            Some(value) => {
                fetched.found.push(key);
                fetched.values.push(value);
            }
            None => fetched.missing.push(key),
        }
    }
    Ok(fetched)
}

// == Memcached Cache ==
/// [`Cache`] over a [`MemcachedClient`].
///
/// With a non-zero batch size and parallelism, fetches are split into
/// sub-batches and served by `parallelism` worker tasks; otherwise every
/// fetch is a single round trip.
pub struct MemcachedCache {
    name: String,
    cache_type: CacheType,
    client: Arc<dyn MemcachedClient>,
    batch_size: usize,
    validity: Duration,
    work_tx: Mutex<Option<mpsc::Sender<Work>>>,
    stop_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl MemcachedCache {
    pub fn new(
        name: impl Into<String>,
        cache_type: CacheType,
        config: &MemcachedConfig,
        client: Arc<dyn MemcachedClient>,
    ) -> Self {
        let name = name.into();
        let (stop_tx, _) = watch::channel(false);
        let batched = config.batch_size > 0 && config.parallelism > 0;

        let mut workers = Vec::new();
        let work_tx = batched.then(|| {
            let (work_tx, work_rx) = mpsc::channel::<Work>(config.parallelism);
            let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
            for _ in 0..config.parallelism {
                workers.push(tokio::spawn(run_worker(
                    client.clone(),
                    work_rx.clone(),
                    stop_tx.subscribe(),
                )));
            }
            work_tx
        });

        debug!(
            cache = %name,
            batch_size = config.batch_size,
            parallelism = config.parallelism,
            "memcached cache started"
        );

        Self {
            name,
            cache_type,
            client,
            batch_size: config.batch_size,
            validity: config.default_validity,
            work_tx: Mutex::new(work_tx),
            stop_tx,
            workers: Mutex::new(workers),
        }
    }

    async fn fetch_batched(
        &self,
        work_tx: mpsc::Sender<Work>,
        keys: Vec<String>,
    ) -> Result<Fetched> {
        let batches: Vec<Vec<String>> = keys
            .chunks(self.batch_size)
            .map(<[String]>::to_vec)
            .collect();
        let count = batches.len();
        let (results_tx, mut results_rx) = mpsc::channel(count.max(1));
        let mut stop_rx = self.stop_tx.subscribe();

        // Dispatch
        for (index, keys) in batches.into_iter().enumerate() {
            let work = Work {
                index,
                keys,
                results: results_tx.clone(),
            };
            tokio::select! {
                sent = work_tx.send(work) => {
                    if sent.is_err() {
                        return Err(CacheError::Stopped);
                    }
                }
                _ = stopped(&mut stop_rx) => return Err(CacheError::Stopped),
            }
        }
        drop(results_tx);

        // Collect into position
        let mut slots: Vec<Option<Fetched>> = (0..count).map(|_| None).collect();
        let mut failed = None;
        for _ in 0..count {
            let received = tokio::select! {
                received = results_rx.recv() => received,
                _ = stopped(&mut stop_rx) => None,
            };
            let Some(BatchResult { index, outcome }) = received else {
                return Err(CacheError::Stopped);
            };
            match outcome {
                Ok(fetched) => slots[index] = Some(fetched),
                Err(err) => failed = Some(err),
            }
        }
        if let Some(err) = failed {
            return Err(err);
        }

        let mut fetched = Fetched::default();
        for slot in slots.into_iter().flatten() {
            fetched.extend(slot);
        }
        Ok(fetched)
    }
}

async fn run_worker(
    client: Arc<dyn MemcachedClient>,
    work_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Work>>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        let work = {
            let mut rx = work_rx.lock().await;
            tokio::select! {
                work = rx.recv() => work,
                _ = stopped(&mut stop_rx) => None,
            }
        };
        let Some(Work { index, keys, results }) = work else {
            break;
        };

        let outcome = tokio::select! {
            outcome = fetch_direct(client.as_ref(), keys) => outcome,
            _ = stopped(&mut stop_rx) => break,
        };
        // The caller may have given up already
        let _ = results.send(BatchResult { index, outcome }).await;
    }
}

#[async_trait]
impl Cache for MemcachedCache {
    async fn store(
        &self,
        _ctx: &RequestContext,
        keys: Vec<String>,
        values: Vec<Vec<u8>>,
    ) -> Result<()> {
        check_lengths(&keys, &values)?;

        let mut last_err = None;
        for (key, value) in keys.iter().zip(&values) {
            match self.client.set(&wire_key(key), value, self.validity).await {
                Ok(()) => {}
                // Counted by the client; oversized values are simply not cached
                Err(CacheError::ValueTooLarge { .. }) => {}
                Err(err) => {
                    warn!(cache = %self.name, key = %key, error = %err, "memcached set failed");
                    last_err = Some(err);
                }
            }
        }
        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn fetch(&self, _ctx: &RequestContext, keys: Vec<String>) -> Result<Fetched> {
        if keys.is_empty() {
            return Ok(Fetched::default());
        }

        let mut originals: HashMap<String, String> = HashMap::new();
        let wire_keys: Vec<String> = keys
            .into_iter()
            .map(|key| {
                let wire = wire_key(&key);
                if wire != key {
                    originals.insert(wire.clone(), key);
                }
                wire
            })
            .collect();

        let work_tx = self.work_tx.lock().clone();
        let mut fetched = match work_tx {
            Some(work_tx) => self.fetch_batched(work_tx, wire_keys).await?,
            None if *self.stop_tx.borrow() => return Err(CacheError::Stopped),
            None => fetch_direct(self.client.as_ref(), wire_keys).await?,
        };

        if !originals.is_empty() {
            for key in fetched.found.iter_mut().chain(fetched.missing.iter_mut()) {
                if let Some(original) = originals.get(key.as_str()) {
                    key.clone_from(original);
                }
            }
        }
        Ok(fetched)
    }

    async fn stop(&self) {
        self.stop_tx.send_replace(true);
        self.work_tx.lock().take();

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.await;
        }
        self.client.stop().await;
        debug!(cache = %self.name, "memcached cache stopped");
    }

    fn cache_type(&self) -> CacheType {
        self.cache_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory client; the first key of each request picks its latency.
    #[derive(Default)]
    struct FakeClient {
        data: parking_lot::Mutex<HashMap<String, Vec<u8>>>,
        delays: HashMap<String, Duration>,
        fail_on: Option<String>,
        calls: AtomicUsize,
        stops: AtomicUsize,
    }

    #[async_trait]
    impl MemcachedClient for FakeClient {
        async fn get_multi(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = keys.first().and_then(|k| self.delays.get(k)) {
                tokio::time::sleep(*delay).await;
            }
            if keys.iter().any(|k| Some(k) == self.fail_on.as_ref()) {
                return Err(CacheError::Timeout("get".into()));
            }
            let data = self.data.lock();
            Ok(keys
                .iter()
                .filter_map(|k| data.get(k).map(|v| (k.clone(), v.clone())))
                .collect())
        }

        async fn set(&self, key: &str, value: &[u8], _validity: Duration) -> Result<()> {
            if value.len() > 8 {
                return Err(CacheError::ValueTooLarge {
                    size: value.len(),
                    limit: 8,
                });
            }
            if Some(key) == self.fail_on.as_deref() {
                return Err(CacheError::Timeout("set".into()));
            }
            self.data.lock().insert(key.to_string(), value.to_vec());
            Ok(())
        }

        async fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(batch_size: usize, parallelism: usize) -> MemcachedConfig {
        MemcachedConfig {
            addresses: vec!["127.0.0.1:11211".into()],
            batch_size,
            parallelism,
            ..MemcachedConfig::default()
        }
    }

    fn keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("k{i}")).collect()
    }

    #[tokio::test]
    async fn test_batches_reassemble_in_input_order() {
        let mut client = FakeClient::default();
        // Earlier batches finish last
        for i in (0..20).step_by(3) {
            client
                .delays
                .insert(format!("k{i}"), Duration::from_millis(5 * (20 - i) as u64));
        }
        for i in (0..20).filter(|i| i % 2 == 0) {
            client.data.lock().insert(format!("k{i}"), vec![i as u8]);
        }
        let client = Arc::new(client);
        let cache = MemcachedCache::new("mc", CacheType::Chunk, &config(3, 4), client.clone());

        let fetched = cache.fetch(&RequestContext::new(), keys(20)).await.unwrap();

        let named = |keep: usize| -> Vec<String> {
            (0..20).filter(|i| i % 2 == keep).map(|i| format!("k{i}")).collect()
        };
        assert_eq!(fetched.found, named(0));
        assert_eq!(fetched.missing, named(1));
        assert_eq!(fetched.values[1], vec![2u8]);
        assert_eq!(client.calls.load(Ordering::SeqCst), 7);
        cache.stop().await;
    }

    #[tokio::test]
    async fn test_zero_batch_size_is_single_round_trip() {
        let client = Arc::new(FakeClient::default());
        let cache = MemcachedCache::new("mc", CacheType::Chunk, &config(0, 4), client.clone());

        let fetched = cache.fetch(&RequestContext::new(), keys(50)).await.unwrap();
        assert_eq!(fetched.missing.len(), 50);
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_batch_fails_fetch() {
        let client = Arc::new(FakeClient {
            fail_on: Some("k4".into()),
            ..FakeClient::default()
        });
        let cache = MemcachedCache::new("mc", CacheType::Chunk, &config(2, 2), client);

        let result = cache.fetch(&RequestContext::new(), keys(6)).await;
        assert!(matches!(result, Err(CacheError::Timeout(_))));
        cache.stop().await;
    }

    #[tokio::test]
    async fn test_stop_unblocks_pending_fetch() {
        let mut client = FakeClient::default();
        client.delays.insert("k0".into(), Duration::from_secs(60));
        let client = Arc::new(client);
        let cache = Arc::new(MemcachedCache::new(
            "mc",
            CacheType::Chunk,
            &config(2, 2),
            client.clone(),
        ));

        let pending = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.fetch(&RequestContext::new(), keys(4)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::time::timeout(Duration::from_secs(5), cache.stop())
            .await
            .expect("stop must not hang");

        let result = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .expect("fetch must not hang")
            .unwrap();
        assert!(matches!(result, Err(CacheError::Stopped)));
        assert_eq!(client.stops.load(Ordering::SeqCst), 1);

        let after = cache.fetch(&RequestContext::new(), keys(1)).await;
        assert!(matches!(after, Err(CacheError::Stopped)));
    }

    #[tokio::test]
    async fn test_invalid_keys_are_hashed_and_restored() {
        let client = Arc::new(FakeClient::default());
        let cache = MemcachedCache::new("mc", CacheType::Chunk, &config(2, 2), client.clone());
        let long_key = "x".repeat(300);
        let ctx = RequestContext::new();

        cache
            .store(
                &ctx,
                vec!["has space".into(), long_key.clone()],
                vec![b"a".to_vec(), b"b".to_vec()],
            )
            .await
            .unwrap();
        assert!(client.data.lock().keys().all(|k| is_valid_key(k)));

        let fetched = cache
            .fetch(&ctx, vec![long_key.clone(), "has space".into(), "nope here".into()])
            .await
            .unwrap();
        assert_eq!(fetched.found, vec![long_key, "has space".to_string()]);
        assert_eq!(fetched.values, vec![b"b".to_vec(), b"a".to_vec()]);
        assert_eq!(fetched.missing, vec!["nope here"]);
        cache.stop().await;
    }

    #[tokio::test]
    async fn test_repeated_keys_reported_per_occurrence() {
        let client = Arc::new(FakeClient::default());
        let cache = MemcachedCache::new("mc", CacheType::Chunk, &config(0, 0), client);
        let ctx = RequestContext::new();
        cache
            .store(
                &ctx,
                vec!["bad key".into(), "ok".into()],
                vec![b"1".to_vec(), b"2".to_vec()],
            )
            .await
            .unwrap();

        let requested: Vec<String> = ["bad key", "bad key", "ok", "ok"]
            .iter()
            .map(|k| k.to_string())
            .collect();
        let fetched = cache.fetch(&ctx, requested.clone()).await.unwrap();

        assert_eq!(fetched.found, requested);
        let expected: Vec<Vec<u8>> = [b"1", b"1", b"2", b"2"].iter().map(|v| v.to_vec()).collect();
        assert_eq!(fetched.values, expected);
        assert!(fetched.missing.is_empty());
    }

    #[tokio::test]
    async fn test_store_continues_past_failures() {
        let client = Arc::new(FakeClient {
            fail_on: Some("b".into()),
            ..FakeClient::default()
        });
        let cache = MemcachedCache::new("mc", CacheType::Chunk, &config(0, 0), client.clone());

        let result = cache
            .store(
                &RequestContext::new(),
                vec!["a".into(), "b".into(), "c".into(), "big".into()],
                vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec(), vec![0; 64]],
            )
            .await;
        assert!(matches!(result, Err(CacheError::Timeout(_))));

        let data = client.data.lock();
        assert!(data.contains_key("a") && data.contains_key("c"));
        assert!(!data.contains_key("big"));
    }
}
