//! Embedded Cache Module
//!
//! In-process cache combining a hash index with a recency list. Bounded by an
//! estimated byte size, an item count, or both, with optional TTL purging.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::cache::{
    check_lengths, ByteSize, Cache, CacheType, EmbeddedStats, Entry, EvictionReason, Fetched,
    RecencyList,
};
use crate::config::EmbeddedConfig;
use crate::context::RequestContext;
use crate::error::Result;
use crate::tasks::{spawn_purge_task, Purgeable};

/// Invoked with every entry removed by eviction, replacement or expiry.
///
/// Runs while the cache's write lock is held and must not call back into the
/// same cache.
pub type EvictCallback<K, V> = Arc<dyn Fn(&K, &V) + Send + Sync>;

struct Index<K, V> {
    slots: HashMap<K, usize>,
    recency: RecencyList<Entry<K, V>>,
    current_bytes: usize,
    stats: EmbeddedStats,
}

struct Shared<K, V> {
    name: String,
    max_bytes: usize,
    max_items: usize,
    ttl: Duration,
    index: RwLock<Index<K, V>>,
    hits: AtomicU64,
    misses: AtomicU64,
    on_evict: Option<EvictCallback<K, V>>,
}

// == Embedded Cache ==
/// Generic in-process cache.
///
/// Recency is insertion/overwrite order: `get` never reorders entries, so the
/// eviction victim is the entry least recently written.
pub struct EmbeddedCache<K, V> {
    shared: Arc<Shared<K, V>>,
    cache_type: CacheType,
    stop_tx: watch::Sender<bool>,
    purge_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<K, V> EmbeddedCache<K, V>
where
    K: Hash + Eq + Clone + ByteSize + Send + Sync + 'static,
    V: Clone + ByteSize + Send + Sync + 'static,
{
    // == Constructor ==
    /// Builds the cache, or returns `None` when neither limit is set.
    ///
    /// The purge task is spawned on the current tokio runtime when `ttl` is
    /// non-zero.
    pub fn new(
        name: impl Into<String>,
        cache_type: CacheType,
        config: &EmbeddedConfig,
        on_evict: Option<EvictCallback<K, V>>,
    ) -> Option<Self> {
        let name = name.into();
        if config.max_size_bytes == 0 && config.max_size_items == 0 {
            warn!(cache = %name, "embedded cache has neither a byte nor an item limit, disabled");
            return None;
        }

        let shared = Arc::new(Shared {
            name,
            max_bytes: config.max_size_bytes,
            max_items: config.max_size_items,
            ttl: config.ttl,
            index: RwLock::new(Index {
                slots: HashMap::new(),
                recency: RecencyList::new(),
                current_bytes: 0,
                stats: EmbeddedStats::new(),
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            on_evict,
        });

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut purge_task = None;
        if !config.ttl.is_zero() {
            match tokio::runtime::Handle::try_current() {
                Ok(_) => {
                    purge_task = Some(spawn_purge_task(
                        shared.clone(),
                        config.purge_interval,
                        stop_rx,
                    ));
                }
                Err(_) => {
                    warn!(cache = %shared.name, "no tokio runtime, TTL purge task not started");
                }
            }
        }

        Some(Self {
            shared,
            cache_type,
            stop_tx,
            purge_task: Mutex::new(purge_task),
        })
    }

    // == Put ==
    /// Inserts or overwrites one entry, evicting as needed.
    pub fn put(&self, key: K, value: V) {
        let mut index = self.shared.index.write();
        self.shared.put_locked(&mut index, key, value);
        self.shared.report_size(&index);
    }

    /// Inserts many entries under a single lock acquisition.
    pub fn put_many(&self, entries: impl IntoIterator<Item = (K, V)>) {
        let mut index = self.shared.index.write();
        for (key, value) in entries {
            self.shared.put_locked(&mut index, key, value);
        }
        self.shared.report_size(&index);
    }

    // == Get ==
    /// Returns a clone of the value if present and not past its TTL.
    ///
    /// Does not change the entry's position in the recency order.
    pub fn get(&self, key: &K) -> Option<V> {
        let index = self.shared.index.read();
        let value = self.shared.lookup(&index, key, Instant::now());
        drop(index);

        match value {
            Some(v) => {
                self.shared.hits.fetch_add(1, Ordering::Relaxed);
                Some(v)
            }
            None => {
                self.shared.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    // == Purge ==
    /// Removes every entry older than the TTL as seen at `now`.
    ///
    /// Returns the number of entries removed. A zero TTL never expires anything.
    pub fn purge_expired_at(&self, now: Instant) -> usize {
        self.shared.purge_expired_at(now)
    }

    // == Stop ==
    /// Terminates the purge task and drops every entry in one reset.
    pub fn stop(&self) {
        let mut index = self.shared.index.write();
        let _ = self.stop_tx.send(true);
        self.purge_task.lock().take();
        let dropped = index.recency.len() as u64;
        index.stats.evicted_stopped += dropped;
        counter!(
            "cache_embedded_evicted_total",
            "name" => self.shared.name.clone(),
            "reason" => EvictionReason::Stopped.as_str()
        )
        .increment(dropped);
        index.slots.clear();
        index.recency.clear();
        index.current_bytes = 0;
        self.shared.report_size(&index);
        debug!(cache = %self.shared.name, "embedded cache stopped");
    }

    pub fn len(&self) -> usize {
        self.shared.index.read().recency.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Estimated size of all live entries.
    pub fn current_bytes(&self) -> usize {
        self.shared.index.read().current_bytes
    }

    pub fn stats(&self) -> EmbeddedStats {
        let index = self.shared.index.read();
        let mut stats = index.stats.clone();
        stats.hits = self.shared.hits.load(Ordering::Relaxed);
        stats.misses = self.shared.misses.load(Ordering::Relaxed);
        stats.entries = index.recency.len();
        stats.bytes = index.current_bytes;
        stats
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

impl<K, V> Shared<K, V>
where
    K: Hash + Eq + Clone + ByteSize,
    V: Clone + ByteSize,
{
    fn put_locked(&self, index: &mut Index<K, V>, key: K, value: V) {
        let replaced = index
            .slots
            .remove(&key)
            .and_then(|slot| index.recency.remove(slot));
        if let Some(old) = &replaced {
            index.current_bytes -= old.size();
        }

        let entry = Entry::new(key, value);
        let size = entry.size();

        if self.max_bytes > 0 && size > self.max_bytes {
            if let Some(old) = replaced {
                self.evicted(index, &old, EvictionReason::TooBig);
            }
            debug!(cache = %self.name, size, max_bytes = self.max_bytes, "entry larger than cache, rejected");
            return;
        }
        if let Some(old) = replaced {
            self.evicted(index, &old, EvictionReason::Replaced);
        }

        while !index.recency.is_empty() && self.over_limit(index, size) {
            if let Some(victim) = index.recency.pop_back() {
                index.slots.remove(&victim.key);
                index.current_bytes -= victim.size();
                self.evicted(index, &victim, EvictionReason::Full);
            }
        }

        let key = entry.key.clone();
        let slot = index.recency.push_front(entry);
        index.slots.insert(key, slot);
        index.current_bytes += size;
    }

    fn over_limit(&self, index: &Index<K, V>, incoming: usize) -> bool {
        (self.max_bytes > 0 && index.current_bytes + incoming > self.max_bytes)
            || (self.max_items > 0 && index.recency.len() >= self.max_items)
    }

    fn lookup(&self, index: &Index<K, V>, key: &K, now: Instant) -> Option<V> {
        let slot = *index.slots.get(key)?;
        let entry = index.recency.get(slot)?;
        if !self.ttl.is_zero() && entry.is_expired_at(now, self.ttl) {
            return None;
        }
        Some(entry.value.clone())
    }

    fn evicted(&self, index: &mut Index<K, V>, entry: &Entry<K, V>, reason: EvictionReason) {
        index.stats.record_eviction(reason);
        counter!("cache_embedded_evicted_total", "name" => self.name.clone(), "reason" => reason.as_str())
            .increment(1);
        if let Some(callback) = &self.on_evict {
            callback(&entry.key, &entry.value);
        }
    }

    fn report_size(&self, index: &Index<K, V>) {
        gauge!("cache_embedded_entries", "name" => self.name.clone()).set(index.recency.len() as f64);
        gauge!("cache_embedded_memory_bytes", "name" => self.name.clone())
            .set(index.current_bytes as f64);
    }

    fn purge_expired_at(&self, now: Instant) -> usize {
        if self.ttl.is_zero() {
            return 0;
        }

        let mut index = self.index.write();
        let expired: Vec<usize> = index
            .recency
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now, self.ttl))
            .map(|(slot, _)| slot)
            .collect();

        let count = expired.len();
        for slot in expired {
            if let Some(entry) = index.recency.remove(slot) {
                index.slots.remove(&entry.key);
                index.current_bytes -= entry.size();
                self.evicted(&mut index, &entry, EvictionReason::Expired);
            }
        }
        self.report_size(&index);
        count
    }
}

impl<K, V> Purgeable for Shared<K, V>
where
    K: Hash + Eq + Clone + ByteSize + Send + Sync + 'static,
    V: Clone + ByteSize + Send + Sync + 'static,
{
    fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<K, V> Drop for EmbeddedCache<K, V> {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
    }
}

#[async_trait]
impl Cache for EmbeddedCache<String, Vec<u8>> {
    async fn store(
        &self,
        _ctx: &RequestContext,
        keys: Vec<String>,
        values: Vec<Vec<u8>>,
    ) -> Result<()> {
        check_lengths(&keys, &values)?;
        self.put_many(keys.into_iter().zip(values));
        Ok(())
    }

    async fn fetch(&self, _ctx: &RequestContext, keys: Vec<String>) -> Result<Fetched> {
        let now = Instant::now();
        let mut result = Fetched::default();
        {
            let index = self.shared.index.read();
            for key in keys {
                match self.shared.lookup(&index, &key, now) {
                    Some(value) => {
                        result.found.push(key);
                        result.values.push(value);
                    }
                    None => result.missing.push(key),
                }
            }
        }
        self.shared
            .hits
            .fetch_add(result.found.len() as u64, Ordering::Relaxed);
        self.shared
            .misses
            .fetch_add(result.missing.len() as u64, Ordering::Relaxed);
        Ok(result)
    }

    async fn stop(&self) {
        EmbeddedCache::stop(self);
    }

    fn cache_type(&self) -> CacheType {
        self.cache_type
    }
}
