//! Request-scoped values carried alongside every cache call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;

use crate::cache::CacheType;

// == Request Context ==
/// Values scoped to one logical request.
///
/// Passed by reference into every [`Cache`](crate::cache::Cache) call. Both
/// fields are optional; layers that read them must tolerate their absence.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    generation: Option<String>,
    stats: Option<Arc<RequestStats>>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh context with no request values, for work that outlives the
    /// request that triggered it.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_generation(mut self, generation: impl Into<String>) -> Self {
        self.generation = Some(generation.into());
        self
    }

    pub fn with_stats(mut self, stats: Arc<RequestStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Generation tag used to namespace keys, if set and non-empty.
    pub fn generation(&self) -> Option<&str> {
        self.generation.as_deref().filter(|g| !g.is_empty())
    }

    pub fn stats(&self) -> Option<&Arc<RequestStats>> {
        self.stats.as_ref()
    }
}

// == Request Stats ==
#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    entries_stored: AtomicU64,
    entries_requested: AtomicU64,
    entries_found: AtomicU64,
    bytes_received: AtomicU64,
    download_nanos: AtomicU64,
}

/// Per cache-type counters accumulated over one request.
#[derive(Debug, Default)]
pub struct RequestStats {
    by_type: RwLock<HashMap<CacheType, Arc<Counters>>>,
}

/// Point in time copy of the counters for one cache type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    pub requests: u64,
    pub entries_stored: u64,
    pub entries_requested: u64,
    pub entries_found: u64,
    pub bytes_received: u64,
    pub download_time: Duration,
}

impl RequestStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, cache_type: CacheType) -> Arc<Counters> {
        if let Some(counters) = self.by_type.read().get(&cache_type) {
            return counters.clone();
        }
        self.by_type.write().entry(cache_type).or_default().clone()
    }

    pub fn add_request(&self, cache_type: CacheType) {
        self.counters(cache_type)
            .requests
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_entries_stored(&self, cache_type: CacheType, n: usize) {
        self.counters(cache_type)
            .entries_stored
            .fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Records one fetch: keys asked for, keys found, payload size and latency.
    pub fn add_fetch(
        &self,
        cache_type: CacheType,
        requested: usize,
        found: usize,
        bytes: usize,
        elapsed: Duration,
    ) {
        let counters = self.counters(cache_type);
        counters
            .entries_requested
            .fetch_add(requested as u64, Ordering::Relaxed);
        counters
            .entries_found
            .fetch_add(found as u64, Ordering::Relaxed);
        counters
            .bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
        counters
            .download_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn get(&self, cache_type: CacheType) -> CacheStatsSnapshot {
        self.by_type
            .read()
            .get(&cache_type)
            .map(|c| snapshot_of(c))
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> HashMap<CacheType, CacheStatsSnapshot> {
        self.by_type
            .read()
            .iter()
            .map(|(t, c)| (*t, snapshot_of(c)))
            .collect()
    }
}

fn snapshot_of(c: &Counters) -> CacheStatsSnapshot {
    CacheStatsSnapshot {
        requests: c.requests.load(Ordering::Relaxed),
        entries_stored: c.entries_stored.load(Ordering::Relaxed),
        entries_requested: c.entries_requested.load(Ordering::Relaxed),
        entries_found: c.entries_found.load(Ordering::Relaxed),
        bytes_received: c.bytes_received.load(Ordering::Relaxed),
        download_time: Duration::from_nanos(c.download_nanos.load(Ordering::Relaxed)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_empty_is_unset() {
        let ctx = RequestContext::new().with_generation("");
        assert_eq!(ctx.generation(), None);

        let ctx = RequestContext::new().with_generation("42");
        assert_eq!(ctx.generation(), Some("42"));
    }

    #[test]
    fn test_stats_accumulate_per_type() {
        let stats = RequestStats::new();
        stats.add_request(CacheType::Chunk);
        stats.add_request(CacheType::Chunk);
        stats.add_entries_stored(CacheType::Index, 3);
        stats.add_fetch(CacheType::Chunk, 4, 3, 100, Duration::from_millis(2));

        let chunk = stats.get(CacheType::Chunk);
        assert_eq!(chunk.requests, 2);
        assert_eq!(chunk.entries_requested, 4);
        assert_eq!(chunk.entries_found, 3);
        assert_eq!(chunk.bytes_received, 100);
        assert_eq!(chunk.download_time, Duration::from_millis(2));

        assert_eq!(stats.get(CacheType::Index).entries_stored, 3);
        assert_eq!(stats.get(CacheType::Result), CacheStatsSnapshot::default());
        assert_eq!(stats.snapshot().len(), 2);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = RequestStats::new();
        stats.add_request(CacheType::Result);
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["result"]["requests"], 1);
    }
}
