//! Cache Module
//!
//! The [`Cache`] capability and every layer implementing or wrapping it: the
//! embedded LRU/TTL cache, background write-back, tiering, and the thin
//! cross-cutting decorators.

mod background;
mod collect_stats;
mod compression;
mod embedded;
mod entry;
mod factory;
mod generation;
mod instrumented;
mod lru;
#[cfg(test)]
mod mock;
mod stats;
mod stop_once;
mod tiered;


use std::fmt;

use async_trait::async_trait;
use serde::Serialize;

use crate::context::RequestContext;
use crate::error::{CacheError, Result};

// Re-export public types
pub use background::BackgroundCache;
pub use collect_stats::CollectStats;
pub use compression::SnappyCache;
pub use embedded::{EmbeddedCache, EvictCallback};
pub use entry::{ByteSize, Entry, ENTRY_OVERHEAD};
pub use factory::new_cache;
pub use generation::GenerationCache;
pub use instrumented::InstrumentedCache;
pub use lru::RecencyList;
#[cfg(test)]
pub use mock::MockCache;
pub use stats::{EmbeddedStats, EvictionReason};
pub use stop_once::StopOnce;
pub use tiered::{is_empty_tiered, TieredCache};

// == Cache Type ==
/// What kind of data a cache holds; used to key request stats and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheType {
    Chunk,
    Index,
    Result,
    WriteDedupe,
    Other,
}

impl CacheType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheType::Chunk => "chunk",
            CacheType::Index => "index",
            CacheType::Result => "result",
            CacheType::WriteDedupe => "write-dedupe",
            CacheType::Other => "other",
        }
    }
}

impl fmt::Display for CacheType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// == Fetch Result ==
/// Outcome of a [`Cache::fetch`].
///
/// `found` and `missing` partition the requested keys; `values[i]` belongs to
/// `found[i]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fetched {
    pub found: Vec<String>,
    pub values: Vec<Vec<u8>>,
    pub missing: Vec<String>,
}

impl Fetched {
    /// Every key reported missing.
    pub fn all_missing(keys: Vec<String>) -> Self {
        Self {
            found: Vec::new(),
            values: Vec::new(),
            missing: keys,
        }
    }

    /// Appends another result, preserving order.
    pub fn extend(&mut self, other: Fetched) {
        self.found.extend(other.found);
        self.values.extend(other.values);
        self.missing.extend(other.missing);
    }

    /// Total bytes across all found values.
    pub fn value_bytes(&self) -> usize {
        self.values.iter().map(Vec::len).sum()
    }
}

// == Cache Capability ==
/// A byte cache keyed by strings.
///
/// Implementations are shared behind `Arc<dyn Cache>` and must be safe to call
/// concurrently. A fetch error means every requested key should be treated as a
/// miss.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Stores `values[i]` under `keys[i]`.
    async fn store(&self, ctx: &RequestContext, keys: Vec<String>, values: Vec<Vec<u8>>)
        -> Result<()>;

    /// Looks up `keys`, reporting each one either found or missing.
    async fn fetch(&self, ctx: &RequestContext, keys: Vec<String>) -> Result<Fetched>;

    /// Releases background tasks and connections.
    async fn stop(&self);

    fn cache_type(&self) -> CacheType;

    /// Number of tiers when this cache is a tiered composite.
    fn tier_count(&self) -> Option<usize> {
        None
    }
}

/// Precondition shared by every `store` implementation.
pub(crate) fn check_lengths(keys: &[String], values: &[Vec<u8>]) -> Result<()> {
    if keys.len() != values.len() {
        return Err(CacheError::LengthMismatch {
            keys: keys.len(),
            values: values.len(),
        });
    }
    Ok(())
}
