//! Cache Statistics Module
//!
//! Tracks embedded cache hits, misses and evictions by reason.

use serde::Serialize;

// == Eviction Reason ==
/// Why an entry left the embedded cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    /// Expired by the TTL purge
    Expired,
    /// Pushed out to make room
    Full,
    /// Overwritten by a newer value for the same key
    Replaced,
    /// Removed because its replacement exceeds the byte limit
    TooBig,
    /// Dropped by the reset on stop
    Stopped,
}

impl EvictionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionReason::Expired => "expired",
            EvictionReason::Full => "full",
            EvictionReason::Replaced => "replaced",
            EvictionReason::TooBig => "too_big",
            EvictionReason::Stopped => "stopped",
        }
    }
}

// == Embedded Stats ==
/// Snapshot of embedded cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EmbeddedStats {
    pub hits: u64,
    pub misses: u64,
    pub evicted_expired: u64,
    pub evicted_full: u64,
    pub evicted_replaced: u64,
    pub evicted_too_big: u64,
    pub evicted_stopped: u64,
    /// Current number of entries
    pub entries: usize,
    /// Current estimated size of all entries
    pub bytes: usize,
}

impl EmbeddedStats {
    pub fn new() -> Self {
        Self::default()
    }

    // == Hit Rate ==
    /// Returns hits / (hits + misses), or 0.0 if nothing was looked up.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn record_hit(&mut self) {
        self.hits += 1;
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub fn record_eviction(&mut self, reason: EvictionReason) {
        match reason {
            EvictionReason::Expired => self.evicted_expired += 1,
            EvictionReason::Full => self.evicted_full += 1,
            EvictionReason::Replaced => self.evicted_replaced += 1,
            EvictionReason::TooBig => self.evicted_too_big += 1,
            EvictionReason::Stopped => self.evicted_stopped += 1,
        }
    }

    /// Evictions across every reason.
    pub fn evictions(&self) -> u64 {
        self.evicted_expired
            + self.evicted_full
            + self.evicted_replaced
            + self.evicted_too_big
            + self.evicted_stopped
    }
}
