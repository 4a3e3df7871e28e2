//! Cache Entry Module
//!
//! Defines the embedded cache's entry and the size heuristic used for its
//! byte limit.

use std::mem;
use std::time::{Duration, Instant};

/// Fixed bookkeeping cost charged to every entry: map slot, recency node and
/// timestamp.
pub const ENTRY_OVERHEAD: usize = 64;

// == Byte Size ==
/// Rough estimate of the memory a value occupies.
///
/// Not exact: it counts the heap payload plus the inline struct size and
/// ignores allocator slack.
pub trait ByteSize {
    fn byte_size(&self) -> usize;
}

impl ByteSize for String {
    fn byte_size(&self) -> usize {
        mem::size_of::<String>() + self.len()
    }
}

impl ByteSize for Vec<u8> {
    fn byte_size(&self) -> usize {
        mem::size_of::<Vec<u8>>() + self.len()
    }
}

impl ByteSize for u64 {
    fn byte_size(&self) -> usize {
        mem::size_of::<u64>()
    }
}

// == Cache Entry ==
/// A single embedded cache entry.
#[derive(Debug, Clone)]
pub struct Entry<K, V> {
    pub key: K,
    pub value: V,
    /// Set on insert and on every overwrite
    pub updated: Instant,
}

impl<K: ByteSize, V: ByteSize> Entry<K, V> {
    pub fn new(key: K, value: V) -> Self {
        Self {
            key,
            value,
            updated: Instant::now(),
        }
    }

    /// Estimated footprint of key, value and bookkeeping.
    pub fn size(&self) -> usize {
        self.key.byte_size() + self.value.byte_size() + ENTRY_OVERHEAD
    }

    /// True once more than `ttl` has passed since the last update, as seen at `now`.
    pub fn is_expired_at(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.updated) > ttl
    }
}
