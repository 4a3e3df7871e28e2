//! In-memory [`Cache`] with no limits, for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::cache::{check_lengths, Cache, CacheType, Fetched};
use crate::context::RequestContext;
use crate::error::{CacheError, Result};

/// Unbounded map-backed cache that records how it was called.
#[derive(Debug)]
pub struct MockCache {
    cache_type: CacheType,
    data: Mutex<HashMap<String, Vec<u8>>>,
    store_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    fail: AtomicBool,
}

impl Default for MockCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCache {
    pub fn new() -> Self {
        Self::with_type(CacheType::Other)
    }

    pub fn with_type(cache_type: CacheType) -> Self {
        Self {
            cache_type,
            data: Mutex::new(HashMap::new()),
            store_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    /// Makes every subsequent store and fetch fail with a protocol error.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.data.lock().insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.data.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn store_calls(&self) -> usize {
        self.store_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    fn check_failing(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CacheError::Protocol("mock failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Cache for MockCache {
    async fn store(
        &self,
        _ctx: &RequestContext,
        keys: Vec<String>,
        values: Vec<Vec<u8>>,
    ) -> Result<()> {
        self.store_calls.fetch_add(1, Ordering::SeqCst);
        check_lengths(&keys, &values)?;
        self.check_failing()?;
        let mut data = self.data.lock();
        for (key, value) in keys.into_iter().zip(values) {
            data.insert(key, value);
        }
        Ok(())
    }

    async fn fetch(&self, _ctx: &RequestContext, keys: Vec<String>) -> Result<Fetched> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failing()?;
        let data = self.data.lock();
        let mut result = Fetched::default();
        for key in keys {
            match data.get(&key) {
                Some(value) => {
                    result.values.push(value.clone());
                    result.found.push(key);
                }
                None => result.missing.push(key),
            }
        }
        Ok(result)
    }

    async fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn cache_type(&self) -> CacheType {
        self.cache_type
    }
}
