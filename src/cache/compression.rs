//! Snappy compression decorator.

use std::sync::Arc;

use async_trait::async_trait;
use snap::raw::{Decoder as SnapDecoder, Encoder as SnapEncoder};
use tracing::warn;

use crate::cache::{Cache, CacheType, Fetched};
use crate::context::RequestContext;
use crate::error::{CacheError, Result};

/// Compresses values with snappy on store and decompresses them on fetch.
///
/// A value that fails to decompress fails the whole fetch.
pub struct SnappyCache {
    inner: Arc<dyn Cache>,
}

impl SnappyCache {
    pub fn new(inner: Arc<dyn Cache>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Cache for SnappyCache {
    async fn store(
        &self,
        ctx: &RequestContext,
        keys: Vec<String>,
        values: Vec<Vec<u8>>,
    ) -> Result<()> {
        let mut encoder = SnapEncoder::new();
        let mut compressed = Vec::with_capacity(values.len());
        for value in &values {
            match encoder.compress_vec(value) {
                Ok(bytes) => compressed.push(bytes),
                Err(err) => {
                    // Only possible for inputs beyond snappy's length limit
                    return Err(CacheError::Protocol(format!("snappy compress: {err}")));
                }
            }
        }
        self.inner.store(ctx, keys, compressed).await
    }

    async fn fetch(&self, ctx: &RequestContext, keys: Vec<String>) -> Result<Fetched> {
        let fetched = self.inner.fetch(ctx, keys).await?;

        let mut decoder = SnapDecoder::new();
        let mut values = Vec::with_capacity(fetched.values.len());
        for (key, value) in fetched.found.iter().zip(&fetched.values) {
            match decoder.decompress_vec(value) {
                Ok(bytes) => values.push(bytes),
                Err(err) => {
                    warn!(key = %key, error = %err, "failed to decompress cached value");
                    return Err(CacheError::Decompress(format!("{key}: {err}")));
                }
            }
        }

        Ok(Fetched {
            found: fetched.found,
            values,
            missing: fetched.missing,
        })
    }

    async fn stop(&self) {
        self.inner.stop().await;
    }

    fn cache_type(&self) -> CacheType {
        self.inner.cache_type()
    }
}
