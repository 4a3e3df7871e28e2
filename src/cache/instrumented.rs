//! Instrumentation decorator: request duration and value size histograms plus
//! a tracing span per call.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use metrics::{counter, histogram};
use tracing::{field, info_span, Instrument, Span};

use crate::cache::{Cache, CacheType, Fetched};
use crate::context::RequestContext;
use crate::error::Result;

/// Records metrics and a span around every store and fetch.
pub struct InstrumentedCache {
    name: String,
    inner: Arc<dyn Cache>,
}

impl InstrumentedCache {
    pub fn new(name: impl Into<String>, inner: Arc<dyn Cache>) -> Self {
        Self {
            name: name.into(),
            inner,
        }
    }

    fn observe(&self, method: &'static str, started: Instant, ok: bool) {
        let status = if ok { "success" } else { "error" };
        histogram!(
            "cache_request_duration_seconds",
            "name" => self.name.clone(),
            "method" => method,
            "status" => status
        )
        .record(started.elapsed().as_secs_f64());
    }
}

#[async_trait]
impl Cache for InstrumentedCache {
    async fn store(
        &self,
        ctx: &RequestContext,
        keys: Vec<String>,
        values: Vec<Vec<u8>>,
    ) -> Result<()> {
        for value in &values {
            histogram!("cache_value_size_bytes", "name" => self.name.clone(), "method" => "store")
                .record(value.len() as f64);
        }

        let span = info_span!(
            "cache.store",
            cache = %self.name,
            keys = keys.len(),
            write_back_dropped = field::Empty,
            error = field::Empty
        );
        let started = Instant::now();
        let result = self
            .inner
            .store(ctx, keys, values)
            .instrument(span.clone())
            .await;
        self.observe("store", started, result.is_ok());

        if let Err(err) = &result {
            span.record("error", field::display(err));
        }
        result
    }

    async fn fetch(&self, ctx: &RequestContext, keys: Vec<String>) -> Result<Fetched> {
        let span = info_span!(
            "cache.fetch",
            cache = %self.name,
            keys_requested = keys.len(),
            keys_found = field::Empty,
            keys_missing = field::Empty,
            error = field::Empty
        );
        let requested = keys.len();
        let started = Instant::now();
        let result = self.inner.fetch(ctx, keys).instrument(span.clone()).await;
        self.observe("fetch", started, result.is_ok());

        counter!("cache_fetched_keys_total", "name" => self.name.clone()).increment(requested as u64);
        match &result {
            Ok(fetched) => {
                counter!("cache_hits_total", "name" => self.name.clone())
                    .increment(fetched.found.len() as u64);
                for value in &fetched.values {
                    histogram!("cache_value_size_bytes", "name" => self.name.clone(), "method" => "fetch")
                        .record(value.len() as f64);
                }
                record_counts(&span, fetched);
            }
            Err(err) => {
                span.record("error", field::display(err));
            }
        }
        result
    }

    async fn stop(&self) {
        self.inner.stop().await;
    }

    fn cache_type(&self) -> CacheType {
        self.inner.cache_type()
    }

    fn tier_count(&self) -> Option<usize> {
        self.inner.tier_count()
    }
}

fn record_counts(span: &Span, fetched: &Fetched) {
    span.record("keys_found", fetched.found.len());
    span.record("keys_missing", fetched.missing.len());
}
