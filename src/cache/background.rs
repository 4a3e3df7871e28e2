//! Background Write-Back Module
//!
//! Makes `store` non-blocking: batches are queued and forwarded to the wrapped
//! cache by a fixed pool of worker tasks. Delivery is best effort; batches that
//! do not fit in the queue or the byte budget are dropped.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Span};

use crate::cache::{check_lengths, Cache, CacheType, Fetched};
use crate::config::BackgroundConfig;
use crate::context::RequestContext;
use crate::error::Result;

/// Span field annotated with the drop reason when a batch is not queued.
pub const DROPPED_FIELD: &str = "write_back_dropped";

/// Maximum key/value pairs per queued batch.
pub const WRITE_BACK_BATCH: usize = 100;

#[derive(Debug)]
struct Batch {
    keys: Vec<String>,
    values: Vec<Vec<u8>>,
    bytes: usize,
}

impl Batch {
    fn new(keys: Vec<String>, values: Vec<Vec<u8>>) -> Self {
        let bytes = keys.iter().map(String::len).sum::<usize>()
            + values.iter().map(Vec::len).sum::<usize>();
        Self {
            keys,
            values,
            bytes,
        }
    }
}

/// Why a batch was not queued.
#[derive(Debug, Clone, Copy)]
enum DropReason {
    OverBudget,
    QueueFull,
    Stopped,
}

impl DropReason {
    fn as_str(&self) -> &'static str {
        match self {
            DropReason::OverBudget => "queue_bytes_exceeded",
            DropReason::QueueFull => "queue_full",
            DropReason::Stopped => "stopped",
        }
    }
}

// == Background Cache ==
/// Write-back decorator around any [`Cache`].
///
/// Fetches go straight to the wrapped cache, so a queued store is invisible
/// until a worker has forwarded it.
pub struct BackgroundCache {
    name: String,
    inner: Arc<dyn Cache>,
    queue: Mutex<Option<mpsc::Sender<Batch>>>,
    queued_bytes: Arc<AtomicUsize>,
    max_queued_bytes: usize,
    dropped_batches: AtomicU64,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundCache {
    // == Constructor ==
    /// Wraps `inner` and spawns `config.workers` forwarding tasks on the
    /// current runtime.
    pub fn new(name: impl Into<String>, config: &BackgroundConfig, inner: Arc<dyn Cache>) -> Self {
        let name = name.into();
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let queued_bytes = Arc::new(AtomicUsize::new(0));

        let workers = (0..config.workers.max(1))
            .map(|id| {
                spawn_worker(
                    id,
                    name.clone(),
                    rx.clone(),
                    inner.clone(),
                    queued_bytes.clone(),
                )
            })
            .collect();

        info!(
            cache = %name,
            workers = config.workers.max(1),
            queue_capacity = config.queue_capacity,
            max_queued_bytes = config.max_queued_bytes,
            "background write-back started"
        );

        Self {
            name,
            inner,
            queue: Mutex::new(Some(tx)),
            queued_bytes,
            max_queued_bytes: config.max_queued_bytes,
            dropped_batches: AtomicU64::new(0),
            workers: Mutex::new(workers),
        }
    }

    /// Batches dropped since construction.
    pub fn dropped_batches(&self) -> u64 {
        self.dropped_batches.load(Ordering::Relaxed)
    }

    /// Bytes currently queued or being forwarded.
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes.load(Ordering::Relaxed)
    }

    fn enqueue(&self, batch: Batch) {
        let bytes = batch.bytes;
        let total = self.queued_bytes.fetch_add(bytes, Ordering::AcqRel) + bytes;
        if total > self.max_queued_bytes {
            self.queued_bytes.fetch_sub(bytes, Ordering::AcqRel);
            self.dropped(&batch, DropReason::OverBudget);
            return;
        }

        let sent = match self.queue.lock().as_ref() {
            Some(tx) => tx.try_send(batch),
            None => Err(TrySendError::Closed(batch)),
        };

        match sent {
            Ok(()) => {
                gauge!("cache_background_queue_length", "name" => self.name.clone()).increment(1.0);
                gauge!("cache_background_queue_bytes", "name" => self.name.clone()).set(total as f64);
            }
            Err(TrySendError::Full(batch)) => {
                self.queued_bytes.fetch_sub(bytes, Ordering::AcqRel);
                self.dropped(&batch, DropReason::QueueFull);
            }
            Err(TrySendError::Closed(batch)) => {
                self.queued_bytes.fetch_sub(bytes, Ordering::AcqRel);
                self.dropped(&batch, DropReason::Stopped);
            }
        }
    }

    fn dropped(&self, batch: &Batch, reason: DropReason) {
        self.dropped_batches.fetch_add(1, Ordering::Relaxed);
        counter!("cache_background_dropped_writes_total", "name" => self.name.clone())
            .increment(batch.keys.len() as u64);
        counter!("cache_background_dropped_bytes_total", "name" => self.name.clone())
            .increment(batch.bytes as u64);
        // Ignored unless the caller's span declares the field
        Span::current().record(DROPPED_FIELD, reason.as_str());
        debug!(
            cache = %self.name,
            reason = reason.as_str(),
            keys = batch.keys.len(),
            bytes = batch.bytes,
            "write-back batch dropped"
        );
    }
}

fn spawn_worker(
    id: usize,
    name: String,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<Batch>>>,
    inner: Arc<dyn Cache>,
    queued_bytes: Arc<AtomicUsize>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let next = queue.lock().await.recv().await;
            let Some(batch) = next else {
                break;
            };
            gauge!("cache_background_queue_length", "name" => name.clone()).decrement(1.0);

            let bytes = batch.bytes;
            let keys = batch.keys.len();
            let ctx = RequestContext::background();
            if let Err(err) = inner.store(&ctx, batch.keys, batch.values).await {
                warn!(cache = %name, worker = id, keys, error = %err, "write-back failed, batch discarded");
            }

            let remaining = queued_bytes.fetch_sub(bytes, Ordering::AcqRel) - bytes;
            gauge!("cache_background_queue_bytes", "name" => name.clone()).set(remaining as f64);
        }
        debug!(cache = %name, worker = id, "write-back worker exited");
    })
}

#[async_trait]
impl Cache for BackgroundCache {
    async fn store(
        &self,
        _ctx: &RequestContext,
        keys: Vec<String>,
        values: Vec<Vec<u8>>,
    ) -> Result<()> {
        check_lengths(&keys, &values)?;

        let mut keys = keys.into_iter();
        let mut values = values.into_iter();
        loop {
            let batch_keys: Vec<String> = keys.by_ref().take(WRITE_BACK_BATCH).collect();
            if batch_keys.is_empty() {
                break;
            }
            let batch_values: Vec<Vec<u8>> = values.by_ref().take(batch_keys.len()).collect();
            self.enqueue(Batch::new(batch_keys, batch_values));
        }
        Ok(())
    }

    async fn fetch(&self, ctx: &RequestContext, keys: Vec<String>) -> Result<Fetched> {
        self.inner.fetch(ctx, keys).await
    }

    /// Closes the queue, waits for workers to drain it, then stops the
    /// wrapped cache.
    async fn stop(&self) {
        self.queue.lock().take();
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(err) = worker.await {
                warn!(cache = %self.name, error = %err, "write-back worker panicked");
            }
        }
        self.inner.stop().await;
    }

    fn cache_type(&self) -> CacheType {
        self.inner.cache_type()
    }
}
