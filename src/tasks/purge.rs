//! TTL Purge Task
//!
//! Background task that periodically removes expired cache entries.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Something holding entries that can expire.
pub trait Purgeable: Send + Sync + 'static {
    /// Removes expired entries, returning how many were removed.
    fn purge_expired(&self) -> usize;

    fn name(&self) -> &str;
}

/// Spawns a task that calls [`Purgeable::purge_expired`] every `interval`.
///
/// The task exits when `stop` flips to `true` or its sender is dropped. The
/// first purge happens one full interval after spawning.
///
/// # Example
/// ```ignore
/// let (stop_tx, stop_rx) = watch::channel(false);
/// let handle = spawn_purge_task(target, Duration::from_secs(60), stop_rx);
/// // Later, during shutdown:
/// stop_tx.send(true).ok();
/// ```
pub fn spawn_purge_task<P: Purgeable>(
    target: Arc<P>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            cache = %target.name(),
            interval_ms = interval.as_millis() as u64,
            "Starting TTL purge task"
        );

        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let removed = target.purge_expired();
            if removed > 0 {
                info!(cache = %target.name(), removed, "TTL purge removed expired entries");
            } else {
                debug!(cache = %target.name(), "TTL purge found no expired entries");
            }
        }

        debug!(cache = %target.name(), "TTL purge task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
    }

    impl Purgeable for Counting {
        fn purge_expired(&self) -> usize {
            self.calls.fetch_add(1, Ordering::SeqCst);
            1
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    #[tokio::test]
    async fn test_purge_task_ticks() {
        let target = Arc::new(Counting {
            calls: AtomicUsize::new(0),
        });
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = spawn_purge_task(target.clone(), Duration::from_millis(20), stop_rx);

        tokio::time::sleep(Duration::from_millis(110)).await;
        assert!(target.calls.load(Ordering::SeqCst) >= 2);

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_purge_task_stops_when_sender_dropped() {
        let target = Arc::new(Counting {
            calls: AtomicUsize::new(0),
        });
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = spawn_purge_task(target, Duration::from_secs(3600), stop_rx);

        drop(stop_tx);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("task should exit")
            .unwrap();
    }
}
