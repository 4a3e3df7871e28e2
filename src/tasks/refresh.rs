//! Server Refresh Task
//!
//! Background task that periodically re-resolves remote cache servers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Something whose server membership is refreshed on a timer.
#[async_trait]
pub trait Refreshable: Send + Sync + 'static {
    async fn refresh(&self);

    fn name(&self) -> &str;
}

/// Spawns a task calling [`Refreshable::refresh`] every `interval` until
/// `stop` flips to `true` or its sender is dropped.
pub fn spawn_refresh_task<R: Refreshable>(
    target: Arc<R>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => target.refresh().await,
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        debug!(client = %target.name(), "server refresh task stopped");
    })
}
