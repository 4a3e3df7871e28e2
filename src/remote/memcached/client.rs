//! Memcached client: server selection, pooled connections, breaker-guarded
//! dialing and periodic server-list refresh.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::protocol::{expiration, Connection};
use crate::config::MemcachedConfig;
use crate::error::{CacheError, Result};
use crate::remote::breaker::Breakers;
use crate::remote::resolver::{normalize, AddressResolver};
use crate::remote::selector::{ConsistentHashRing, ServerList, ServerSelector};
use crate::tasks::{spawn_refresh_task, Refreshable};

/// Multi-get / set access to a memcached fleet.
#[async_trait]
pub trait MemcachedClient: Send + Sync {
    /// Values for the keys that were found; absent keys are misses.
    async fn get_multi(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>>;

    async fn set(&self, key: &str, value: &[u8], validity: Duration) -> Result<()>;

    async fn stop(&self);
}

/// Runs `fut` under `limit`; a zero limit waits indefinitely.
async fn with_timeout<T>(
    limit: Duration,
    what: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    if limit.is_zero() {
        return fut.await;
    }
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| CacheError::Timeout(what.to_string()))?
}

struct ClientInner {
    name: String,
    config: MemcachedConfig,
    resolver: Arc<dyn AddressResolver>,
    selector: Box<dyn ServerSelector>,
    breakers: Breakers,
    idle: Mutex<HashMap<String, Vec<Connection>>>,
}

impl ClientInner {
    async fn checkout(&self, address: &str) -> Result<Connection> {
        let pooled = self.idle.lock().get_mut(address).and_then(Vec::pop);
        match pooled {
            Some(conn) => Ok(conn),
            None => self.dial(address).await,
        }
    }

    fn checkin(&self, conn: Connection) {
        let mut idle = self.idle.lock();
        let pool = idle.entry(conn.address().to_string()).or_default();
        if pool.len() < self.config.max_idle_conns {
            pool.push(conn);
        }
    }

    async fn dial(&self, address: &str) -> Result<Connection> {
        let connect = || {
            with_timeout(self.config.timeout, "dial", async {
                let stream = TcpStream::connect(address).await?;
                stream.set_nodelay(true)?;
                Ok::<_, CacheError>(
                    Connection::new(stream, address)
                        .with_max_value_len(self.config.max_item_size),
                )
            })
        };
        let result = match self.breakers.get(address) {
            Some(breaker) => breaker.call(connect).await,
            None => connect().await,
        };
        if let Err(err) = &result {
            debug!(client = %self.name, address = %address, error = %err, "memcached dial failed");
        }
        result
    }

    async fn get_from(
        &self,
        address: String,
        keys: Vec<String>,
    ) -> Result<HashMap<String, Vec<u8>>> {
        let mut conn = self.checkout(&address).await?;
        let values = with_timeout(self.config.timeout, "get", conn.get_multi(&keys)).await?;
        self.checkin(conn);
        Ok(values)
    }

    /// Groups keys by owning server.
    fn partition(&self, keys: &[String]) -> Result<HashMap<String, Vec<String>>> {
        let mut by_server: HashMap<String, Vec<String>> = HashMap::new();
        for key in keys {
            let server = self.selector.pick_server(key)?;
            by_server.entry(server).or_default().push(key.clone());
        }
        Ok(by_server)
    }
}

#[async_trait]
impl Refreshable for ClientInner {
    async fn refresh(&self) {
        let resolved = match self.resolver.resolve(&self.config.addresses).await {
            Ok(resolved) => normalize(resolved),
            Err(err) => {
                warn!(client = %self.name, error = %err, "server list refresh failed, keeping previous list");
                return;
            }
        };
        if resolved.is_empty() {
            warn!(client = %self.name, "server list refresh returned no servers, keeping previous list");
            return;
        }

        if resolved != self.selector.servers() {
            info!(client = %self.name, servers = resolved.len(), "memcached server list updated");
        }
        self.breakers.retain(&resolved);
        self.idle.lock().retain(|address, _| resolved.contains(address));
        gauge!("cache_memcached_servers", "name" => self.name.clone()).set(resolved.len() as f64);
        self.selector.set_servers(resolved);
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// == Text Protocol Client ==
/// [`MemcachedClient`] speaking the ASCII protocol to a set of servers.
///
/// Must be stopped to end its refresh task.
pub struct TextProtocolClient {
    inner: Arc<ClientInner>,
    stop_tx: watch::Sender<bool>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl TextProtocolClient {
    /// Resolves the configured addresses once, then refreshes them every
    /// `update_interval` in the background.
    pub async fn connect(
        name: impl Into<String>,
        config: MemcachedConfig,
        resolver: Arc<dyn AddressResolver>,
    ) -> Result<Self> {
        if config.addresses.is_empty() {
            return Err(CacheError::Config("memcached requires at least one address".into()));
        }

        let selector: Box<dyn ServerSelector> = if config.consistent_hash {
            Box::new(ConsistentHashRing::new())
        } else {
            Box::new(ServerList::new())
        };
        let inner = Arc::new(ClientInner {
            name: name.into(),
            breakers: Breakers::new(config.breaker.clone()),
            config,
            resolver,
            selector,
            idle: Mutex::new(HashMap::new()),
        });

        inner.refresh().await;

        let (stop_tx, stop_rx) = watch::channel(false);
        let refresh_task = (!inner.config.update_interval.is_zero())
            .then(|| spawn_refresh_task(inner.clone(), inner.config.update_interval, stop_rx));

        info!(
            client = %inner.name,
            servers = inner.selector.servers().len(),
            consistent_hash = inner.config.consistent_hash,
            "memcached client started"
        );

        Ok(Self {
            inner,
            stop_tx,
            refresh_task: Mutex::new(refresh_task),
        })
    }

    pub fn servers(&self) -> Vec<String> {
        self.inner.selector.servers()
    }

    /// Re-resolves the server list now.
    pub async fn refresh(&self) {
        self.inner.refresh().await;
    }
}

#[async_trait]
impl MemcachedClient for TextProtocolClient {
    async fn get_multi(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>> {
        let mut by_server = self.inner.partition(keys)?;

        // Common case: everything lives on one server
        if by_server.len() == 1 {
            if let Some((address, keys)) = by_server.drain().next() {
                return self.inner.get_from(address, keys).await;
            }
        }

        let mut requests = JoinSet::new();
        for (address, keys) in by_server {
            let inner = self.inner.clone();
            requests.spawn(async move { inner.get_from(address, keys).await });
        }

        let mut values = HashMap::with_capacity(keys.len());
        let mut last_err = None;
        while let Some(joined) = requests.join_next().await {
            match joined {
                Ok(Ok(found)) => values.extend(found),
                Ok(Err(err)) => last_err = Some(err),
                Err(err) => last_err = Some(CacheError::Protocol(format!("get task failed: {err}"))),
            }
        }
        match last_err {
            Some(err) => Err(err),
            None => Ok(values),
        }
    }

    async fn set(&self, key: &str, value: &[u8], validity: Duration) -> Result<()> {
        let limit = self.inner.config.max_item_size;
        if limit > 0 && value.len() > limit {
            counter!("cache_memcached_skipped_total", "name" => self.inner.name.clone(), "reason" => "too_big")
                .increment(1);
            return Err(CacheError::ValueTooLarge {
                size: value.len(),
                limit,
            });
        }

        let address = self.inner.selector.pick_server(key)?;
        let mut conn = self.inner.checkout(&address).await?;
        with_timeout(
            self.inner.config.timeout,
            "set",
            conn.set(key, value, expiration(validity)),
        )
        .await?;
        self.inner.checkin(conn);
        Ok(())
    }

    async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let task = self.refresh_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.inner.idle.lock().clear();
        debug!(client = %self.inner.name, "memcached client stopped");
    }
}
