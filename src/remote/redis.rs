//! Redis remote tier, single node or cluster.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::{Cmd, FromRedisValue, Pipeline};
use tracing::{debug, info, warn};

use crate::cache::{check_lengths, Cache, CacheType, Fetched};
use crate::config::RedisConfig;
use crate::context::RequestContext;
use crate::error::{CacheError, Result};

#[derive(Clone)]
enum Connection {
    Single(ConnectionManager),
    Cluster(ClusterConnection),
}

/// Splits an `MGET`/`GET` reply list into found and missing keys.
pub fn partition_replies(keys: Vec<String>, replies: Vec<Option<Vec<u8>>>) -> Result<Fetched> {
    if keys.len() != replies.len() {
        return Err(CacheError::Protocol(format!(
            "expected {} replies, got {}",
            keys.len(),
            replies.len()
        )));
    }
    let mut fetched = Fetched::default();
    for (key, reply) in keys.into_iter().zip(replies) {
        match reply {
            Some(value) => {
                fetched.found.push(key);
                fetched.values.push(value);
            }
            None => fetched.missing.push(key),
        }
    }
    Ok(fetched)
}

// == Redis Cache ==
/// [`Cache`] backed by redis.
///
/// Single node: fetches are one `MGET` and stores one atomic pipeline of
/// `SET`s. Cluster: keys may live on different slots, so both go key by key.
pub struct RedisCache {
    name: String,
    cache_type: CacheType,
    conn: Connection,
    timeout: Duration,
    expiration: Duration,
    stopped: AtomicBool,
}

impl RedisCache {
    pub async fn connect(
        name: impl Into<String>,
        cache_type: CacheType,
        config: &RedisConfig,
    ) -> Result<Self> {
        let name = name.into();
        let conn = match (config.cluster, config.endpoints.as_slice()) {
            (_, []) => {
                return Err(CacheError::Config("redis requires at least one endpoint".into()))
            }
            (false, [endpoint]) => {
                let client = redis::Client::open(endpoint.as_str())?;
                Connection::Single(ConnectionManager::new(client).await?)
            }
            (false, _) => {
                return Err(CacheError::Config(
                    "multiple redis endpoints require cluster mode".into(),
                ))
            }
            (true, endpoints) => {
                let client = ClusterClient::new(endpoints.to_vec())?;
                Connection::Cluster(client.get_async_connection().await?)
            }
        };

        info!(
            cache = %name,
            endpoints = config.endpoints.len(),
            cluster = config.cluster,
            "redis cache connected"
        );

        Ok(Self {
            name,
            cache_type,
            conn,
            timeout: config.timeout,
            expiration: config.expiration,
            stopped: AtomicBool::new(false),
        })
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(CacheError::Stopped);
        }
        Ok(())
    }

    async fn deadline<T>(
        &self,
        what: &str,
        fut: impl std::future::Future<Output = redis::RedisResult<T>>,
    ) -> Result<T> {
        if self.timeout.is_zero() {
            return Ok(fut.await?);
        }
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(CacheError::Timeout(format!("redis {what}"))),
        }
    }

    async fn query<T: FromRedisValue>(&self, what: &str, cmd: &Cmd) -> Result<T> {
        match self.conn.clone() {
            Connection::Single(mut conn) => self.deadline(what, cmd.query_async(&mut conn)).await,
            Connection::Cluster(mut conn) => self.deadline(what, cmd.query_async(&mut conn)).await,
        }
    }

    async fn run_pipeline(&self, what: &str, pipe: &Pipeline) -> Result<()> {
        let _: () = match self.conn.clone() {
            Connection::Single(mut conn) => self.deadline(what, pipe.query_async(&mut conn)).await?,
            Connection::Cluster(mut conn) => self.deadline(what, pipe.query_async(&mut conn)).await?,
        };
        Ok(())
    }

    fn set_command(&self, key: &str, value: &[u8]) -> Cmd {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if !self.expiration.is_zero() {
            cmd.arg("EX").arg(self.expiration.as_secs().max(1));
        }
        cmd
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn store(
        &self,
        _ctx: &RequestContext,
        keys: Vec<String>,
        values: Vec<Vec<u8>>,
    ) -> Result<()> {
        check_lengths(&keys, &values)?;
        self.ensure_running()?;
        if keys.is_empty() {
            return Ok(());
        }

        if let Connection::Cluster(_) = self.conn {
            let mut last_err = None;
            for (key, value) in keys.iter().zip(&values) {
                let result: Result<()> = self.query("set", &self.set_command(key, value)).await;
                if let Err(err) = result {
                    warn!(cache = %self.name, key = %key, error = %err, "redis set failed");
                    last_err = Some(err);
                }
            }
            return last_err.map_or(Ok(()), Err);
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in keys.iter().zip(&values) {
            pipe.add_command(self.set_command(key, value)).ignore();
        }
        self.run_pipeline("multi set", &pipe).await
    }

    async fn fetch(&self, _ctx: &RequestContext, keys: Vec<String>) -> Result<Fetched> {
        self.ensure_running()?;
        if keys.is_empty() {
            return Ok(Fetched::default());
        }

        let replies: Vec<Option<Vec<u8>>> = match self.conn {
            Connection::Single(_) => {
                let mut cmd = redis::cmd("MGET");
                cmd.arg(&keys);
                self.query("mget", &cmd).await?
            }
            Connection::Cluster(_) => {
                let mut replies = Vec::with_capacity(keys.len());
                for key in &keys {
                    let mut cmd = redis::cmd("GET");
                    cmd.arg(key);
                    replies.push(self.query("get", &cmd).await?);
                }
                replies
            }
        };
        partition_replies(keys, replies)
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        debug!(cache = %self.name, "redis cache stopped");
    }

    fn cache_type(&self) -> CacheType {
        self.cache_type
    }
}
