//! Server selection: maps a cache key to one remote address.

use parking_lot::RwLock;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{CacheError, Result};

/// Virtual nodes per server on the consistent hash ring.
const RING_POINTS_PER_SERVER: usize = 160;

/// Chooses which server owns a key.
///
/// The mapping must be a pure function of the key and the current server
/// set, so that every client instance agrees on it.
pub trait ServerSelector: Send + Sync {
    /// Replaces the server set; `servers` is sorted and deduplicated.
    fn set_servers(&self, servers: Vec<String>);

    fn pick_server(&self, key: &str) -> Result<String>;

    fn servers(&self) -> Vec<String>;
}

// == Server List ==
/// Hash-modulo selection. Any membership change remaps most keys.
#[derive(Debug, Default)]
pub struct ServerList {
    servers: RwLock<Vec<String>>,
}

impl ServerList {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ServerSelector for ServerList {
    fn set_servers(&self, servers: Vec<String>) {
        *self.servers.write() = servers;
    }

    fn pick_server(&self, key: &str) -> Result<String> {
        let servers = self.servers.read();
        match servers.len() {
            0 => Err(CacheError::NoServers),
            1 => Ok(servers[0].clone()),
            n => Ok(servers[(xxh3_64(key.as_bytes()) % n as u64) as usize].clone()),
        }
    }

    fn servers(&self) -> Vec<String> {
        self.servers.read().clone()
    }
}

// == Consistent Hash Ring ==
#[derive(Debug, Default)]
struct Ring {
    servers: Vec<String>,
    /// (point, index into servers), sorted by point
    points: Vec<(u64, usize)>,
}

/// Consistent hashing over virtual nodes; a membership change only remaps
/// the keys owned by the added or removed server.
#[derive(Debug, Default)]
pub struct ConsistentHashRing {
    ring: RwLock<Ring>,
}

impl ConsistentHashRing {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ServerSelector for ConsistentHashRing {
    fn set_servers(&self, servers: Vec<String>) {
        let mut points = Vec::with_capacity(servers.len() * RING_POINTS_PER_SERVER);
        for (idx, server) in servers.iter().enumerate() {
            for vnode in 0..RING_POINTS_PER_SERVER {
                let point = xxh3_64(format!("{server}-{vnode}").as_bytes());
                points.push((point, idx));
            }
        }
        points.sort_unstable();
        *self.ring.write() = Ring { servers, points };
    }

    fn pick_server(&self, key: &str) -> Result<String> {
        let ring = self.ring.read();
        if ring.points.is_empty() {
            return Err(CacheError::NoServers);
        }
        let hash = xxh3_64(key.as_bytes());
        let pos = ring.points.partition_point(|(point, _)| *point < hash);
        let (_, idx) = ring.points[pos % ring.points.len()];
        Ok(ring.servers[idx].clone())
    }

    fn servers(&self) -> Vec<String> {
        self.ring.read().servers.clone()
    }
}
