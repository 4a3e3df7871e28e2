//! Address resolution for remote cache servers.

use async_trait::async_trait;
use tokio::net::lookup_host;
use tracing::warn;

use crate::error::{CacheError, Result};

/// Turns configured addresses into concrete `ip:port` server addresses.
///
/// Implementations may return duplicates or any order; callers sort and
/// deduplicate.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn resolve(&self, addresses: &[String]) -> Result<Vec<String>>;
}

/// Uses the configured addresses as-is.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticResolver;

#[async_trait]
impl AddressResolver for StaticResolver {
    async fn resolve(&self, addresses: &[String]) -> Result<Vec<String>> {
        Ok(addresses.to_vec())
    }
}

/// Resolves each `host:port` through the system resolver; every returned
/// address becomes a server.
///
/// Addresses that fail to resolve are skipped; resolution fails only when
/// nothing resolves.
#[derive(Debug, Default, Clone, Copy)]
pub struct DnsResolver;

#[async_trait]
impl AddressResolver for DnsResolver {
    async fn resolve(&self, addresses: &[String]) -> Result<Vec<String>> {
        let mut resolved = Vec::new();
        let mut last_err = None;

        for address in addresses {
            match lookup_host(address.as_str()).await {
                Ok(addrs) => resolved.extend(addrs.map(|a| a.to_string())),
                Err(err) => {
                    warn!(address = %address, error = %err, "failed to resolve cache server");
                    last_err = Some(err);
                }
            }
        }

        match (resolved.is_empty(), last_err) {
            (true, Some(err)) => Err(CacheError::Io(err)),
            _ => Ok(resolved),
        }
    }
}

/// Sorts and deduplicates a resolved server list so every client derives the
/// same key mapping.
pub fn normalize(mut servers: Vec<String>) -> Vec<String> {
    servers.sort();
    servers.dedup();
    servers
}
