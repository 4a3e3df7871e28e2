//! Memcached remote tier.
//!
//! [`MemcachedCache`] adapts a [`MemcachedClient`] to the [`Cache`] capability
//! with batched, order-preserving fetches. [`TextProtocolClient`] is the
//! network client: ASCII protocol, pooled connections per server, breaker
//! guarded dialing and a periodically refreshed server list.
//!
//! [`Cache`]: crate::cache::Cache

mod batched;
mod client;
mod protocol;

pub use batched::MemcachedCache;
pub use client::{MemcachedClient, TextProtocolClient};
pub use protocol::{is_valid_key, Connection, MAX_KEY_LENGTH, MAX_VALUE_LENGTH};
