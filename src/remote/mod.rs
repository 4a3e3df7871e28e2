//! Remote Cache Module
//!
//! Network backed tiers and their plumbing.
//!
//! # Components
//! - memcached: batched client over the ASCII protocol
//! - redis: single node or cluster client
//! - breaker: per-address circuit breakers for dialing
//! - selector / resolver: key to server mapping and server discovery

pub mod breaker;
pub mod memcached;
pub mod redis;
pub mod resolver;
pub mod selector;

pub use breaker::{Breakers, CircuitBreaker, CircuitState};
pub use memcached::{MemcachedCache, MemcachedClient, TextProtocolClient};
pub use self::redis::{partition_replies, RedisCache};
pub use resolver::{AddressResolver, DnsResolver, StaticResolver};
pub use selector::{ConsistentHashRing, ServerList, ServerSelector};
