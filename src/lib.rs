//! Tiercache - a multi-tier byte cache
//!
//! An embedded LRU/TTL cache, memcached and redis remote tiers, background
//! write-back and a set of composable decorators, all behind one async
//! [`Cache`] capability.
//!
//! Use [`new_cache`] to assemble a stack from a [`Config`].

pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod remote;
pub mod tasks;

pub use cache::{is_empty_tiered, new_cache, Cache, CacheType, Fetched};
pub use config::Config;
pub use context::{RequestContext, RequestStats};
pub use error::{CacheError, Result};
