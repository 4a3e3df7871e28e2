//! Background Tasks Module
//!
//! Long-running tasks owned by cache layers and stopped with them.
//!
//! # Tasks
//! - TTL purge: removes expired embedded cache entries at a fixed interval
//! - Server refresh: re-resolves remote cache addresses at a fixed interval

mod purge;
mod refresh;

pub use purge::{spawn_purge_task, Purgeable};
pub use refresh::{spawn_refresh_task, Refreshable};
