//! Error types for the cache layer
//!
//! Provides unified error handling using thiserror.

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for every cache layer.
///
/// Expected conditions (a miss, a full write-back queue, a single failing key)
/// are never reported through this type by the layer that observes them; they
/// are recorded and absorbed. Everything here is something a caller may want
/// to log or surface.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Invalid or contradictory configuration, rejected at construction
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// `store` was called with differently sized key and value slices
    #[error("Length mismatch: {keys} keys, {values} values")]
    LengthMismatch { keys: usize, values: usize },

    /// Socket level failure talking to a remote cache
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Remote operation exceeded its deadline
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Unexpected reply from a remote cache
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The circuit breaker for the address is open
    #[error("Circuit breaker open for {address}")]
    CircuitOpen { address: String },

    /// No remote servers are currently known
    #[error("No servers available")]
    NoServers,

    /// Error reported by the redis client
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Stored value could not be decompressed
    #[error("Decompression failed: {0}")]
    Decompress(String),

    /// Value exceeds the backend's item size limit
    #[error("Value too large: {size} bytes exceeds {limit}")]
    ValueTooLarge { size: usize, limit: usize },

    /// The cache has been stopped
    #[error("Cache stopped")]
    Stopped,
}

impl CacheError {
    /// Returns a short, stable label suitable for metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            CacheError::Config(_) => "config",
            CacheError::LengthMismatch { .. } => "length_mismatch",
            CacheError::Io(_) => "io",
            CacheError::Timeout(_) => "timeout",
            CacheError::Protocol(_) => "protocol",
            CacheError::CircuitOpen { .. } => "circuit_open",
            CacheError::NoServers => "no_servers",
            CacheError::Redis(_) => "redis",
            CacheError::Decompress(_) => "decompress",
            CacheError::ValueTooLarge { .. } => "too_big",
            CacheError::Stopped => "stopped",
        }
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache layer.
pub type Result<T> = std::result::Result<T, CacheError>;
