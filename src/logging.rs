//! Tracing subscriber setup for binaries and tests embedding the cache.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs a global subscriber: `RUST_LOG` when set, otherwise
/// `default_directive` (for example `"tiercache=info"`).
///
/// Returns `false` if a global subscriber was already installed, which makes
/// it safe to call from every test.
pub fn init_tracing(default_directive: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_tracing("tiercache=debug");
        assert!(!init_tracing("tiercache=debug"));
    }
}
