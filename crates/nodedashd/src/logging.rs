//! Tracing setup for the daemon binary.

use tracing_subscriber::EnvFilter;

/// `RUST_LOG` wins over the configured level
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
