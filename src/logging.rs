//! Logging Initialization
//!
//! Builds the `tracing` subscriber from [`LoggingConfig`]. Lives in the
//! library because histree ships no binary; the embedding service calls
//! this once at startup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Initialize logging
///
/// `RUST_LOG` takes precedence over the configured level. Safe to call
/// only once per process; subsequent calls return an error from the
/// subscriber registry.
pub fn init_logging(config: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.level.clone().into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
