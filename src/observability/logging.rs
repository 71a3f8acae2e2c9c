//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the `tracing` subscriber once at startup
//! - Take the filter from `RUST_LOG`, falling back to the configured level
//!
//! Capture lines are ordinary `tracing` events with target `capture`, so
//! `RUST_LOG=capture=off` silences them without touching forwarding.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

/// Default filter directive for a configured log level.
pub fn default_directive(config: &ObservabilityConfig) -> String {
    format!(
        "observing_proxy={level},capture={level},tower_http={level}",
        level = config.log_level
    )
}

/// Install the global subscriber.
pub fn init(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(config)));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
