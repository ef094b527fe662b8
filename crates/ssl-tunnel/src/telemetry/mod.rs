//! Telemetry initialisation: structured JSON logs on stdout.
//!
//! `RUST_LOG`, when set, takes precedence over the configured level.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Initialise the global tracing subscriber.
///
/// # Errors
///
/// Returns an error if a subscriber has already been set.
pub fn init(log_level: &str) -> Result<()> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter(log_level))
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialise tracing subscriber: {e}"))
}

fn filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level))
}
