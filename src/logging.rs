//! Tracing setup for binaries and tests.

#![forbid(unsafe_code)]

use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global tracing subscriber, filtered by `LITHIC_LOG`
/// (falling back to `info`). Safe to call more than once; only the first
/// call installs.
pub fn init() {
    let filter = EnvFilter::try_from_env("LITHIC_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
