//! Default `tracing` subscriber setup.
//!
//! Hosts that install their own global subscriber need none of this.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the filter directives, e.g. `pybridge=debug`
pub const LOG_ENV: &str = "PYBRIDGE_LOG";

fn filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install a plain-text subscriber. Returns `false` if one was already set.
pub fn init() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_target(false)
        .try_init()
        .is_ok()
}

/// Install a JSON subscriber. Returns `false` if one was already set.
pub fn init_json() -> bool {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter())
        .try_init()
        .is_ok()
}
