//! Log output for the binary and tests
//!
//! The library only emits `tracing` events. Planner passes and per-batch
//! executor calls log at `debug`; request lifecycle at `info`; failed steps
//! at `warn`.

use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding the filter directives
pub const FILTER_ENV: &str = "RUST_LOG";

const DEFAULT_FILTER: &str = "info";

/// Install a global subscriber writing to stderr
///
/// Directives come from `RUST_LOG`, defaulting to `info`. A subscriber that
/// is already installed is left in place.
pub fn init(json: bool) {
    let filter = EnvFilter::try_from_env(FILTER_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = fmt().with_env_filter(filter).with_writer(std::io::stderr).with_target(false);
    // try_init fails only when a subscriber is already set
    let installed = if json { builder.json().try_init() } else { builder.try_init() };
    installed.ok();
}

/// Subscriber for tests, capturing output per test
pub fn init_for_tests() {
    fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init()
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_harmless() {
        init_for_tests();
        init(false);
        init(true);
        tracing::info!("still logging");
    }
}
