//! Tracing subscriber setup
//!
//! Harness events use `strata::oom::*` targets. `RUST_LOG` overrides the
//! default filter.

use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "strata=info";

/// Install a stderr fmt subscriber with the default filter
///
/// Returns `false` if a global subscriber was already installed; calling this
/// more than once is harmless.
pub fn init() -> bool {
    init_with_filter(DEFAULT_FILTER)
}

/// Install a stderr fmt subscriber, falling back to `default_filter`
pub fn init_with_filter(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}
