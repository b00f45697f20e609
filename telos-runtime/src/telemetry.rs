//! Tracing subscriber setup
//!
//! Installed once per process by the runtime; components only emit spans
//! and events, they never install subscribers.

use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install the global subscriber, honoring `TELOS_LOG` (falling back to
/// `RUST_LOG`, then `info`). Safe to call repeatedly; later calls are
/// no-ops, including when an outer harness already installed one.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env("TELOS_LOG")
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    });
}
