//! Logging setup.
//!
//! Engine log lines are emitted under the `vidbridge::engine` target, so
//! `RUST_LOG=vidbridge::engine=debug` shows the engine's own output.

use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Target used for lines forwarded from the engine.
pub const ENGINE_TARGET: &str = "vidbridge::engine";

/// Initialize tracing with the default `info` filter.
///
/// Panics if a global subscriber is already installed; see [`try_init`].
pub fn init() {
    init_with_filter("info");
}

/// Initialize tracing with a custom default filter. `RUST_LOG` takes
/// precedence when set.
pub fn init_with_filter(default_filter: &str) {
    registry(default_filter).init();
}

/// Like [`init_with_filter`], but returns `false` instead of panicking when a
/// subscriber is already installed (the host process may own logging).
pub fn try_init(default_filter: &str) -> bool {
    registry(default_filter).try_init().is_ok()
}

fn registry(default_filter: &str) -> impl SubscriberInitExt {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
}
