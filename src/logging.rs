//! Development-time tracing for debugging the engine.
//!
//! This is diagnostic output only, gated by `RUST_LOG`, written to stderr.
//! It is not the durable record of a run — that's the `diagnostics` payload
//! a step persists through the [`crate::store::Store`] trait, always written
//! regardless of this module's filter.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing subscriber for development logging.
///
/// Reads `RUST_LOG` env var. Defaults to `warn` if unset.
/// Output: stderr, compact format.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
