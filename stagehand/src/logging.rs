//! Development-time tracing for debugging pipeline runs.
//!
//! Tracing output goes to stderr and is controlled by `RUST_LOG`; it is dev
//! diagnostics, not part of the product output. Pipeline progress intended
//! for operators flows through the event sink instead (`core::events`).

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing subscriber for development logging.
///
/// Reads `RUST_LOG` env var. Defaults to `warn` if unset.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=stagehand=debug cargo run -- run --pipeline pipeline.toml
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
