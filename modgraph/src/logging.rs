//! Tracing setup for the `modgraph` binary.
//!
//! Library code only emits `tracing` events; installing a subscriber is left
//! to the binary (or to an embedding application).

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`, defaulting to `warn`. Output goes to stderr in compact
/// format so stdout stays reserved for command output.
///
/// # Example
/// ```bash
/// RUST_LOG=modgraph=debug modgraph list graph.json
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    // A subscriber may already be installed by an embedding application.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
