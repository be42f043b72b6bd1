//! Tracing setup for the `homework` binary.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted.
//!
//! - **Run events (`io/store`)**: the durable audit trail of every run, always
//!   written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "warn,homework=info";

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; defaults to [`DEFAULT_FILTER`]. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=homework=debug cargo run -- work --until-idle
/// ```
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
