//! Development-time tracing for debugging runs.
//!
//! Tracing goes to stderr and is never part of the run record. The JSONL
//! streams written by `io::run_log` are the product artifacts and ignore
//! `RUST_LOG` entirely.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Target for lines the sandbox interpreter writes to its stderr.
pub const PYTHON_TARGET: &str = "distill::python";

const DEFAULT_FILTER: &str = "warn";

/// Install the global subscriber, filtered by `RUST_LOG`.
///
/// Useful filters:
/// ```bash
/// RUST_LOG=distill=debug distill ask ...                  # controller, delegation, transport
/// RUST_LOG=warn,distill::python=debug distill ask ...     # interpreter stderr only
/// RUST_LOG=distill=debug,distill::python=off distill ask ...
/// ```
pub fn init() {
    let raw = std::env::var("RUST_LOG").ok();
    tracing_subscriber::registry()
        .with(env_filter(raw.as_deref()))
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

/// Filter from a `RUST_LOG`-style string. Unset, blank or unparsable values fall
/// back to `warn`.
fn env_filter(raw: Option<&str>) -> EnvFilter {
    raw.map(str::trim)
        .filter(|raw| !raw.is_empty())
        .and_then(|raw| EnvFilter::try_new(raw).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}
