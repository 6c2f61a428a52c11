//! Console logging via `tracing`.
//!
//! Level defaults to `info` and is overridable through `RUST_LOG`, e.g.
//! `RUST_LOG=miway_tracker=debug` to see every poll and skipped tick.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_FILTER: &str = "info,actix_web=warn";

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let console_layer = tracing_subscriber::fmt::layer().with_target(true).compact();

    // A second init (tests, embedding) keeps the first subscriber
    if tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .try_init()
        .is_err()
    {
        tracing::debug!("Logging already initialised");
    }
}
