//! Tracing setup for hosts and tests.
//!
//! The crate only emits `tracing` events; this helper wires up a console
//! subscriber for binaries and tests that want to see them.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Initializes a console subscriber at `default_level`, honoring
/// `RUST_LOG` when set.
///
/// Safe to call more than once; later calls leave the first subscriber in
/// place.
pub fn init_tracing(default_level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
