//! Logging setup.
//!
//! The engine only emits `tracing` events; installing a subscriber is left to
//! the host. [`init_logging`] is a convenience for hosts and tests that want
//! the usual `RUST_LOG`-driven formatter.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_LOG_FILTER: &str = "info,visionflow=debug";

/// Install a global subscriber with an env filter and a fmt layer.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_logging(default_filter: &str) -> bool {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
