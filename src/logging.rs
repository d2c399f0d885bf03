//! Environment-aware console logging using the tracing ecosystem.
//!
//! Console-only output, suitable for containerized deployments where logs
//! go to stdout/stderr. Log levels come from `RUST_LOG` (default `info`).

use std::io::IsTerminal;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(std::io::stdout().is_terminal())
        .try_init();
}
