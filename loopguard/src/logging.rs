//! Diagnostic tracing.
//!
//! Hooks share stdout and stderr with the host, so hook invocations log to
//! `.loopguard/logs/loopguard.log` instead. Operator commands log to stderr.
//! The decision record lives in the store's event log, not here.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`, defaulting to `warn`. With `log_file`, output is appended
/// to that file without ANSI colors; if it cannot be opened, logging is
/// silently disabled rather than spilling into the host's streams.
///
/// # Example
/// ```bash
/// RUST_LOG=loopguard=debug loopguard session status
/// ```
pub fn init(log_file: Option<&Path>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let registry = tracing_subscriber::registry().with(filter);

    match log_file {
        Some(path) => {
            let file = path
                .parent()
                .map_or(Ok(()), fs::create_dir_all)
                .and_then(|()| OpenOptions::new().create(true).append(true).open(path));
            if let Ok(file) = file {
                let _ = registry
                    .with(fmt::layer().with_writer(Mutex::new(file)).with_ansi(false))
                    .try_init();
            }
        }
        None => {
            let _ = registry
                .with(fmt::layer().with_writer(std::io::stderr).compact())
                .try_init();
        }
    }
}
