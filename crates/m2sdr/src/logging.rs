//! Logging initialization.
//!
//! Library code only emits `tracing` events; nothing is initialized
//! implicitly. Binaries and tests that want output call [`init`] once.

use tracing_subscriber::EnvFilter;

/// Initializes the process-wide subscriber: compact stderr output, level
/// from `RUST_LOG` with `level` as the fallback. Calling it twice is
/// harmless; the second call is ignored.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}
