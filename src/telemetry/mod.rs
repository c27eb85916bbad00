//! Tracing setup for binaries and tests.
//!
//! Library code only emits through the `tracing` macros; wiring a
//! subscriber is the embedding process's choice. [`init`] installs a
//! sensible default: compact fmt output filtered by `RUST_LOG` (falling
//! back to `info`).

use tracing_subscriber::EnvFilter;

/// Install the default subscriber for this process.
///
/// Safe to call more than once; only the first call wins. Returns whether
/// this call installed the subscriber.
pub fn init() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .try_init()
        .is_ok()
}
