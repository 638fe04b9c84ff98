//! Logger configuration for `enclave-trust` binaries and tests.
//!
//! Library crates only emit `tracing` events; a binary picks a subscriber
//! once at startup with [`init`].

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{
    filter::Targets,
    layer::{Layer, SubscriberExt},
    util::{SubscriberInitExt, TryInitError},
};

/// Initialize a global `tracing` logger which prints to stdout.
///
/// + The default level is INFO.
/// + Override the level or per-module filtering with `RUST_LOG`, using the
///   [`Targets`] syntax, e.g. `RUST_LOG=enclave_trust=debug,info`.
///
/// Panics if a global logger is already set.
pub fn init() {
    init_with_default(Level::INFO);
}

/// Like [`init`], but with a custom level used when `RUST_LOG` is unset.
pub fn init_with_default(default_level: Level) {
    try_init_with_default(default_level).expect("Failed to setup logger");
}

/// Initialize the global logger from a test. Does nothing unless `RUST_LOG`
/// is set, and tolerates other tests having already set a logger.
pub fn init_for_testing() {
    if std::env::var_os("RUST_LOG").is_none() {
        return;
    }
    let _ = try_init();
}

/// Try to initialize a global logger. Returns an `Err` if another global
/// logger is already set.
pub fn try_init() -> Result<(), TryInitError> {
    try_init_with_default(Level::INFO)
}

fn try_init_with_default(default_level: Level) -> Result<(), TryInitError> {
    // Fall back to the default level if `RUST_LOG` is unset or doesn't parse.
    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|rust_log| Targets::from_str(&rust_log).ok())
        .unwrap_or_else(|| Targets::new().with_default(default_level));

    let stdout_log = tracing_subscriber::fmt::layer()
        .compact()
        .with_level(true)
        .with_target(true)
        .with_ansi(true)
        .with_filter(filter);

    tracing_subscriber::registry().with(stdout_log).try_init()
}

#[cfg(test)]
mod test {
    #[test]
    fn test_init_for_testing_is_idempotent() {
        super::init_for_testing();
        super::init_for_testing();
        tracing::info!("logger initialized twice without panicking");
    }
}
