//! Common logger configuration for all scribe binaries.

// Enforce disallowed methods clippy lint
#![deny(clippy::disallowed_methods)]

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{
    filter::Targets,
    layer::{Layer, SubscriberExt},
    util::{SubscriberInitExt, TryInitError},
};

/// Initialize a global `tracing` logger.
///
/// + The logger prints enabled `tracing` events and spans to stdout.
/// + `level` is the default max level, typically from a `--log-level` flag.
/// + A `RUST_LOG` env var takes precedence over `level` and supports full
///   per-module filtering. Read more about the syntax here:
///   <https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html>
///
/// Panics if a logger is already initialized. This will fail if used in
/// tests, since multiple test threads will compete to set the global logger.
pub fn init(level: Level) {
    try_init(level).expect("Failed to setup logger");
}

/// Use this to initialize the global logger in tests.
pub fn init_for_testing() {
    // Quickly skip logger setup if no env var set.
    if std::env::var_os("RUST_LOG").is_none() {
        return;
    }

    // Don't panic if there's already a logger setup. Multiple tests might try
    // setting the global logger.
    let _ = try_init(Level::INFO);
}

/// Try to initialize a global logger. Will return an `Err` if there is
/// another global logger already set.
pub fn try_init(level: Level) -> Result<(), TryInitError> {
    let targets_filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|rust_log| Targets::from_str(&rust_log).ok())
        .unwrap_or_else(|| Targets::new().with_default(level));

    let stdout_log = tracing_subscriber::fmt::layer()
        .compact()
        .with_level(true)
        .with_target(true)
        .with_ansi(true)
        .with_filter(targets_filter);

    tracing_subscriber::registry().with(stdout_log).try_init()
}
