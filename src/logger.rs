//! Logging setup for se3-layers binaries and benchmarks
//!
//! The library only emits `tracing` events: `debug` for layer construction
//! and shapes, `trace` inside per-example loops, `warn` for suspicious
//! configuration. Executables install a subscriber with the helpers below.

use tracing::{Level, debug};
use tracing_subscriber::EnvFilter;

/// Install the standard subscriber at INFO; `RUST_LOG` overrides the level.
///
/// ```no_run
/// se3_layers::init_logger();
/// tracing::info!("synthetic pass started");
/// ```
///
/// ```bash
/// RUST_LOG=se3_layers=trace cargo run --bin synthetic_pass
/// ```
pub fn init_logger() -> bool {
    init_logger_with_level(Level::INFO)
}

/// Install the subscriber with `default_level` for events that `RUST_LOG`
/// does not cover.
///
/// Returns `false` when a global subscriber is already set (a second bench
/// group, or a test harness that installed its own); the existing one stays
/// in place.
pub fn init_logger_with_level(default_level: Level) -> bool {
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    match tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .try_init()
    {
        Ok(()) => true,
        Err(err) => {
            debug!("keeping the existing tracing subscriber: {err}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_initialization_keeps_existing_subscriber() {
        init_logger_with_level(Level::WARN);
        assert!(!init_logger());
    }
}
