//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::config::WorkerConfig;

/// Build the log filter: `RUST_LOG` wins, otherwise the configured level.
pub fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Install the global tracing subscriber.
///
/// With telemetry enabled, events are emitted as JSON lines (one object per
/// event, span fields included) for a log collector to pick up.
pub fn init(config: &WorkerConfig) {
    let filter = env_filter(&config.log_level);

    let result = if config.telemetry_enabled {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
    };

    if let Err(e) = result {
        eprintln!("Tracing subscriber already installed: {e}");
    }
}
