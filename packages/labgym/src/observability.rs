// packages/labgym/src/observability.rs
//! Logging and metrics
//!
//! Logs go to stderr so they never interleave with anything an engine
//! prints on stdout. Metrics are recorded through the `metrics` facade; the
//! library installs no exporter, so they are free until the embedding
//! application installs a recorder.

use crate::utils::config::LoggingConfig;
use crate::utils::errors::{EngineError, Result};
use tracing_subscriber::EnvFilter;

pub const METRIC_WORKERS_LAUNCHED: &str = "labgym_workers_launched_total";
pub const METRIC_CONSTRUCTION_FAILURES: &str = "labgym_construction_failures_total";
pub const METRIC_REMOTE_FAILURES: &str = "labgym_remote_failures_total";
pub const METRIC_FORCED_TERMINATIONS: &str = "labgym_forced_terminations_total";
pub const METRIC_COMMAND_LATENCY: &str = "labgym_command_latency_seconds";

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `config.level`. Fails if a subscriber
/// is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| EngineError::Config(format!("invalid log filter '{}': {}", config.level, e)))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| EngineError::Config(format!("failed to install tracing subscriber: {}", e)))
}

/// Register descriptions for every metric the crate records
pub fn describe_metrics() {
    metrics::describe_counter!(METRIC_WORKERS_LAUNCHED, "Worker processes launched, by strategy");
    metrics::describe_counter!(
        METRIC_CONSTRUCTION_FAILURES,
        "Supervisors whose worker failed to construct its environment"
    );
    metrics::describe_counter!(METRIC_REMOTE_FAILURES, "reset/step calls that failed inside the worker");
    metrics::describe_counter!(
        METRIC_FORCED_TERMINATIONS,
        "Workers that had to be killed during shutdown"
    );
    metrics::describe_histogram!(
        METRIC_COMMAND_LATENCY,
        metrics::Unit::Seconds,
        "Round-trip latency of reset/step commands"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_filter_rejected() {
        std::env::remove_var("RUST_LOG");
        let config = LoggingConfig {
            level: "labgym=notalevel".to_string(),
            json: false,
        };
        assert!(matches!(init_tracing(&config), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_describe_without_recorder() {
        describe_metrics();
    }
}
