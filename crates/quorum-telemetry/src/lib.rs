//! Tracing initialization for quorum embedders.
//!
//! The kernel logs through `tracing` macros only; wiring a subscriber
//! is the embedder's call. This crate offers the standard setup.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "quorum_kernel" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Include span targets in output.
    pub with_targets: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            with_targets: true,
        }
    }
}

/// Install the global subscriber. Returns an error string when one is
/// already set (tests installing their own, for instance).
pub fn init(config: TelemetryConfig) -> Result<(), String> {
    let mut directives = config.log_level.to_string();
    for (module, level) in &config.module_levels {
        directives.push_str(&format!(",{module}={level}"));
    }
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directives));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(config.with_targets)
        .compact();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| e.to_string())
}

/// `init` with defaults; convenient for examples and binaries.
pub fn init_default() -> Result<(), String> {
    init(TelemetryConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = TelemetryConfig::default();
        assert_eq!(config.log_level, Level::INFO);
        assert!(config.module_levels.is_empty());
    }

    #[test]
    fn init_succeeds_once() {
        // First init wins; a second must report failure, not panic.
        let first = init_default();
        let second = init_default();
        assert!(first.is_ok() || second.is_err());
    }
}
