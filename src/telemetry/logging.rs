//! Logging configuration and initialization
//!
//! Structured logging with tracing: console output, optional file logging
//! through a non-blocking writer, and JSON format for log aggregation.

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

/// Environment variable holding the log filter.
pub const LOG_ENV: &str = "BRIDGE_LOG";
/// Environment variable selecting the output format ("json").
pub const LOG_FORMAT_ENV: &str = "BRIDGE_LOG_FORMAT";

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Enable console output (default: true)
    pub console_enabled: bool,
    /// Enable file logging (default: false)
    pub file_enabled: bool,
    /// Path for the log file (default: `immersive_bridge.log`)
    pub file_path: Option<PathBuf>,
    /// Use JSON format for console logs (default: false)
    pub json_format: bool,
    /// Default log level filter (default: "info")
    pub default_level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_enabled: true,
            file_enabled: false,
            file_path: None,
            json_format: false,
            default_level: "info".to_string(),
        }
    }
}

impl LogConfig {
    /// Resolve the filter: `BRIDGE_LOG`, then `RUST_LOG`, then the default level.
    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_env(LOG_ENV)
            .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
            .unwrap_or_else(|_| EnvFilter::new(&self.default_level))
    }

    fn wants_json(&self) -> bool {
        std::env::var(LOG_FORMAT_ENV)
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(self.json_format)
    }
}

/// Initialize the global tracing subscriber.
///
/// Returns a guard that must be kept alive for the duration of the program
/// so file logging is flushed.
///
/// # Environment Variables
///
/// - `BRIDGE_LOG`: log filter (e.g. "debug", "info,immersive_bridge::receiver=debug")
/// - `BRIDGE_LOG_FORMAT`: set to "json" for JSON output
///
/// # Example
///
/// ```no_run
/// use immersive_bridge::telemetry::{init_logging, LogConfig};
///
/// let _guard = init_logging(&LogConfig::default()).expect("Failed to initialize logging");
/// ```
pub fn init_logging(
    config: &LogConfig,
) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error + Send + Sync>> {
    let use_json = config.wants_json();
    let subscriber = tracing_subscriber::registry().with(config.env_filter());
    let mut file_guard: Option<WorkerGuard> = None;

    if config.file_enabled {
        let log_path = config
            .file_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("immersive_bridge.log"));
        let file = std::fs::File::create(&log_path)?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        file_guard = Some(guard);

        let file_layer = fmt::layer()
            .with_writer(non_blocking)
            .with_target(true)
            .with_thread_names(true)
            .with_line_number(true)
            .with_ansi(false);

        if config.console_enabled {
            let console_layer = fmt::layer().with_target(true).compact();
            subscriber.with(file_layer).with(console_layer).try_init()?;
        } else {
            subscriber.with(file_layer).try_init()?;
        }
    } else if config.console_enabled {
        if use_json {
            let json_layer = fmt::layer()
                .json()
                .with_target(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true);
            subscriber.with(json_layer).try_init()?;
        } else {
            let console_layer = fmt::layer()
                .with_target(true)
                .with_thread_names(false)
                .compact();
            subscriber.with(console_layer).try_init()?;
        }
    } else {
        subscriber.try_init()?;
    }

    tracing::info!(
        target: "immersive_bridge",
        version = env!("CARGO_PKG_VERSION"),
        json_format = use_json,
        file_enabled = config.file_enabled,
        "Logging initialized"
    );

    Ok(file_guard)
}

/// Initialize logging with the default [`LogConfig`].
pub fn init_logging_default(
) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error + Send + Sync>> {
    init_logging(&LogConfig::default())
}

pub use tracing_appender::non_blocking::WorkerGuard as LogGuard;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert!(config.console_enabled);
        assert!(!config.file_enabled);
        assert!(!config.json_format);
        assert_eq!(config.default_level, "info");
    }

    #[test]
    fn test_file_logging_writes_guarded_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            console_enabled: false,
            file_enabled: true,
            file_path: Some(dir.path().join("bridge.log")),
            ..Default::default()
        };
        // Another test may already have installed a global subscriber.
        if let Ok(guard) = init_logging(&config) {
            assert!(guard.is_some());
            assert!(dir.path().join("bridge.log").exists());
        }
    }
}
