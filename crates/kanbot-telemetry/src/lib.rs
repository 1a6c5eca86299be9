//! Logging setup: a stdout formatter filtered by `RUST_LOG` plus an optional
//! SQLite sink that keeps warn+ events for later inspection by task.

mod logging;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "kanbot_gateway" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines on stdout; plain text otherwise.
    pub json: bool,
    /// Whether to persist warn+ logs to SQLite.
    pub log_to_sqlite: bool,
    /// Path to the log database.
    pub log_db_path: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
            log_to_sqlite: true,
            log_db_path: dirs_fallback().join("database/logs.db"),
        }
    }
}

impl TelemetryConfig {
    /// Parse a level name from settings, falling back to INFO.
    pub fn with_level_name(mut self, name: &str) -> Self {
        self.log_level = name.parse().unwrap_or(Level::INFO);
        self
    }
}

/// Keeps the log sink alive for the lifetime of the process.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
}

impl TelemetryGuard {
    /// Access the log sink for querying persisted logs.
    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.log_sink.as_deref()
    }
}

fn filter_directive(config: &TelemetryConfig) -> String {
    let mut filter_str = config.log_level.to_string().to_lowercase();
    for (module, level) in &config.module_levels {
        filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    filter_str
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(&config)));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    };

    let (sqlite_layer, sqlite_sink) = if config.log_to_sqlite {
        match SqliteLogSink::new(&config.log_db_path) {
            Ok(sink) => {
                let sink = Arc::new(sink);
                (Some(SqliteLogLayer::new(sink.clone())), Some(sink))
            }
            Err(e) => {
                eprintln!("kanbot-telemetry: failed to open log DB: {e}");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    let _ = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sqlite_layer)
        .try_init();

    TelemetryGuard { log_sink: sqlite_sink }
}

fn dirs_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".kanbot")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directive_includes_module_overrides() {
        let config = TelemetryConfig {
            module_levels: vec![("kanbot_gateway".into(), Level::DEBUG)],
            ..TelemetryConfig::default()
        };
        assert_eq!(filter_directive(&config), "info,kanbot_gateway=debug");
    }

    #[test]
    fn unknown_level_name_falls_back_to_info() {
        let config = TelemetryConfig::default().with_level_name("loud");
        assert_eq!(config.log_level, Level::INFO);
        let config = TelemetryConfig::default().with_level_name("warn");
        assert_eq!(config.log_level, Level::WARN);
    }

    #[test]
    fn init_without_sqlite_has_no_sink() {
        let guard = init_telemetry(TelemetryConfig {
            log_to_sqlite: false,
            ..TelemetryConfig::default()
        });
        assert!(guard.logs().is_none());
    }
}
