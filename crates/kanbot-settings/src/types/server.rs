//! Server and logging settings.

use serde::{Deserialize, Serialize};

/// HTTP listener and task database.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// HTTP port (`0` picks a free one).
    pub port: u16,
    /// Task database path (relative paths resolve under `~/.kanbot`).
    pub database_path: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            database_path: "database/tasks.db".to_string(),
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level (`RUST_LOG` wins when set).
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Persist warn+ records to a SQLite log database.
    pub persist_warnings: bool,
    /// Log database path (relative paths resolve under `~/.kanbot`).
    pub log_database_path: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
            persist_warnings: true,
            log_database_path: "database/logs.db".to_string(),
        }
    }
}
