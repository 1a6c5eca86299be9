//! Gateway and reconciliation settings.

use secrecy::SecretString;
use serde::{Deserialize, Deserializer, Serialize};

/// Remote agent gateway connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewaySettings {
    /// Base URL; the invoke and health paths are appended.
    pub base_url: String,
    /// Bearer token sent with every gateway request.
    #[serde(skip_serializing, deserialize_with = "deserialize_token")]
    pub token: Option<SecretString>,
    /// Per-request timeout for spawn and health calls, in milliseconds.
    pub spawn_timeout_ms: u64,
    /// Extra attempts the orchestrator makes after an `unreachable` failure.
    pub spawn_retries: u32,
    /// Pause between spawn attempts, in milliseconds.
    pub retry_delay_ms: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:18789".to_string(),
            token: None,
            spawn_timeout_ms: 10_000,
            spawn_retries: 0,
            retry_delay_ms: 1_000,
        }
    }
}

fn deserialize_token<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.filter(|t| !t.is_empty()).map(SecretString::from))
}

/// Phantom/orphan repair schedule.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconcileSettings {
    /// Whether the periodic reconciler runs alongside the server.
    pub enabled: bool,
    /// How long a task may sit In Progress without a session before it is
    /// considered a phantom, in seconds.
    pub grace_period_secs: u64,
    /// Time between periodic passes, in seconds.
    pub interval_secs: u64,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            grace_period_secs: 1_800,
            interval_secs: 300,
        }
    }
}
