//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`,
//! so a settings file only needs the keys it wants to change.

mod lifecycle;
mod server;

pub use lifecycle::*;
pub use server::*;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// # JSON Format
///
/// ```json
/// {
///   "gateway": { "baseUrl": "http://gateway:18789", "spawnTimeoutMs": 8000 },
///   "reconcile": { "gracePeriodSecs": 3600 },
///   "agents": { "Data-Scientist": "data-scientist" }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KanbotSettings {
    /// HTTP listener and database location.
    pub server: ServerSettings,
    /// Remote agent gateway.
    pub gateway: GatewaySettings,
    /// Phantom/orphan repair schedule.
    pub reconcile: ReconcileSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
    /// Agent directory: board name (hyphen-joined) → gateway agent id.
    pub agents: BTreeMap<String, String>,
}

impl Default for KanbotSettings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            gateway: GatewaySettings::default(),
            reconcile: ReconcileSettings::default(),
            logging: LoggingSettings::default(),
            agents: default_agents(),
        }
    }
}

impl KanbotSettings {
    /// Cross-field checks that serde defaults cannot express.
    ///
    /// The reconciliation grace period has to outlast every attempt the
    /// orchestrator may make, otherwise a slow-but-successful spawn gets
    /// reset underneath it.
    pub fn validate(&self) -> Result<()> {
        let worst_case_ms = self
            .gateway
            .spawn_timeout_ms
            .saturating_mul(u64::from(self.gateway.spawn_retries) + 2)
            .saturating_add(
                self.gateway
                    .retry_delay_ms
                    .saturating_mul(u64::from(self.gateway.spawn_retries)),
            );
        let grace_ms = self.reconcile.grace_period_secs.saturating_mul(1000);
        if grace_ms <= worst_case_ms {
            return Err(SettingsError::InvalidValue(format!(
                "reconcile.gracePeriodSecs ({}s) must exceed worst-case spawn latency ({}ms)",
                self.reconcile.grace_period_secs, worst_case_ms
            )));
        }
        if self.reconcile.grace_period_secs > MAX_GRACE_PERIOD_SECS {
            return Err(SettingsError::InvalidValue(format!(
                "reconcile.gracePeriodSecs ({}s) exceeds {MAX_GRACE_PERIOD_SECS}s",
                self.reconcile.grace_period_secs
            )));
        }
        if self.reconcile.interval_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "reconcile.intervalSecs must be positive".into(),
            ));
        }
        if self.gateway.base_url.trim().is_empty() {
            return Err(SettingsError::InvalidValue("gateway.baseUrl is empty".into()));
        }
        Ok(())
    }
}

/// Thirty days.
const MAX_GRACE_PERIOD_SECS: u64 = 30 * 24 * 60 * 60;

fn default_agents() -> BTreeMap<String, String> {
    [
        ("Architect", "architect"),
        ("UX-Manager", "ux-manager"),
        ("Developer", "developer"),
        ("QA-Engineer", "qa-engineer"),
        ("DevOps", "devops"),
    ]
    .into_iter()
    .map(|(name, id)| (name.to_string(), id.to_string()))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        KanbotSettings::default().validate().unwrap();
    }

    #[test]
    fn default_agent_names_use_hyphens() {
        let settings = KanbotSettings::default();
        assert!(settings.agents.contains_key("UX-Manager"));
        assert!(settings.agents.keys().all(|k| !k.contains(' ')));
    }

    #[test]
    fn grace_period_must_outlast_spawn_attempts() {
        let mut settings = KanbotSettings::default();
        settings.gateway.spawn_timeout_ms = 10_000;
        settings.gateway.spawn_retries = 1;
        settings.reconcile.grace_period_secs = 20;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("gracePeriodSecs"));
    }

    #[test]
    fn absurd_grace_period_rejected() {
        let mut settings = KanbotSettings::default();
        settings.reconcile.grace_period_secs = u64::MAX;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn zero_interval_rejected() {
        let mut settings = KanbotSettings::default();
        settings.reconcile.interval_secs = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let json = r#"{"reconcile":{"gracePeriodSecs":7200}}"#;
        let settings: KanbotSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.reconcile.grace_period_secs, 7200);
        assert_eq!(settings.reconcile.interval_secs, ReconcileSettings::default().interval_secs);
        assert_eq!(settings.server.port, ServerSettings::default().port);
    }
}
