//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`KanbotSettings::default()`]
//! 2. If `~/.kanbot/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `KANBOT_*` environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)
//! - The `agents` map is replaced whole, so a settings file can drop a
//!   default agent

use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::KanbotSettings;

/// Root directory for kanbot state (`~/.kanbot`).
pub fn kanbot_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".kanbot")
}

/// Resolve the path to the settings file (`~/.kanbot/settings.json`).
pub fn settings_path() -> PathBuf {
    kanbot_home().join("settings.json")
}

/// Resolve a configured path: absolute paths are kept, relative ones are
/// placed under [`kanbot_home`].
pub fn resolve_path(configured: &str) -> PathBuf {
    let path = Path::new(configured);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        kanbot_home().join(path)
    }
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<KanbotSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON or a failed
/// [`KanbotSettings::validate`] is an error.
pub fn load_settings_from_path(path: &Path) -> Result<KanbotSettings> {
    let defaults = serde_json::to_value(KanbotSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        merge_user_settings(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: KanbotSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Top-level sections a user file replaces rather than merges into.
const REPLACED_SECTIONS: &[&str] = &["agents"];

/// Merge a user settings file over the defaults.
fn merge_user_settings(mut defaults: Value, user: Value) -> Value {
    if let (Value::Object(defaults_map), Value::Object(user_map)) = (&mut defaults, &user) {
        for section in REPLACED_SECTIONS {
            if user_map.get(*section).is_some_and(|v| !v.is_null()) {
                let _ = defaults_map.remove(*section);
            }
        }
    }
    deep_merge(defaults, user)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are logged and ignored (falling back to file/default).
pub fn apply_env_overrides(settings: &mut KanbotSettings) {
    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read_env_string("KANBOT_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u16("KANBOT_PORT", 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = read_env_string("KANBOT_DB_PATH") {
        settings.server.database_path = v;
    }

    // ── Gateway ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("KANBOT_GATEWAY_URL") {
        settings.gateway.base_url = v;
    }
    if let Some(v) = read_env_string("KANBOT_GATEWAY_TOKEN") {
        settings.gateway.token = Some(SecretString::from(v));
    }
    if let Some(v) = read_env_u64("KANBOT_SPAWN_TIMEOUT_MS", 100, 120_000) {
        settings.gateway.spawn_timeout_ms = v;
    }
    if let Some(v) = read_env_u64("KANBOT_SPAWN_RETRIES", 0, 5) {
        settings.gateway.spawn_retries = v as u32;
    }

    // ── Reconciler ──────────────────────────────────────────────────
    if let Some(v) = read_env_bool("KANBOT_RECONCILE_ENABLED") {
        settings.reconcile.enabled = v;
    }
    if let Some(v) = read_env_u64("KANBOT_GRACE_PERIOD_SECS", 1, 7 * 24 * 3600) {
        settings.reconcile.grace_period_secs = v;
    }
    if let Some(v) = read_env_u64("KANBOT_RECONCILE_INTERVAL_SECS", 1, 24 * 3600) {
        settings.reconcile.interval_secs = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("KANBOT_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("KANBOT_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"gateway": {"baseUrl": "http://a", "spawnTimeoutMs": 10000}});
        let source = serde_json::json!({"gateway": {"spawnTimeoutMs": 5000}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["gateway"]["spawnTimeoutMs"], 5000);
        assert_eq!(merged["gateway"]["baseUrl"], "http://a");
    }

    #[test]
    fn merge_skips_null() {
        let target = serde_json::json!({"a": 1});
        let source = serde_json::json!({"a": null});
        assert_eq!(deep_merge(target, source)["a"], 1);
    }

    #[test]
    fn user_agents_replace_default_directory() {
        let defaults = serde_json::json!({
            "agents": {"Architect": "architect"},
            "gateway": {"baseUrl": "http://a", "spawnTimeoutMs": 1000},
        });
        let user = serde_json::json!({
            "agents": {"Data-Scientist": "data-scientist"},
            "gateway": {"spawnTimeoutMs": 5000},
        });
        let merged = merge_user_settings(defaults, user);
        assert_eq!(merged["agents"], serde_json::json!({"Data-Scientist": "data-scientist"}));
        assert_eq!(merged["gateway"]["baseUrl"], "http://a");
        assert_eq!(merged["gateway"]["spawnTimeoutMs"], 5000);
    }

    #[test]
    fn null_agents_keep_default_directory() {
        let defaults = serde_json::json!({"agents": {"Architect": "architect"}});
        let merged = merge_user_settings(defaults, serde_json::json!({"agents": null}));
        assert_eq!(merged["agents"]["Architect"], "architect");
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from_path(&dir.path().join("nope.json")).unwrap();
        assert!(settings.agents.contains_key("Architect"));
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"reconcile":{"gracePeriodSecs":7200},"agents":{"Data-Scientist":"ds"}}"#,
        )
        .unwrap();
        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.reconcile.grace_period_secs, 7200);
        assert_eq!(settings.agents.get("Data-Scientist").map(String::as_str), Some("ds"));
        assert_eq!(settings.agents.len(), 1);
    }

    #[test]
    fn invalid_json_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_settings_from_path(&path), Err(SettingsError::Json(_))));
    }

    #[test]
    fn invalid_combination_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"reconcile":{"gracePeriodSecs":1}}"#).unwrap();
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::InvalidValue(_))
        ));
    }

    #[test]
    fn parse_helpers() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_u16_range("8000", 1, 65535), Some(8000));
        assert_eq!(parse_u16_range("70000", 1, 65535), None);
        assert_eq!(parse_u64_range("0", 1, 10), None);
        assert_eq!(parse_u64_range("5", 1, 10), Some(5));
    }

    #[test]
    fn relative_paths_resolve_under_home() {
        assert!(resolve_path("database/tasks.db").ends_with(".kanbot/database/tasks.db"));
        assert_eq!(resolve_path("/var/lib/kanbot.db"), PathBuf::from("/var/lib/kanbot.db"));
    }
}
