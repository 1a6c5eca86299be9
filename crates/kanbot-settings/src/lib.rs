//! # kanbot-settings
//!
//! Layered configuration for the lifecycle manager.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults** — [`KanbotSettings::default()`]
//! 2. **User file** — `~/.kanbot/settings.json` (deep-merged over defaults)
//! 3. **Environment variables** — `KANBOT_*` overrides (highest priority)
//!
//! Settings are loaded once at startup and passed down explicitly; nothing
//! here is global.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    deep_merge, kanbot_home, load_settings, load_settings_from_path, resolve_path, settings_path,
};
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_exports_work() {
        let _settings = KanbotSettings::default();
        assert!(settings_path().ends_with("settings.json"));
    }
}
