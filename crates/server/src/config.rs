use std::{collections::BTreeMap, fs, path::Path, time::Duration};

use control_core::{error::CatalogError, SceneCatalog};
use serde::Deserialize;
use shared::domain::{SceneName, SlotName};
use tracing::warn;

const DEFAULT_CONFIG_PATH: &str = "switcher.toml";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    #[serde(alias = "bind_addr")]
    pub server_bind: String,
    pub batch_timeout_ms: u64,
    pub pending_max_age_secs: u64,
    /// Scene name to its declared slots, in reconciliation order.
    pub scenes: BTreeMap<String, Vec<String>>,
}

impl Default for Settings {
    fn default() -> Self {
        let mut scenes = BTreeMap::new();
        for scene in ["Passive", "Present", "BeRightBack", "StartingSoon"] {
            scenes.insert(scene.to_string(), Vec::new());
        }
        scenes.insert(
            "TwoCamera".to_string(),
            ["MEDIA_1", "MEDIA_2", "WEB_1", "WEB_2"]
                .map(String::from)
                .to_vec(),
        );
        Self {
            server_bind: "127.0.0.1:3000".into(),
            batch_timeout_ms: 10_000,
            pending_max_age_secs: 60,
            scenes,
        }
    }
}

impl Settings {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn pending_max_age(&self) -> Duration {
        Duration::from_secs(self.pending_max_age_secs)
    }

    pub fn catalog(&self) -> Result<SceneCatalog, CatalogError> {
        SceneCatalog::new(self.scenes.iter().map(|(scene, slots)| {
            (
                SceneName::from(scene.as_str()),
                slots.iter().map(|s| SlotName::from(s.as_str())).collect(),
            )
        }))
    }
}

pub fn load_settings() -> Settings {
    let path = std::env::var("SWITCHER_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let mut settings = read_settings_file(Path::new(&path)).unwrap_or_default();
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

/// `None` when the file is absent or unreadable as TOML.
pub fn read_settings_file(path: &Path) -> Option<Settings> {
    let raw = fs::read_to_string(path).ok()?;
    match toml::from_str::<Settings>(&raw) {
        Ok(settings) => Some(settings),
        Err(error) => {
            warn!(path = %path.display(), %error, "ignoring malformed config file");
            None
        }
    }
}

pub fn apply_env_overrides(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Some(v) = lookup("APP__BIND_ADDR") {
        settings.server_bind = v;
    }

    if let Some(v) = lookup("APP__BATCH_TIMEOUT_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.batch_timeout_ms = parsed;
        }
    }

    if let Some(v) = lookup("APP__PENDING_MAX_AGE_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.pending_max_age_secs = parsed;
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
