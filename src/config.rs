use crate::db::merge_json;
use crate::errors::{AppError, AppResult};
use crate::local_storage::{LocalStorage, SETTINGS_KEY};
use crate::models::Theme;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const SETTINGS_FILE_NAME: &str = "settings.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppSettings {
    pub default_theme: Theme,
    pub allow_guest: bool,
    pub assistant_reply_delay_ms: u64,
    pub listener_buffer_size: usize,
    pub log_filter: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            default_theme: Theme::Light,
            allow_guest: true,
            assistant_reply_delay_ms: 1_500,
            listener_buffer_size: 256,
            log_filter: "info".to_string(),
        }
    }
}

impl AppSettings {
    pub fn validate(&self) -> AppResult<()> {
        if self.listener_buffer_size == 0 {
            return Err(AppError::Validation("listenerBufferSize must be at least 1".to_string()));
        }
        if self.log_filter.trim().is_empty() {
            return Err(AppError::Validation("logFilter must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Reads `settings.yaml` from the data dir if present. The file may set any subset of fields.
pub fn load_file_settings(app_data_dir: &Path) -> AppResult<serde_json::Value> {
    let path = app_data_dir.join(SETTINGS_FILE_NAME);
    if !path.exists() {
        return Ok(serde_json::Value::Object(serde_json::Map::new()));
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(serde_json::Value::Object(serde_json::Map::new()));
    }
    let value: serde_json::Value = serde_yaml::from_str(&raw)?;
    Ok(value)
}

/// Defaults, then `settings.yaml`, then the overrides saved on this device.
pub fn load_settings(app_data_dir: &Path, storage: &LocalStorage) -> AppResult<AppSettings> {
    let mut merged = serde_json::to_value(AppSettings::default())?;
    merge_json(&mut merged, load_file_settings(app_data_dir)?);
    if let Some(stored) = storage.get_item::<serde_json::Value>(SETTINGS_KEY)? {
        merge_json(&mut merged, stored);
    }

    let settings: AppSettings = serde_json::from_value(merged)?;
    settings.validate()?;
    Ok(settings)
}

pub fn update_settings(
    current: &AppSettings,
    storage: &LocalStorage,
    update: serde_json::Value,
) -> AppResult<AppSettings> {
    let mut merged = serde_json::to_value(current)?;
    merge_json(&mut merged, update);
    let settings: AppSettings =
        serde_json::from_value(merged).map_err(|error| AppError::Validation(error.to_string()))?;
    settings.validate()?;

    storage.set_item(SETTINGS_KEY, &settings)?;
    Ok(settings)
}
