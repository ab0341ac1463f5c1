use crate::infrastructure::error::InfraError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const EXTENSION_JSON: &str = "extension.json";
const SUPPORTED_SCHEMA: u64 = 1;

pub const DEFAULT_CALENDAR_ORIGIN: &str = "https://calendar.google.com/";
pub const DEFAULT_CALENDAR_API_BASE: &str = "https://www.googleapis.com/calendar/v3/";

/// Fallback for the ghosting "now" reference when the page has no live-time indicator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NowFallback {
    #[default]
    WallClock,
    StartOfDay,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionConfig {
    pub schema: u8,
    pub calendar_origin: String,
    pub content_script: String,
    pub stylesheet: String,
    pub popup_page: String,
    pub observer_throttle_ms: u64,
    pub element_cache_ttl_ms: u64,
    pub retry_max_attempts: u8,
    pub retry_base_delay_ms: u64,
    pub calendar_api_base: String,
    pub now_fallback: NowFallback,
}

impl Default for ExtensionConfig {
    fn default() -> Self {
        Self {
            schema: 1,
            calendar_origin: DEFAULT_CALENDAR_ORIGIN.to_string(),
            content_script: "content-bundle.js".to_string(),
            stylesheet: "styles.css".to_string(),
            popup_page: "popup.html".to_string(),
            observer_throttle_ms: 250,
            element_cache_ttl_ms: 5_000,
            retry_max_attempts: 3,
            retry_base_delay_ms: 1_000,
            calendar_api_base: DEFAULT_CALENDAR_API_BASE.to_string(),
            now_fallback: NowFallback::WallClock,
        }
    }
}

impl ExtensionConfig {
    pub fn validate(&self) -> Result<(), InfraError> {
        if self.calendar_origin.trim().is_empty() {
            return Err(InfraError::InvalidConfig(
                "calendarOrigin must not be empty".to_string(),
            ));
        }
        if self.observer_throttle_ms == 0 {
            return Err(InfraError::InvalidConfig(
                "observerThrottleMs must be > 0".to_string(),
            ));
        }
        if self.retry_max_attempts == 0 {
            return Err(InfraError::InvalidConfig(
                "retryMaxAttempts must be > 0".to_string(),
            ));
        }
        url::Url::parse(&self.calendar_api_base).map_err(|error| {
            InfraError::InvalidConfig(format!("invalid calendarApiBase: {error}"))
        })?;
        Ok(())
    }
}

pub fn ensure_default_config(config_dir: &Path) -> Result<(), InfraError> {
    let path = config_dir.join(EXTENSION_JSON);
    if !path.exists() {
        let formatted = serde_json::to_string_pretty(&ExtensionConfig::default())?;
        fs::write(path, format!("{formatted}\n"))?;
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != SUPPORTED_SCHEMA {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

/// Loads `extension.json`, filling keys the file leaves out from the defaults.
pub fn load_config(config_dir: &Path) -> Result<ExtensionConfig, InfraError> {
    let parsed = read_config(&config_dir.join(EXTENSION_JSON))?;
    let mut merged = serde_json::to_value(ExtensionConfig::default())?;
    if let (Some(target), Some(source)) = (merged.as_object_mut(), parsed.as_object()) {
        for (key, value) in source {
            target.insert(key.clone(), value.clone());
        }
    }
    let config: ExtensionConfig = serde_json::from_value(merged)?;
    config.validate()?;
    Ok(config)
}
