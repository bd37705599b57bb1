// src/infra/config.rs - Configuration loading (TOML)

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::infra::paths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub geofence: GeofenceConfig,

    #[serde(default)]
    pub clock: ClockConfig,

    #[serde(default)]
    pub retry: RetrySettings,

    /// Location used by `clock-in` when neither an id nor a GPS fix is given.
    #[serde(default)]
    pub default_location: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub timeout_seconds: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000/".into(),
            timeout_seconds: 15,
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeofenceConfig {
    pub enabled: bool,
    pub grace_seconds: u64,
}

impl Default for GeofenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            grace_seconds: 300,
        }
    }
}

impl GeofenceConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub tick_seconds: u64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self { tick_seconds: 1 }
    }
}

impl ClockConfig {
    /// Tick granularity, never below one second.
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_seconds.max(1))
    }
}

/// Backoff settings for dashboard fetches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub jitter_fraction: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            backoff_factor: 2.0,
            max_delay_ms: 10_000,
            jitter_fraction: 0.2,
        }
    }
}

impl Config {
    /// Load config from file, falling back to defaults.
    pub fn load() -> anyhow::Result<Self> {
        let path = paths::config_file_path();
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("STUDYTRACK_API_URL") {
            if !url.trim().is_empty() {
                self.api.base_url = url;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_reasonable() {
        let c = Config::default();
        assert_eq!(c.api.base_url, "http://127.0.0.1:8000/");
        assert_eq!(c.api.timeout_seconds, 15);
        assert!(c.geofence.enabled);
        assert_eq!(c.geofence.grace(), Duration::from_secs(300));
        assert_eq!(c.clock.tick(), Duration::from_secs(1));
        assert_eq!(c.retry.max_retries, 3);
        assert!(c.default_location.is_none());
    }

    #[test]
    fn test_tick_clamped_to_one_second() {
        let clock = ClockConfig { tick_seconds: 0 };
        assert_eq!(clock.tick(), Duration::from_secs(1));
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.geofence.grace_seconds, 300);
    }

    #[test]
    fn test_parse_partial_sections() {
        let toml_str = r#"
default_location = 7

[api]
base_url = "https://study.example.org/"

[geofence]
grace_seconds = 120

[retry]
max_retries = 5
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.api.base_url, "https://study.example.org/");
        assert_eq!(config.api.timeout_seconds, 15);
        assert_eq!(config.geofence.grace_seconds, 120);
        assert!(config.geofence.enabled);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.max_delay_ms, 10_000);
        assert_eq!(config.default_location, Some(7));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[clock]\ntick_seconds = 5\n").unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.clock.tick(), Duration::from_secs(5));
    }
}
