// Configuration management for the blesync CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/blesync/config.json
// - Linux: ~/.config/blesync/config.json
// - Windows: %APPDATA%\blesync\config.json

use anyhow::{Context, Result};
use blesync_core::BridgeConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(flatten)]
    pub bridge: BridgeConfig,
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("blesync");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    /// Load config from `path`, writing the default there if it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config
                .bridge
                .validate()
                .context("Config file holds invalid settings")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value. The change is validated but not persisted.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut updated = self.bridge.clone();
        match key {
            "device_name" => {
                updated.device_name = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "scan_timeout_ms" => {
                updated.scan_timeout_ms = value.parse().context("Invalid number")?;
            }
            "queue_capacity" => {
                updated.queue_capacity = value.parse().context("Invalid number")?;
            }
            "drain_timeout_ms" => {
                updated.drain_timeout_ms = value.parse().context("Invalid number")?;
            }
            "write_timeout_ms" => {
                updated.write_timeout_ms = value.parse().context("Invalid number")?;
            }
            "pump_interval_ms" => {
                updated.pump_interval_ms = value.parse().context("Invalid number")?;
            }
            "readiness.timeout_ms" => {
                updated.readiness.timeout_ms = value.parse().context("Invalid number")?;
            }
            "readiness.default_sources" => {
                updated.readiness.default_sources = if value.is_empty() {
                    None
                } else {
                    Some(value.parse().context("Invalid number")?)
                };
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        updated
            .validate()
            .with_context(|| format!("Rejected value for {}", key))?;
        self.bridge = updated;
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let b = &self.bridge;
        vec![
            (
                "device_name".to_string(),
                b.device_name.clone().unwrap_or_else(|| "(any)".to_string()),
            ),
            ("scan_timeout_ms".to_string(), b.scan_timeout_ms.to_string()),
            ("queue_capacity".to_string(), b.queue_capacity.to_string()),
            ("drain_timeout_ms".to_string(), b.drain_timeout_ms.to_string()),
            ("write_timeout_ms".to_string(), b.write_timeout_ms.to_string()),
            ("pump_interval_ms".to_string(), b.pump_interval_ms.to_string()),
            (
                "readiness.timeout_ms".to_string(),
                b.readiness.timeout_ms.to_string(),
            ),
            (
                "readiness.default_sources".to_string(),
                b.readiness
                    .default_sources
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "(none)".to_string()),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_creates_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config, Config::default());
        assert!(path.exists());
    }

    #[test]
    fn test_set_persists_across_loads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::load_from(&path).unwrap();
        config.set("device_name", "LPF2 Smart Hub").unwrap();
        config.set("readiness.default_sources", "6").unwrap();
        config.save_to(&path).unwrap();

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.bridge.device_name.as_deref(), Some("LPF2 Smart Hub"));
        assert_eq!(reloaded.bridge.readiness.default_sources, Some(6));
    }

    #[test]
    fn test_file_layout_is_flat() {
        let json = serde_json::to_value(Config::default()).unwrap();
        assert!(json.get("queue_capacity").is_some());
        assert!(json.get("readiness").is_some());
    }

    #[test]
    fn test_set_rejects_invalid_values() {
        let mut config = Config::default();
        assert!(config.set("queue_capacity", "0").is_err());
        assert!(config.set("queue_capacity", "lots").is_err());
        assert!(config.set("no_such_key", "1").is_err());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_get_and_clear() {
        let mut config = Config::default();
        assert_eq!(config.get("scan_timeout_ms").as_deref(), Some("10000"));
        assert_eq!(config.get("bogus"), None);

        config.set("device_name", "hub").unwrap();
        config.set("device_name", "").unwrap();
        assert_eq!(config.bridge.device_name, None);
    }
}
