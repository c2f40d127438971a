// Configuration management for the gattduo CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/gattduo/config.json
// - Linux: ~/.config/gattduo/config.json
// - Windows: %APPDATA%\gattduo\config.json

use anyhow::{Context, Result};
use gattduo_core::SessionSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default listening time of the `scan` command
pub const DEFAULT_SCAN_SECONDS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Settings handed to every session the CLI starts
    pub session: SessionSettings,

    /// Seconds the `scan` command listens by default
    pub scan_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session: SessionSettings::default(),
            scan_seconds: DEFAULT_SCAN_SECONDS,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("gattduo");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the platform config dir, creating it on first use
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config
                .session
                .validate()
                .context("Invalid session settings in config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value; the caller persists it
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut updated = self.clone();
        match key {
            "ttl_ticks" => {
                updated.session.ttl_ticks = value.parse().context("Invalid number")?;
            }
            "rssi_floor_dbm" => {
                updated.session.rssi_floor_dbm = value.parse().context("Invalid dBm value")?;
            }
            "tick_interval_ms" => {
                updated.session.tick_interval_ms = value.parse().context("Invalid number")?;
            }
            "local_name" => updated.session.local_name = value.to_string(),
            "auto_subscribe" => {
                updated.session.auto_subscribe = value.parse().context("Invalid boolean value")?;
            }
            "target_characteristic" => {
                updated.session.target_characteristic = value.to_string();
            }
            "event_capacity" => {
                updated.session.event_capacity = value.parse().context("Invalid number")?;
            }
            "scan_seconds" => {
                updated.scan_seconds = value.parse().context("Invalid number")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        updated
            .session
            .validate()
            .with_context(|| format!("Rejected value for {}", key))?;
        *self = updated;
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
        let s = &self.session;
        vec![
            ("ttl_ticks".to_string(), s.ttl_ticks.to_string()),
            ("rssi_floor_dbm".to_string(), s.rssi_floor_dbm.to_string()),
            ("tick_interval_ms".to_string(), s.tick_interval_ms.to_string()),
            ("local_name".to_string(), s.local_name.clone()),
            ("auto_subscribe".to_string(), s.auto_subscribe.to_string()),
            (
                "target_characteristic".to_string(),
                s.target_characteristic.clone(),
            ),
            ("event_capacity".to_string(), s.event_capacity.to_string()),
            ("scan_seconds".to_string(), self.scan_seconds.to_string()),
        ]
    }
}
