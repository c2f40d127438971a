//! Session settings and configuration management
//!
//! Tunables of the session core, serializable to/from JSON and validated before
//! a session is built from them.

use crate::transport::ble::gatt::DATA_CHARACTERISTIC_UUID;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

/// Ticks a device stays listed without being re-discovered
pub const DEFAULT_TTL_TICKS: i32 = 9;

/// Advertisements weaker than this are ignored
pub const DEFAULT_RSSI_FLOOR_DBM: i16 = -99;

/// Freshness tick cadence
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Complete session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Freshness countdown given to a device on every discovery
    pub ttl_ticks: i32,

    /// Minimum RSSI (dBm) for a discovery to be recorded
    pub rssi_floor_dbm: i16,

    /// Interval between freshness ticks
    pub tick_interval_ms: u64,

    /// Local name put in our advertisement
    pub local_name: String,

    /// Subscribe automatically to the target characteristic once discovered
    pub auto_subscribe: bool,

    /// Characteristic the central role targets, as a raw UUID string
    pub target_characteristic: String,

    /// Capacity of the session's inbound queue
    pub event_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ttl_ticks: DEFAULT_TTL_TICKS,
            rssi_floor_dbm: DEFAULT_RSSI_FLOOR_DBM,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            local_name: "gattduo".to_string(),
            auto_subscribe: false,
            target_characteristic: DATA_CHARACTERISTIC_UUID.to_string(),
            event_capacity: 256,
        }
    }
}

impl SessionSettings {
    /// Validate settings
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.ttl_ticks <= 0 {
            return Err(SettingsError::ConfigError(
                "ttl_ticks must be > 0".to_string(),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(SettingsError::ConfigError(
                "tick_interval_ms must be > 0".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(SettingsError::ConfigError(
                "event_capacity must be > 0".to_string(),
            ));
        }
        self.target_uuid()?;
        Ok(())
    }

    /// Parsed target characteristic
    pub fn target_uuid(&self) -> Result<Uuid, SettingsError> {
        Uuid::parse_str(&self.target_characteristic).map_err(|e| {
            SettingsError::ConfigError(format!(
                "target_characteristic '{}' is not a UUID: {}",
                self.target_characteristic, e
            ))
        })
    }

    /// Load settings from a JSON file
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let contents = std::fs::read_to_string(path)?;
        let settings: SessionSettings = serde_json::from_str(&contents)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Save settings to a JSON file
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        self.validate()?;
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}
