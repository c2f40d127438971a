// Observable session state: published to the presentation layer

use crate::transport::abstraction::{DeviceId, PowerState};
use crate::transport::ble::central::InboundChannel;
use crate::transport::ble::peripheral::Subscriber;
use crate::transport::ble::registry::RemoteDevice;
use serde::{Deserialize, Serialize};

/// First line of every session log
pub const LOG_HEADER: &str = "Start log...";

/// Human-readable session log, one entry per line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLog {
    text: String,
}

impl Default for SessionLog {
    fn default() -> Self {
        Self {
            text: LOG_HEADER.to_string(),
        }
    }
}

impl SessionLog {
    pub fn append(&mut self, line: impl AsRef<str>) {
        self.text.push('\n');
        self.text.push_str(line.as_ref());
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.text.lines()
    }
}

/// Everything an observer may render, captured at one point in time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Known remote peripherals, in discovery order
    pub devices: Vec<RemoteDevice>,
    pub log: String,
    /// Device whose signal strength changed most recently
    pub last_updated: Option<DeviceId>,
    pub scanning: bool,
    pub advertising: bool,
    pub central_power: PowerState,
    pub peripheral_power: PowerState,
    pub subscriber: Option<Subscriber>,
    pub inbound: Option<InboundChannel>,
    /// Messages reassembled from notification chunks
    pub received_messages: Vec<String>,
    pub last_write_received: Option<String>,
}

impl SessionSnapshot {
    pub fn device(&self, id: &DeviceId) -> Option<&RemoteDevice> {
        self.devices.iter().find(|d| d.id == *id)
    }
}
