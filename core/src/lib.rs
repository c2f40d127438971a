// gattduo core: dual-role BLE session manager
#![allow(clippy::empty_line_after_doc_comments)]
//
// One device, two GATT roles: it scans for and connects to peripherals while
// advertising its own transfer service to centrals. Everything here is
// platform-agnostic; a radio bridge carries commands and events.

pub mod session;
pub mod settings;
pub mod transport;

use thiserror::Error;

pub use session::{spawn_session, BleSession, SessionCommand, SessionHandle, SessionLog, SessionSnapshot};
pub use settings::{SessionSettings, SettingsError};
pub use transport::{
    AttRequest, AttResponse, CharacteristicId, DeviceId, PowerState, RadioBridge, RadioCommand,
    RadioEvent, Role,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// A command was issued without its prerequisite state
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GuardViolation {
    #[error("{0} radio is not powered on")]
    RadioNotPowered(Role),
    #[error("Unknown device {0}")]
    UnknownDevice(DeviceId),
    #[error("Device {0} is not connected")]
    NotConnected(DeviceId),
    #[error("Unknown characteristic {0}")]
    UnknownCharacteristic(CharacteristicId),
    #[error("No outbound characteristic for device {0}")]
    NoOutboundChannel(DeviceId),
    #[error("Payload of {len} bytes does not fit a single write of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("Device {0} cannot accept a write without response")]
    WriteNotReady(DeviceId),
    #[error("No central is subscribed")]
    NoSubscriber,
}

/// Failure of a single session operation
///
/// None of these are fatal: the session manager logs them and keeps running.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BleError {
    /// Reported by the radio stack (discovery, connect, read, write)
    #[error("Transport error: {0}")]
    Transport(String),
    /// Payload bytes that could not be decoded
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// Command issued without its prerequisite state
    #[error("Guard violation: {0}")]
    Guard(#[from] GuardViolation),
}

/// Errors of the async session handle
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session task not running")]
    NotRunning,
    #[error("Invalid UUID: {0}")]
    InvalidUuid(String),
}
