//! Radio abstraction layer for gattduo
//!
//! Defines the boundary between the session core and the platform radio stack:
//! the events the radio reports, the commands the core issues, and the bridge
//! trait a platform implements to carry them.

use crate::transport::ble::gatt::{GattError, ServiceDefinition};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable identifier of a remote device (platform address or UUID string)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Service-scoped characteristic identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharacteristicId {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicId {
    pub fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }
}

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

/// Which half of the dual-role session a radio belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Central,
    Peripheral,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Central => write!(f, "central"),
            Role::Peripheral => write!(f, "peripheral"),
        }
    }
}

/// Radio power state as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PowerState {
    Off,
    On,
    Resetting,
    Unauthorized,
    #[default]
    Unknown,
    Unsupported,
}

impl PowerState {
    pub fn is_on(&self) -> bool {
        *self == PowerState::On
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerState::Off => write!(f, "BLE is powered off"),
            PowerState::On => write!(f, "BLE is powered on"),
            PowerState::Resetting => write!(f, "BLE is resetting"),
            PowerState::Unauthorized => write!(f, "BLE is unauthorized"),
            PowerState::Unknown => write!(f, "BLE state is unknown"),
            PowerState::Unsupported => write!(f, "BLE is unsupported"),
        }
    }
}

/// Result code sent back to a central for an attribute request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttResponse {
    Success,
    InvalidHandle,
    RequestNotSupported,
    UnlikelyError,
}

/// A read or write request received while acting as peripheral
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttRequest {
    /// Platform handle used to answer the request
    pub request_id: u64,
    /// The central that issued the request
    pub central: DeviceId,
    /// Target characteristic on our own service
    pub characteristic: Uuid,
    /// Written bytes (empty for reads)
    pub value: Vec<u8>,
}

/// Events from the radio stack to the session core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RadioEvent {
    /// Power state of one role's radio changed
    PowerStateChanged { role: Role, state: PowerState },
    /// An advertisement was received while scanning
    Discovered {
        device: DeviceId,
        name: Option<String>,
        rssi: i16,
        advertisement: Vec<u8>,
    },
    /// A connect request completed
    Connected { device: DeviceId },
    /// A connect request failed
    ConnectFailed {
        device: DeviceId,
        error: Option<String>,
    },
    /// An established link went down
    Disconnected {
        device: DeviceId,
        error: Option<String>,
    },
    /// Service discovery completed
    ServicesDiscovered {
        device: DeviceId,
        services: Vec<Uuid>,
        error: Option<String>,
    },
    /// The remote peripheral invalidated some of its services
    ServicesInvalidated { device: DeviceId, services: Vec<Uuid> },
    /// Characteristic discovery for one service completed
    CharacteristicsDiscovered {
        device: DeviceId,
        service: Uuid,
        characteristics: Vec<Uuid>,
        error: Option<String>,
    },
    /// A notification or read response arrived
    ValueUpdated {
        device: DeviceId,
        characteristic: CharacteristicId,
        value: Vec<u8>,
        error: Option<String>,
    },
    /// The remote confirmed a set-notify request
    NotifyStateChanged {
        device: DeviceId,
        characteristic: CharacteristicId,
        notifying: bool,
        error: Option<String>,
    },
    /// The remote can accept another write without response
    WriteWithoutResponseReady { device: DeviceId },
    /// A remote central subscribed to one of our characteristics
    CentralSubscribed {
        central: DeviceId,
        characteristic: Uuid,
        max_update_len: usize,
    },
    /// A remote central unsubscribed
    CentralUnsubscribed {
        central: DeviceId,
        characteristic: Uuid,
    },
    /// A remote central dropped its link to us
    CentralDisconnected { central: DeviceId },
    /// One or more write requests arrived
    WriteRequests { requests: Vec<AttRequest> },
    /// A read request arrived
    ReadRequest { request: AttRequest },
    /// The transmit queue drained; stalled notifications may resume
    ReadyToUpdateSubscribers,
}

impl fmt::Display for RadioEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RadioEvent::PowerStateChanged { role, state } => {
                write!(f, "PowerStateChanged {{ role: {}, state: {:?} }}", role, state)
            }
            RadioEvent::Discovered { device, rssi, .. } => {
                write!(f, "Discovered {{ device: {}, rssi: {} }}", device, rssi)
            }
            RadioEvent::Connected { device } => write!(f, "Connected {{ device: {} }}", device),
            RadioEvent::ConnectFailed { device, .. } => {
                write!(f, "ConnectFailed {{ device: {} }}", device)
            }
            RadioEvent::Disconnected { device, .. } => {
                write!(f, "Disconnected {{ device: {} }}", device)
            }
            RadioEvent::ServicesDiscovered {
                device, services, ..
            } => write!(
                f,
                "ServicesDiscovered {{ device: {}, count: {} }}",
                device,
                services.len()
            ),
            RadioEvent::ServicesInvalidated { device, .. } => {
                write!(f, "ServicesInvalidated {{ device: {} }}", device)
            }
            RadioEvent::CharacteristicsDiscovered {
                device,
                service,
                characteristics,
                ..
            } => write!(
                f,
                "CharacteristicsDiscovered {{ device: {}, service: {}, count: {} }}",
                device,
                service,
                characteristics.len()
            ),
            RadioEvent::ValueUpdated {
                device,
                characteristic,
                value,
                ..
            } => write!(
                f,
                "ValueUpdated {{ device: {}, characteristic: {}, data_len: {} }}",
                device,
                characteristic,
                value.len()
            ),
            RadioEvent::NotifyStateChanged {
                device,
                characteristic,
                notifying,
                ..
            } => write!(
                f,
                "NotifyStateChanged {{ device: {}, characteristic: {}, notifying: {} }}",
                device, characteristic, notifying
            ),
            RadioEvent::WriteWithoutResponseReady { device } => {
                write!(f, "WriteWithoutResponseReady {{ device: {} }}", device)
            }
            RadioEvent::CentralSubscribed {
                central,
                max_update_len,
                ..
            } => write!(
                f,
                "CentralSubscribed {{ central: {}, mtu: {} }}",
                central, max_update_len
            ),
            RadioEvent::CentralUnsubscribed { central, .. } => {
                write!(f, "CentralUnsubscribed {{ central: {} }}", central)
            }
            RadioEvent::CentralDisconnected { central } => {
                write!(f, "CentralDisconnected {{ central: {} }}", central)
            }
            RadioEvent::WriteRequests { requests } => {
                write!(f, "WriteRequests {{ count: {} }}", requests.len())
            }
            RadioEvent::ReadRequest { request } => {
                write!(f, "ReadRequest {{ central: {} }}", request.central)
            }
            RadioEvent::ReadyToUpdateSubscribers => write!(f, "ReadyToUpdateSubscribers"),
        }
    }
}

/// Commands from the session core to the radio stack
///
/// Every command is fire-and-forget: its completion, if any, comes back later
/// as a [`RadioEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RadioCommand {
    /// Scan for peripherals; an empty filter scans for everything
    StartScan { services: Vec<Uuid> },
    StopScan,
    Connect { device: DeviceId },
    CancelConnection { device: DeviceId },
    /// Discover services; an empty filter discovers everything
    DiscoverServices { device: DeviceId, filter: Vec<Uuid> },
    DiscoverCharacteristics {
        device: DeviceId,
        service: Uuid,
        filter: Vec<Uuid>,
    },
    SetNotify {
        device: DeviceId,
        characteristic: CharacteristicId,
        enabled: bool,
    },
    WriteValue {
        device: DeviceId,
        characteristic: CharacteristicId,
        value: Vec<u8>,
        with_response: bool,
    },
    ReadValue {
        device: DeviceId,
        characteristic: CharacteristicId,
    },
    RespondToRequest {
        request_id: u64,
        result: AttResponse,
        value: Option<Vec<u8>>,
    },
    StartAdvertising {
        local_name: String,
        services: Vec<Uuid>,
    },
    StopAdvertising,
    /// Drop every service previously published with `AddService`
    RemoveAllServices,
    AddService { service: ServiceDefinition },
}

impl fmt::Display for RadioCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RadioCommand::StartScan { services } => {
                write!(f, "StartScan {{ filter_len: {} }}", services.len())
            }
            RadioCommand::StopScan => write!(f, "StopScan"),
            RadioCommand::Connect { device } => write!(f, "Connect {{ device: {} }}", device),
            RadioCommand::CancelConnection { device } => {
                write!(f, "CancelConnection {{ device: {} }}", device)
            }
            RadioCommand::DiscoverServices { device, .. } => {
                write!(f, "DiscoverServices {{ device: {} }}", device)
            }
            RadioCommand::DiscoverCharacteristics {
                device, service, ..
            } => write!(
                f,
                "DiscoverCharacteristics {{ device: {}, service: {} }}",
                device, service
            ),
            RadioCommand::SetNotify {
                device,
                characteristic,
                enabled,
            } => write!(
                f,
                "SetNotify {{ device: {}, characteristic: {}, enabled: {} }}",
                device, characteristic, enabled
            ),
            RadioCommand::WriteValue {
                device,
                characteristic,
                value,
                ..
            } => write!(
                f,
                "WriteValue {{ device: {}, characteristic: {}, data_len: {} }}",
                device,
                characteristic,
                value.len()
            ),
            RadioCommand::ReadValue {
                device,
                characteristic,
            } => write!(
                f,
                "ReadValue {{ device: {}, characteristic: {} }}",
                device, characteristic
            ),
            RadioCommand::RespondToRequest {
                request_id, result, ..
            } => write!(
                f,
                "RespondToRequest {{ request_id: {}, result: {:?} }}",
                request_id, result
            ),
            RadioCommand::StartAdvertising { local_name, .. } => {
                write!(f, "StartAdvertising {{ local_name: {} }}", local_name)
            }
            RadioCommand::StopAdvertising => write!(f, "StopAdvertising"),
            RadioCommand::RemoveAllServices => write!(f, "RemoveAllServices"),
            RadioCommand::AddService { service } => {
                write!(f, "AddService {{ uuid: {} }}", service.uuid)
            }
        }
    }
}

/// Platform-specific radio abstraction
///
/// Implementers forward commands to the actual BLE stack and feed its
/// callbacks back into the session as [`RadioEvent`]s. Calls must not block.
#[cfg_attr(test, mockall::automock)]
pub trait RadioBridge: Send + Sync {
    /// Issue an asynchronous radio command
    fn submit(&self, command: RadioCommand);

    /// Notify subscribed centrals with a new value for one of our characteristics.
    ///
    /// Returns `GattError::Backpressure` when the transmit queue is full; the
    /// caller waits for `RadioEvent::ReadyToUpdateSubscribers` before retrying.
    fn update_value(&self, characteristic: Uuid, value: &[u8]) -> Result<(), GattError>;

    /// Largest payload a single write to `device` may carry
    fn max_write_len(&self, device: &DeviceId) -> usize;

    /// Whether `device` can currently accept a write without response
    fn can_write_without_response(&self, device: &DeviceId) -> bool;
}
