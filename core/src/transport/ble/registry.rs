/// Device registry for discovered remote peripherals
///
/// Holds every device seen while scanning, in discovery order. Repeated
/// advertisements merge into the existing entry and refresh its freshness
/// countdown; a periodic tick ages entries out. The service/characteristic graph
/// of a device only exists while it is connected.

use crate::transport::abstraction::{CharacteristicId, DeviceId};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// Connection lifecycle of a remote device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Discovered,
    Connecting,
    Connected,
    Disconnecting,
}

/// A discovered characteristic and whether we subscribed to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicHandle {
    pub id: CharacteristicId,
    pub subscribed: bool,
}

/// A discovered service with its characteristics, in discovery order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicHandle>,
}

/// One discovered BLE device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDevice {
    pub id: DeviceId,
    pub name: Option<String>,
    /// Latest signal strength in dBm
    pub rssi: i16,
    /// Ticks left before the device is evicted
    pub ttl: i32,
    pub state: ConnectionState,
    pub services: Vec<DiscoveredService>,
}

impl RemoteDevice {
    fn new(id: DeviceId, name: Option<String>, rssi: i16, ttl: i32) -> Self {
        Self {
            id,
            name,
            rssi,
            ttl,
            state: ConnectionState::Discovered,
            services: Vec::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Name for display, falling back to the identifier
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("unnamed-device")
    }

    pub fn service(&self, uuid: Uuid) -> Option<&DiscoveredService> {
        self.services.iter().find(|s| s.uuid == uuid)
    }

    pub fn characteristic(&self, id: &CharacteristicId) -> Option<&CharacteristicHandle> {
        self.service(id.service)
            .and_then(|s| s.characteristics.iter().find(|c| c.id == *id))
    }

    fn characteristic_mut(&mut self, id: &CharacteristicId) -> Option<&mut CharacteristicHandle> {
        self.services
            .iter_mut()
            .find(|s| s.uuid == id.service)
            .and_then(|s| s.characteristics.iter_mut().find(|c| c.id == *id))
    }

    /// Every characteristic currently flagged as subscribed
    pub fn subscribed_characteristics(&self) -> Vec<CharacteristicId> {
        self.services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .filter(|c| c.subscribed)
            .map(|c| c.id)
            .collect()
    }

    /// Total number of discovered characteristics across services
    pub fn characteristic_count(&self) -> usize {
        self.services.iter().map(|s| s.characteristics.len()).sum()
    }
}

/// Result of merging an advertisement into the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// First sighting; a new entry was created
    Inserted,
    /// Existing entry refreshed
    Refreshed { rssi_changed: bool },
}

/// Registry of discovered devices keyed by their stable identifier
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: Vec<RemoteDevice>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a device from a discovery event
    ///
    /// A known name is never replaced by an absent one.
    pub fn record_discovery(
        &mut self,
        id: &DeviceId,
        name: Option<String>,
        rssi: i16,
        ttl_ticks: i32,
    ) -> DiscoveryOutcome {
        match self.get_mut(id) {
            Some(device) => {
                if device.name.is_none() {
                    device.name = name;
                }
                device.ttl = ttl_ticks;
                let rssi_changed = device.rssi != rssi;
                device.rssi = rssi;
                DiscoveryOutcome::Refreshed { rssi_changed }
            }
            None => {
                self.devices
                    .push(RemoteDevice::new(id.clone(), name, rssi, ttl_ticks));
                DiscoveryOutcome::Inserted
            }
        }
    }

    /// Age every device by one tick and evict those whose countdown hit zero
    ///
    /// All expired devices are evicted in the same pass. A device with a link
    /// (connecting, connected or disconnecting) stays listed at zero and goes
    /// on the first tick after it is back to `Discovered`.
    pub fn tick(&mut self) -> Vec<RemoteDevice> {
        for device in self.devices.iter_mut() {
            device.ttl = (device.ttl - 1).max(0);
        }

        let (expired, alive): (Vec<_>, Vec<_>) = self
            .devices
            .drain(..)
            .partition(|d| d.ttl <= 0 && d.state == ConnectionState::Discovered);
        self.devices = alive;

        for device in &expired {
            debug!(device = %device.id, "device expired");
        }
        expired
    }

    pub fn get(&self, id: &DeviceId) -> Option<&RemoteDevice> {
        self.devices.iter().find(|d| d.id == *id)
    }

    fn get_mut(&mut self, id: &DeviceId) -> Option<&mut RemoteDevice> {
        self.devices.iter_mut().find(|d| d.id == *id)
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.get(id).is_some()
    }

    pub fn state(&self, id: &DeviceId) -> Option<ConnectionState> {
        self.get(id).map(|d| d.state)
    }

    /// Move a device to `state`; leaving `Connected` clears its graph
    ///
    /// Returns false if the device is unknown.
    pub fn set_state(&mut self, id: &DeviceId, state: ConnectionState) -> bool {
        match self.get_mut(id) {
            Some(device) => {
                device.state = state;
                if state != ConnectionState::Connected {
                    device.services.clear();
                }
                true
            }
            None => false,
        }
    }

    pub fn mark_connected(&mut self, id: &DeviceId) -> bool {
        self.set_state(id, ConnectionState::Connected)
    }

    pub fn mark_disconnected(&mut self, id: &DeviceId) -> bool {
        self.set_state(id, ConnectionState::Discovered)
    }

    /// Append newly discovered services; only valid while connected
    ///
    /// Services already present are kept in place and not duplicated.
    pub fn attach_services(&mut self, id: &DeviceId, services: &[Uuid]) -> bool {
        let Some(device) = self.get_mut(id) else {
            return false;
        };
        if !device.is_connected() {
            return false;
        }
        for uuid in services {
            if device.service(*uuid).is_none() {
                device.services.push(DiscoveredService {
                    uuid: *uuid,
                    characteristics: Vec::new(),
                });
            }
        }
        true
    }

    /// Append characteristics to an attached service; only valid while connected
    ///
    /// New characteristics start unsubscribed.
    pub fn attach_characteristics(
        &mut self,
        id: &DeviceId,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> bool {
        let Some(device) = self.get_mut(id) else {
            return false;
        };
        if !device.is_connected() {
            return false;
        }
        let Some(entry) = device.services.iter_mut().find(|s| s.uuid == service) else {
            return false;
        };
        for uuid in characteristics {
            let handle_id = CharacteristicId::new(service, *uuid);
            if !entry.characteristics.iter().any(|c| c.id == handle_id) {
                entry.characteristics.push(CharacteristicHandle {
                    id: handle_id,
                    subscribed: false,
                });
            }
        }
        true
    }

    /// Set the subscription flag of a characteristic; no-op if unknown
    pub fn set_subscription(
        &mut self,
        id: &DeviceId,
        characteristic: &CharacteristicId,
        subscribed: bool,
    ) -> bool {
        match self
            .get_mut(id)
            .and_then(|d| d.characteristic_mut(characteristic))
        {
            Some(handle) => {
                handle.subscribed = subscribed;
                true
            }
            None => false,
        }
    }

    pub fn devices(&self) -> &[RemoteDevice] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
