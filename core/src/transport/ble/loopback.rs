/// In-process radio bridge
///
/// Records every command and notification instead of touching hardware.
/// Used by the simulator and by tests; backpressure and write limits are
/// programmable so flow-control paths can be driven deterministically.
///
/// [`LoopbackLink`] joins two loopback radios: what one side submits comes
/// back as events for the other.

use crate::transport::abstraction::{
    AttRequest, CharacteristicId, DeviceId, RadioBridge, RadioCommand, RadioEvent,
};
use crate::transport::ble::gatt::{GattError, ServiceDefinition};
use parking_lot::Mutex;
use tracing::trace;
use uuid::Uuid;

/// Default single-write limit reported for every device
pub const DEFAULT_LOOPBACK_WRITE_LEN: usize = 512;

#[derive(Debug)]
struct LoopbackState {
    commands: Vec<RadioCommand>,
    notifications: Vec<(Uuid, Vec<u8>)>,
    refuse_updates: usize,
    // Updates still accepted before the refusals start
    accept_before_refusal: usize,
    max_write_len: usize,
    can_write: bool,
}

#[derive(Debug)]
pub struct LoopbackRadio {
    state: Mutex<LoopbackState>,
}

impl Default for LoopbackRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackRadio {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LoopbackState {
                commands: Vec::new(),
                notifications: Vec::new(),
                refuse_updates: 0,
                accept_before_refusal: 0,
                max_write_len: DEFAULT_LOOPBACK_WRITE_LEN,
                can_write: true,
            }),
        }
    }

    /// Drain the commands submitted so far
    pub fn take_commands(&self) -> Vec<RadioCommand> {
        std::mem::take(&mut self.state.lock().commands)
    }

    pub fn commands(&self) -> Vec<RadioCommand> {
        self.state.lock().commands.clone()
    }

    /// Notifications accepted so far, in delivery order
    pub fn notifications(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.state.lock().notifications.clone()
    }

    pub fn take_notifications(&self) -> Vec<(Uuid, Vec<u8>)> {
        std::mem::take(&mut self.state.lock().notifications)
    }

    /// Refuse the next `count` notifications with [`GattError::Backpressure`]
    pub fn refuse_next_updates(&self, count: usize) {
        self.refuse_updates_after(0, count);
    }

    /// Accept `accepted` more notifications, then refuse the following `count`
    pub fn refuse_updates_after(&self, accepted: usize, count: usize) {
        let mut state = self.state.lock();
        state.accept_before_refusal = accepted;
        state.refuse_updates = count;
    }

    pub fn set_max_write_len(&self, len: usize) {
        self.state.lock().max_write_len = len;
    }

    pub fn set_can_write_without_response(&self, ready: bool) {
        self.state.lock().can_write = ready;
    }
}

impl RadioBridge for LoopbackRadio {
    fn submit(&self, command: RadioCommand) {
        trace!("loopback radio <- {}", command);
        self.state.lock().commands.push(command);
    }

    fn update_value(&self, characteristic: Uuid, value: &[u8]) -> Result<(), GattError> {
        let mut state = self.state.lock();
        if state.accept_before_refusal > 0 {
            state.accept_before_refusal -= 1;
        } else if state.refuse_updates > 0 {
            state.refuse_updates -= 1;
            return Err(GattError::Backpressure);
        }
        state.notifications.push((characteristic, value.to_vec()));
        Ok(())
    }

    fn max_write_len(&self, _device: &DeviceId) -> usize {
        self.state.lock().max_write_len
    }

    fn can_write_without_response(&self, _device: &DeviceId) -> bool {
        self.state.lock().can_write
    }
}

/// Events produced by one [`LoopbackLink::exchange`] pass
#[derive(Debug, Default, Clone, PartialEq)]
pub struct LinkEvents {
    pub to_central: Vec<RadioEvent>,
    pub to_peripheral: Vec<RadioEvent>,
}

impl LinkEvents {
    pub fn is_empty(&self) -> bool {
        self.to_central.is_empty() && self.to_peripheral.is_empty()
    }
}

/// Simulated air between a central radio and a peripheral radio
///
/// Only one link is modelled: the peripheral is known to the central as
/// `peripheral_id` and the central to the peripheral as `central_id`.
#[derive(Debug)]
pub struct LoopbackLink {
    peripheral_id: DeviceId,
    central_id: DeviceId,
    rssi: i16,
    mtu: usize,
    advertised_name: Option<String>,
    scanning: bool,
    connected: bool,
    services: Vec<ServiceDefinition>,
    subscriptions: Vec<CharacteristicId>,
    pending_reads: Vec<(u64, CharacteristicId)>,
    next_request_id: u64,
}

impl LoopbackLink {
    pub fn new(peripheral_id: DeviceId, central_id: DeviceId) -> Self {
        Self {
            peripheral_id,
            central_id,
            rssi: -50,
            mtu: 20,
            advertised_name: None,
            scanning: false,
            connected: false,
            services: Vec::new(),
            subscriptions: Vec::new(),
            pending_reads: Vec::new(),
            next_request_id: 1,
        }
    }

    /// Largest notification the simulated central accepts
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// One advertisement as heard by the central, if it can hear any
    pub fn advertisement(&self) -> Option<RadioEvent> {
        if !self.scanning {
            return None;
        }
        self.advertised_name
            .as_ref()
            .map(|name| RadioEvent::Discovered {
                device: self.peripheral_id.clone(),
                name: Some(name.clone()),
                rssi: self.rssi,
                advertisement: Vec::new(),
            })
    }

    fn service_of(&self, characteristic: Uuid) -> Option<Uuid> {
        self.services
            .iter()
            .find(|s| s.has_characteristic(characteristic))
            .map(|s| s.uuid)
    }

    fn take_request_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    /// Deliver everything both radios submitted since the last pass
    pub fn exchange(&mut self, central: &LoopbackRadio, peripheral: &LoopbackRadio) -> LinkEvents {
        let mut events = LinkEvents::default();

        for command in peripheral.take_commands() {
            self.apply_peripheral(command, &mut events);
        }
        for command in central.take_commands() {
            self.apply_central(command, &mut events);
        }

        for (characteristic, value) in peripheral.take_notifications() {
            let Some(service) = self.service_of(characteristic) else {
                continue;
            };
            let id = CharacteristicId::new(service, characteristic);
            if self.connected && self.subscriptions.contains(&id) {
                events.to_central.push(RadioEvent::ValueUpdated {
                    device: self.peripheral_id.clone(),
                    characteristic: id,
                    value,
                    error: None,
                });
            }
        }

        events
    }

    fn apply_peripheral(&mut self, command: RadioCommand, events: &mut LinkEvents) {
        match command {
            RadioCommand::RemoveAllServices => self.services.clear(),
            RadioCommand::AddService { service } => self.services.push(service),
            RadioCommand::StartAdvertising { local_name, .. } => {
                let first = self.advertised_name.is_none();
                self.advertised_name = Some(local_name);
                if first {
                    events.to_central.extend(self.advertisement());
                }
            }
            RadioCommand::StopAdvertising => self.advertised_name = None,
            RadioCommand::RespondToRequest {
                request_id, value, ..
            } => {
                let pending = self
                    .pending_reads
                    .iter()
                    .position(|(id, _)| *id == request_id);
                if let Some(index) = pending {
                    let (_, characteristic) = self.pending_reads.remove(index);
                    events.to_central.push(RadioEvent::ValueUpdated {
                        device: self.peripheral_id.clone(),
                        characteristic,
                        value: value.unwrap_or_default(),
                        error: None,
                    });
                }
            }
            other => trace!("peripheral radio ignores {}", other),
        }
    }

    fn apply_central(&mut self, command: RadioCommand, events: &mut LinkEvents) {
        match command {
            RadioCommand::StartScan { .. } => {
                self.scanning = true;
                events.to_central.extend(self.advertisement());
            }
            RadioCommand::StopScan => self.scanning = false,
            RadioCommand::Connect { device } => {
                if device == self.peripheral_id && self.advertised_name.is_some() {
                    self.connected = true;
                    events.to_central.push(RadioEvent::Connected { device });
                } else {
                    events.to_central.push(RadioEvent::ConnectFailed {
                        device,
                        error: Some("peripheral out of range".to_string()),
                    });
                }
            }
            RadioCommand::CancelConnection { device } => {
                if self.connected && device == self.peripheral_id {
                    self.connected = false;
                    self.subscriptions.clear();
                    events.to_central.push(RadioEvent::Disconnected {
                        device,
                        error: None,
                    });
                    events.to_peripheral.push(RadioEvent::CentralDisconnected {
                        central: self.central_id.clone(),
                    });
                }
            }
            RadioCommand::DiscoverServices { device, .. } if self.connected => {
                events.to_central.push(RadioEvent::ServicesDiscovered {
                    device,
                    services: self.services.iter().map(|s| s.uuid).collect(),
                    error: None,
                });
            }
            RadioCommand::DiscoverCharacteristics {
                device, service, ..
            } if self.connected => {
                let characteristics = self
                    .services
                    .iter()
                    .find(|s| s.uuid == service)
                    .map(|s| s.characteristics.iter().map(|c| c.uuid).collect())
                    .unwrap_or_default();
                events.to_central.push(RadioEvent::CharacteristicsDiscovered {
                    device,
                    service,
                    characteristics,
                    error: None,
                });
            }
            RadioCommand::SetNotify {
                device,
                characteristic,
                enabled,
            } if self.connected => {
                self.subscriptions.retain(|c| *c != characteristic);
                if enabled {
                    self.subscriptions.push(characteristic);
                    events.to_peripheral.push(RadioEvent::CentralSubscribed {
                        central: self.central_id.clone(),
                        characteristic: characteristic.characteristic,
                        max_update_len: self.mtu,
                    });
                } else {
                    events.to_peripheral.push(RadioEvent::CentralUnsubscribed {
                        central: self.central_id.clone(),
                        characteristic: characteristic.characteristic,
                    });
                }
                events.to_central.push(RadioEvent::NotifyStateChanged {
                    device,
                    characteristic,
                    notifying: enabled,
                    error: None,
                });
            }
            RadioCommand::WriteValue {
                characteristic,
                value,
                ..
            } if self.connected => {
                let request = AttRequest {
                    request_id: self.take_request_id(),
                    central: self.central_id.clone(),
                    characteristic: characteristic.characteristic,
                    value,
                };
                events.to_peripheral.push(RadioEvent::WriteRequests {
                    requests: vec![request],
                });
            }
            RadioCommand::ReadValue { characteristic, .. } if self.connected => {
                let request_id = self.take_request_id();
                self.pending_reads.push((request_id, characteristic));
                events.to_peripheral.push(RadioEvent::ReadRequest {
                    request: AttRequest {
                        request_id,
                        central: self.central_id.clone(),
                        characteristic: characteristic.characteristic,
                        value: Vec::new(),
                    },
                });
            }
            other => trace!("central radio command dropped: {}", other),
        }
    }
}
