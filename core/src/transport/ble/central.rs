/// Central role controller
///
/// Drives scanning, connections, service/characteristic discovery and
/// subscriptions towards remote peripherals. Each remote device follows
/// `Discovered -> Connecting -> Connected -> Disconnecting -> Discovered`; the
/// registry holds the state and this controller is the only one that moves it.
///
/// Commands return immediately after handing a request to the radio; the
/// matching `on_*` handler applies the completion later.

use crate::session::SessionLog;
use crate::settings::SessionSettings;
use crate::transport::abstraction::{
    CharacteristicId, DeviceId, PowerState, RadioBridge, RadioCommand, Role,
};
use crate::transport::ble::gatt::DATA_CHARACTERISTIC_UUID;
use crate::transport::ble::registry::{ConnectionState, DeviceRegistry, DiscoveryOutcome};
use crate::transport::ble::transfer::MessageAssembler;
use crate::{BleError, GuardViolation, SessionError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The single characteristic the central side currently reads notifications
/// from and writes messages to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundChannel {
    pub device: DeviceId,
    pub characteristic: CharacteristicId,
}

pub struct CentralController {
    radio: Arc<dyn RadioBridge>,
    power: PowerState,
    scanning: bool,
    inbound: Option<InboundChannel>,
    target: Uuid,
    auto_subscribe: bool,
    ttl_ticks: i32,
    rssi_floor_dbm: i16,
    assembler: MessageAssembler,
}

impl CentralController {
    pub fn new(radio: Arc<dyn RadioBridge>, settings: &SessionSettings) -> Self {
        Self {
            radio,
            power: PowerState::Unknown,
            scanning: false,
            inbound: None,
            target: settings.target_uuid().unwrap_or(DATA_CHARACTERISTIC_UUID),
            auto_subscribe: settings.auto_subscribe,
            ttl_ticks: settings.ttl_ticks,
            rssi_floor_dbm: settings.rssi_floor_dbm,
            assembler: MessageAssembler::default(),
        }
    }

    pub fn power(&self) -> PowerState {
        self.power
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn inbound(&self) -> Option<&InboundChannel> {
        self.inbound.as_ref()
    }

    /// Characteristic targeted for automatic subscription
    pub fn target_characteristic(&self) -> Uuid {
        self.target
    }

    /// Retarget the central role by raw UUID string
    pub fn set_target_characteristic(&mut self, raw: &str) -> Result<Uuid, SessionError> {
        let uuid =
            Uuid::parse_str(raw.trim()).map_err(|_| SessionError::InvalidUuid(raw.to_string()))?;
        self.target = uuid;
        info!(target_characteristic = %uuid, "central target characteristic changed");
        Ok(uuid)
    }

    pub fn on_power_state(&mut self, state: PowerState) {
        info!(role = %Role::Central, "State: {}", state);
        self.power = state;
        if !state.is_on() && self.scanning {
            self.scanning = false;
            debug!("scan flag cleared after central radio left powered-on state");
        }
    }

    // ------------------------------------------------------------------------
    // Scanning
    // ------------------------------------------------------------------------

    /// Start scanning for every peripheral
    pub fn start_scan(&mut self) -> Result<(), BleError> {
        if self.scanning {
            return Ok(());
        }
        if !self.power.is_on() {
            return Err(GuardViolation::RadioNotPowered(Role::Central).into());
        }
        self.radio.submit(RadioCommand::StartScan {
            services: Vec::new(),
        });
        self.scanning = true;
        info!("scan started");
        Ok(())
    }

    pub fn stop_scan(&mut self) -> Result<(), BleError> {
        if !self.scanning {
            return Ok(());
        }
        self.radio.submit(RadioCommand::StopScan);
        self.scanning = false;
        info!("scan stopped");
        Ok(())
    }

    /// Merge an advertisement into the registry
    ///
    /// Returns `None` when the signal is below the floor and the advertisement
    /// was ignored.
    pub fn on_discovered(
        &mut self,
        registry: &mut DeviceRegistry,
        device: &DeviceId,
        name: Option<String>,
        rssi: i16,
    ) -> Option<DiscoveryOutcome> {
        if rssi < self.rssi_floor_dbm {
            debug!(device = %device, rssi, "Discovered peripheral not in expected range");
            return None;
        }
        let outcome = registry.record_discovery(device, name, rssi, self.ttl_ticks);
        if outcome == DiscoveryOutcome::Inserted {
            debug!(device = %device, rssi, "new peripheral discovered");
        }
        Some(outcome)
    }

    // ------------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------------

    pub fn connect(&mut self, registry: &mut DeviceRegistry, device: &DeviceId) -> Result<(), BleError> {
        let state = registry
            .state(device)
            .ok_or_else(|| GuardViolation::UnknownDevice(device.clone()))?;
        if state == ConnectionState::Connected {
            debug!(device = %device, "Already Connected");
            return Ok(());
        }
        self.radio.submit(RadioCommand::Connect {
            device: device.clone(),
        });
        registry.set_state(device, ConnectionState::Connecting);
        info!(device = %device, "connecting");
        Ok(())
    }

    /// Unsubscribe from everything on `device`, then drop the link
    pub fn disconnect(
        &mut self,
        registry: &mut DeviceRegistry,
        device: &DeviceId,
    ) -> Result<(), BleError> {
        let remote = registry
            .get(device)
            .ok_or_else(|| GuardViolation::UnknownDevice(device.clone()))?;
        if !remote.is_connected() {
            debug!(device = %device, "Already Disconnected");
            return Ok(());
        }

        for characteristic in remote.subscribed_characteristics() {
            self.radio.submit(RadioCommand::SetNotify {
                device: device.clone(),
                characteristic,
                enabled: false,
            });
        }
        self.radio.submit(RadioCommand::CancelConnection {
            device: device.clone(),
        });
        registry.set_state(device, ConnectionState::Disconnecting);
        self.release_inbound(device);
        info!(device = %device, "disconnecting");
        Ok(())
    }

    pub fn on_connected(
        &mut self,
        registry: &mut DeviceRegistry,
        device: &DeviceId,
    ) -> Result<(), BleError> {
        let remote = registry
            .get(device)
            .ok_or_else(|| GuardViolation::UnknownDevice(device.clone()))?;
        if !remote.is_connected() {
            info!(device = %device, name = remote.display_name(), "didConnect");
        }
        registry.mark_connected(device);
        self.radio.submit(RadioCommand::DiscoverServices {
            device: device.clone(),
            filter: Vec::new(),
        });
        Ok(())
    }

    /// A connect attempt failed; the device stays listed as discovered
    pub fn on_connect_failed(
        &mut self,
        registry: &mut DeviceRegistry,
        device: &DeviceId,
        error: Option<String>,
    ) -> Result<(), BleError> {
        registry.set_state(device, ConnectionState::Discovered);
        Err(BleError::Transport(format!(
            "failed to connect to {}: {}",
            device,
            error.as_deref().unwrap_or("Error")
        )))
    }

    pub fn on_disconnected(
        &mut self,
        registry: &mut DeviceRegistry,
        device: &DeviceId,
        error: Option<String>,
    ) -> Result<(), BleError> {
        if registry.mark_disconnected(device) {
            info!(device = %device, "didDisconnectPeripheral");
        }
        self.release_inbound(device);
        match error {
            Some(error) => Err(BleError::Transport(format!(
                "link to {} lost: {}",
                device, error
            ))),
            None => Ok(()),
        }
    }

    fn release_inbound(&mut self, device: &DeviceId) {
        if self
            .inbound
            .as_ref()
            .is_some_and(|channel| channel.device == *device)
        {
            self.inbound = None;
            self.assembler.reset();
        }
    }

    // ------------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------------

    pub fn on_services_discovered(
        &mut self,
        registry: &mut DeviceRegistry,
        device: &DeviceId,
        services: &[Uuid],
        error: Option<String>,
    ) -> Result<(), BleError> {
        if let Some(error) = error {
            return Err(BleError::Transport(format!(
                "Error discovering services: {}",
                error
            )));
        }
        if !registry.attach_services(device, services) {
            debug!(device = %device, "ignoring services for device that is not connected");
            return Ok(());
        }
        for service in services {
            debug!(device = %device, service = %service, "Discovered Service");
            self.radio.submit(RadioCommand::DiscoverCharacteristics {
                device: device.clone(),
                service: *service,
                filter: Vec::new(),
            });
        }
        Ok(())
    }

    /// The peripheral invalidated services; discover everything again
    pub fn on_services_invalidated(
        &mut self,
        registry: &DeviceRegistry,
        device: &DeviceId,
        services: &[Uuid],
    ) {
        if !registry.get(device).is_some_and(|d| d.is_connected()) {
            return;
        }
        info!(device = %device, count = services.len(), "services invalidated - rediscover services");
        self.radio.submit(RadioCommand::DiscoverServices {
            device: device.clone(),
            filter: Vec::new(),
        });
    }

    pub fn on_characteristics_discovered(
        &mut self,
        registry: &mut DeviceRegistry,
        log: &mut SessionLog,
        device: &DeviceId,
        service: Uuid,
        characteristics: &[Uuid],
        error: Option<String>,
    ) -> Result<(), BleError> {
        if let Some(error) = error {
            return Err(BleError::Transport(format!(
                "Error discovering characteristics: {}",
                error
            )));
        }
        if !registry.attach_characteristics(device, service, characteristics) {
            debug!(device = %device, service = %service, "ignoring characteristics outside a connected service");
            return Ok(());
        }

        for uuid in characteristics {
            let text = uuid.to_string();
            log.append(format!("C: {} ({})", text, &text[..4]));
        }

        if self.auto_subscribe && characteristics.contains(&self.target) {
            self.subscribe(
                registry,
                log,
                device,
                CharacteristicId::new(service, self.target),
            )?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Subscriptions and data
    // ------------------------------------------------------------------------

    fn require_characteristic(
        registry: &DeviceRegistry,
        device: &DeviceId,
        characteristic: &CharacteristicId,
    ) -> Result<(), GuardViolation> {
        let remote = registry
            .get(device)
            .ok_or_else(|| GuardViolation::UnknownDevice(device.clone()))?;
        if !remote.is_connected() {
            return Err(GuardViolation::NotConnected(device.clone()));
        }
        if remote.characteristic(characteristic).is_none() {
            return Err(GuardViolation::UnknownCharacteristic(*characteristic));
        }
        Ok(())
    }

    /// Enable notifications and make this the inbound channel
    ///
    /// Only one inbound channel is tracked; subscribing elsewhere replaces it.
    pub fn subscribe(
        &mut self,
        registry: &mut DeviceRegistry,
        log: &mut SessionLog,
        device: &DeviceId,
        characteristic: CharacteristicId,
    ) -> Result<(), BleError> {
        Self::require_characteristic(registry, device, &characteristic)?;

        self.radio.submit(RadioCommand::SetNotify {
            device: device.clone(),
            characteristic,
            enabled: true,
        });
        registry.set_subscription(device, &characteristic, true);

        let channel = InboundChannel {
            device: device.clone(),
            characteristic,
        };
        if self.inbound.as_ref() != Some(&channel) {
            self.assembler.reset();
            self.inbound = Some(channel);
        }
        log.append(format!("Sub2: {}", characteristic.characteristic));
        Ok(())
    }

    pub fn unsubscribe(
        &mut self,
        registry: &mut DeviceRegistry,
        log: &mut SessionLog,
        device: &DeviceId,
        characteristic: CharacteristicId,
    ) -> Result<(), BleError> {
        Self::require_characteristic(registry, device, &characteristic)?;

        self.radio.submit(RadioCommand::SetNotify {
            device: device.clone(),
            characteristic,
            enabled: false,
        });
        registry.set_subscription(device, &characteristic, false);

        if self
            .inbound
            .as_ref()
            .is_some_and(|c| c.device == *device && c.characteristic == characteristic)
        {
            self.inbound = None;
            self.assembler.reset();
        }
        log.append(format!("Unsub: {}", characteristic.characteristic));
        Ok(())
    }

    pub fn read(
        &mut self,
        registry: &DeviceRegistry,
        device: &DeviceId,
        characteristic: CharacteristicId,
    ) -> Result<(), BleError> {
        Self::require_characteristic(registry, device, &characteristic)?;
        self.radio.submit(RadioCommand::ReadValue {
            device: device.clone(),
            characteristic,
        });
        Ok(())
    }

    /// Write a short text message to the inbound channel of `device`
    ///
    /// Never chunked: the message must fit one write.
    pub fn send_message(
        &mut self,
        registry: &DeviceRegistry,
        device: &DeviceId,
        text: &str,
    ) -> Result<(), BleError> {
        let channel = self
            .inbound
            .as_ref()
            .filter(|c| c.device == *device)
            .ok_or_else(|| GuardViolation::NoOutboundChannel(device.clone()))?;
        if !registry.get(device).is_some_and(|d| d.is_connected()) {
            return Err(GuardViolation::NotConnected(device.clone()).into());
        }
        if !self.radio.can_write_without_response(device) {
            return Err(GuardViolation::WriteNotReady(device.clone()).into());
        }

        let data = text.as_bytes();
        let max = self.radio.max_write_len(device);
        if data.len() >= max {
            return Err(GuardViolation::PayloadTooLarge {
                len: data.len(),
                max,
            }
            .into());
        }

        debug!(device = %device, bytes = data.len(), "Writing message");
        self.radio.submit(RadioCommand::WriteValue {
            device: device.clone(),
            characteristic: channel.characteristic,
            value: data.to_vec(),
            with_response: true,
        });
        Ok(())
    }

    /// Handle a notification or read response
    ///
    /// Decoded text is appended to the session log. Values on the inbound
    /// channel also feed the reassembler; a completed message is returned.
    pub fn on_value_updated(
        &mut self,
        log: &mut SessionLog,
        device: &DeviceId,
        characteristic: CharacteristicId,
        value: &[u8],
        error: Option<String>,
    ) -> Result<Option<String>, BleError> {
        if let Some(error) = error {
            return Err(BleError::Transport(format!(
                "Error reading {} on {}: {}",
                characteristic, device, error
            )));
        }

        let on_inbound = self
            .inbound
            .as_ref()
            .is_some_and(|c| c.device == *device && c.characteristic == characteristic);
        let assembled = if on_inbound {
            self.assembler.push(value)
        } else {
            Ok(None)
        };

        match std::str::from_utf8(value) {
            Ok(text) => {
                debug!(device = %device, bytes = value.len(), "Received {}", text);
                log.append(text);
            }
            Err(_) => debug!(device = %device, bytes = value.len(), "dropping undecodable value"),
        }

        match assembled? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| BleError::Protocol(format!("assembled message is not UTF-8: {}", e))),
            None => Ok(None),
        }
    }

    pub fn on_notify_state_changed(
        &mut self,
        device: &DeviceId,
        characteristic: CharacteristicId,
        notifying: bool,
        error: Option<String>,
    ) -> Result<(), BleError> {
        if let Some(error) = error {
            return Err(BleError::Transport(format!(
                "Error changing notification state: {}",
                error
            )));
        }
        if notifying {
            info!(device = %device, characteristic = %characteristic, "Notification began");
        } else {
            info!(device = %device, characteristic = %characteristic, "Notification stopped");
        }
        Ok(())
    }

    pub fn on_write_ready(&self, device: &DeviceId) {
        debug!(device = %device, "Peripheral is ready for write without response");
    }
}

impl std::fmt::Debug for CentralController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CentralController")
            .field("power", &self.power)
            .field("scanning", &self.scanning)
            .field("inbound", &self.inbound)
            .field("target", &self.target)
            .finish()
    }
}
