// Session manager: composition root of both GATT roles
//
// Owns the device registry and both role controllers, exposes one command
// surface and one snapshot. Every failure is logged here and never propagated:
// after any single error the session keeps running.

pub mod runtime;
pub mod state;

pub use runtime::{spawn_session, SessionHandle};
pub use state::{SessionLog, SessionSnapshot, LOG_HEADER};

use crate::settings::{SessionSettings, SettingsError};
use crate::transport::abstraction::{CharacteristicId, DeviceId, RadioBridge, RadioEvent, Role};
use crate::transport::ble::central::CentralController;
use crate::transport::ble::peripheral::PeripheralController;
use crate::transport::ble::registry::{DeviceRegistry, DiscoveryOutcome};
use crate::BleError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Decoded notifications kept for the snapshot, oldest dropped first
pub const MAX_RECEIVED_MESSAGES: usize = 64;

/// Operations accepted by the session manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionCommand {
    StartScan,
    StopScan,
    StartAdvertising,
    StopAdvertising,
    Connect {
        device: DeviceId,
    },
    Disconnect {
        device: DeviceId,
    },
    Subscribe {
        device: DeviceId,
        characteristic: CharacteristicId,
    },
    Unsubscribe {
        device: DeviceId,
        characteristic: CharacteristicId,
    },
    Read {
        device: DeviceId,
        characteristic: CharacteristicId,
    },
    /// Single-write text message to a connected peripheral
    SendMessage {
        device: DeviceId,
        text: String,
    },
    /// Chunked notification transfer to the subscribed central
    Send {
        payload: Vec<u8>,
    },
    /// Retarget the central role, by raw UUID string
    SetTargetCharacteristic {
        uuid: String,
    },
}

pub struct BleSession {
    settings: SessionSettings,
    registry: DeviceRegistry,
    central: CentralController,
    peripheral: PeripheralController,
    log: SessionLog,
    last_updated: Option<DeviceId>,
    received_messages: Vec<String>,
    // Set by anything that may alter the snapshot
    dirty: bool,
}

impl BleSession {
    pub fn new(settings: SessionSettings, radio: Arc<dyn RadioBridge>) -> Result<Self, SettingsError> {
        settings.validate()?;
        Ok(Self {
            central: CentralController::new(radio.clone(), &settings),
            peripheral: PeripheralController::new(radio, &settings),
            registry: DeviceRegistry::new(),
            log: SessionLog::default(),
            last_updated: None,
            received_messages: Vec::new(),
            dirty: true,
            settings,
        })
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn central(&self) -> &CentralController {
        &self.central
    }

    pub fn peripheral(&self) -> &PeripheralController {
        &self.peripheral
    }

    pub fn log(&self) -> &SessionLog {
        &self.log
    }

    pub fn last_updated(&self) -> Option<&DeviceId> {
        self.last_updated.as_ref()
    }

    pub fn received_messages(&self) -> &[String] {
        &self.received_messages
    }

    /// Whether the snapshot may have changed since the last call
    pub fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Run one command; failures are logged and dropped
    pub fn execute(&mut self, command: SessionCommand) {
        debug!(?command, "session command");
        self.dirty = true;
        let result = match command {
            SessionCommand::StartScan => self.central.start_scan(),
            SessionCommand::StopScan => self.central.stop_scan(),
            SessionCommand::StartAdvertising => self.peripheral.start_advertising(),
            SessionCommand::StopAdvertising => self.peripheral.stop_advertising(),
            SessionCommand::Connect { device } => self.central.connect(&mut self.registry, &device),
            SessionCommand::Disconnect { device } => {
                self.central.disconnect(&mut self.registry, &device)
            }
            SessionCommand::Subscribe {
                device,
                characteristic,
            } => self
                .central
                .subscribe(&mut self.registry, &mut self.log, &device, characteristic),
            SessionCommand::Unsubscribe {
                device,
                characteristic,
            } => self
                .central
                .unsubscribe(&mut self.registry, &mut self.log, &device, characteristic),
            SessionCommand::Read {
                device,
                characteristic,
            } => self.central.read(&self.registry, &device, characteristic),
            SessionCommand::SendMessage { device, text } => {
                self.central.send_message(&self.registry, &device, &text)
            }
            SessionCommand::Send { payload } => self.peripheral.send(payload).map(|_| ()),
            SessionCommand::SetTargetCharacteristic { uuid } => {
                if let Err(e) = self.central.set_target_characteristic(&uuid) {
                    warn!("{}", e);
                }
                Ok(())
            }
        };
        Self::report(result);
    }

    /// Route one radio event to the controller owning it
    pub fn handle_event(&mut self, event: RadioEvent) {
        debug!("radio event: {}", event);
        self.dirty = true;
        let result = match event {
            RadioEvent::PowerStateChanged { role, state } => {
                match role {
                    Role::Central => self.central.on_power_state(state),
                    Role::Peripheral => self.peripheral.on_power_state(state),
                }
                Ok(())
            }
            RadioEvent::Discovered {
                device, name, rssi, ..
            } => {
                match self
                    .central
                    .on_discovered(&mut self.registry, &device, name, rssi)
                {
                    Some(DiscoveryOutcome::Inserted)
                    | Some(DiscoveryOutcome::Refreshed { rssi_changed: true }) => {
                        self.last_updated = Some(device);
                    }
                    _ => {}
                }
                Ok(())
            }
            RadioEvent::Connected { device } => self.central.on_connected(&mut self.registry, &device),
            RadioEvent::ConnectFailed { device, error } => {
                self.central
                    .on_connect_failed(&mut self.registry, &device, error)
            }
            RadioEvent::Disconnected { device, error } => {
                self.central
                    .on_disconnected(&mut self.registry, &device, error)
            }
            RadioEvent::ServicesDiscovered {
                device,
                services,
                error,
            } => self
                .central
                .on_services_discovered(&mut self.registry, &device, &services, error),
            RadioEvent::ServicesInvalidated { device, services } => {
                self.central
                    .on_services_invalidated(&self.registry, &device, &services);
                Ok(())
            }
            RadioEvent::CharacteristicsDiscovered {
                device,
                service,
                characteristics,
                error,
            } => self.central.on_characteristics_discovered(
                &mut self.registry,
                &mut self.log,
                &device,
                service,
                &characteristics,
                error,
            ),
            RadioEvent::ValueUpdated {
                device,
                characteristic,
                value,
                error,
            } => self
                .central
                .on_value_updated(&mut self.log, &device, characteristic, &value, error)
                .map(|message| {
                    if let Some(message) = message {
                        self.record_message(message);
                    }
                }),
            RadioEvent::NotifyStateChanged {
                device,
                characteristic,
                notifying,
                error,
            } => self
                .central
                .on_notify_state_changed(&device, characteristic, notifying, error),
            RadioEvent::WriteWithoutResponseReady { device } => {
                self.central.on_write_ready(&device);
                Ok(())
            }
            RadioEvent::CentralSubscribed {
                central,
                characteristic,
                max_update_len,
            } => {
                self.peripheral
                    .on_subscribed(central, characteristic, max_update_len);
                Ok(())
            }
            RadioEvent::CentralUnsubscribed { central, .. } => {
                self.peripheral.on_unsubscribed(&central);
                Ok(())
            }
            RadioEvent::CentralDisconnected { central } => {
                self.peripheral.on_central_disconnected(&central);
                Ok(())
            }
            RadioEvent::WriteRequests { requests } => {
                self.peripheral.on_write_requests(&requests);
                Ok(())
            }
            RadioEvent::ReadRequest { request } => {
                self.peripheral.on_read_request(&request);
                Ok(())
            }
            RadioEvent::ReadyToUpdateSubscribers => self.peripheral.on_ready_to_send().map(|_| ()),
        };
        Self::report(result);
    }

    /// Freshness tick: age every device and release the expired ones
    pub fn tick(&mut self) {
        if self.registry.is_empty() {
            return;
        }
        self.dirty = true;
        for device in self.registry.tick() {
            if self.last_updated.as_ref() == Some(&device.id) {
                self.last_updated = None;
            }
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            devices: self.registry.devices().to_vec(),
            log: self.log.as_str().to_string(),
            last_updated: self.last_updated.clone(),
            scanning: self.central.is_scanning(),
            advertising: self.peripheral.is_advertising(),
            central_power: self.central.power(),
            peripheral_power: self.peripheral.power(),
            subscriber: self.peripheral.subscriber().cloned(),
            inbound: self.central.inbound().cloned(),
            received_messages: self.received_messages.clone(),
            last_write_received: self.peripheral.last_write_received().map(str::to_string),
        }
    }

    fn record_message(&mut self, message: String) {
        if self.received_messages.len() == MAX_RECEIVED_MESSAGES {
            self.received_messages.remove(0);
        }
        self.received_messages.push(message);
    }

    fn report(result: Result<(), BleError>) {
        match result {
            Ok(()) => {}
            Err(BleError::Transport(e)) => warn!("{}", e),
            Err(e @ BleError::Protocol(_)) => debug!("dropped: {}", e),
            Err(e @ BleError::Guard(_)) => debug!("ignored: {}", e),
        }
    }
}

impl std::fmt::Debug for BleSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleSession")
            .field("devices", &self.registry.len())
            .field("central", &self.central)
            .field("peripheral", &self.peripheral)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::abstraction::{PowerState, RadioCommand};
    use crate::transport::ble::gatt::{DATA_CHARACTERISTIC_UUID, TRANSFER_SERVICE_UUID};
    use crate::transport::ble::loopback::LoopbackRadio;
    use crate::transport::ble::registry::ConnectionState;

    fn session() -> (Arc<LoopbackRadio>, BleSession) {
        let radio = Arc::new(LoopbackRadio::new());
        let mut session =
            BleSession::new(SessionSettings::default(), radio.clone()).expect("session");
        session.handle_event(RadioEvent::PowerStateChanged {
            role: Role::Central,
            state: PowerState::On,
        });
        session.handle_event(RadioEvent::PowerStateChanged {
            role: Role::Peripheral,
            state: PowerState::On,
        });
        radio.take_commands();
        (radio, session)
    }

    fn discovered(id: &str, rssi: i16) -> RadioEvent {
        RadioEvent::Discovered {
            device: DeviceId::from(id),
            name: Some(id.to_uppercase()),
            rssi,
            advertisement: Vec::new(),
        }
    }

    #[test]
    fn test_rejects_invalid_settings() {
        let settings = SessionSettings {
            ttl_ticks: 0,
            ..Default::default()
        };
        assert!(BleSession::new(settings, Arc::new(LoopbackRadio::new())).is_err());
    }

    #[test]
    fn test_discovery_then_ticks_evict() {
        let (_radio, mut session) = session();
        session.handle_event(discovered("d1", -60));

        for _ in 0..8 {
            session.tick();
        }
        assert_eq!(session.registry().get(&DeviceId::from("d1")).map(|d| d.ttl), Some(1));

        session.tick();
        assert!(session.registry().is_empty());
        assert!(session.last_updated().is_none());
    }

    #[test]
    fn test_rediscovery_resets_ttl_and_marks_updated() {
        let (_radio, mut session) = session();
        session.handle_event(discovered("d1", -60));
        session.handle_event(discovered("d2", -70));
        session.tick();
        session.tick();

        session.handle_event(discovered("d1", -55));

        let device = session.registry().get(&DeviceId::from("d1")).expect("device");
        assert_eq!(device.ttl, 9);
        assert_eq!(device.rssi, -55);
        assert_eq!(session.last_updated(), Some(&DeviceId::from("d1")));
    }

    #[test]
    fn test_unchanged_rssi_keeps_last_updated() {
        let (_radio, mut session) = session();
        session.handle_event(discovered("d1", -60));
        session.handle_event(discovered("d2", -70));

        session.handle_event(discovered("d1", -60));

        assert_eq!(session.last_updated(), Some(&DeviceId::from("d2")));
    }

    #[test]
    fn test_errors_do_not_stop_the_session() {
        let (radio, mut session) = session();

        session.execute(SessionCommand::Connect {
            device: DeviceId::from("ghost"),
        });
        session.handle_event(RadioEvent::ValueUpdated {
            device: DeviceId::from("ghost"),
            characteristic: CharacteristicId::new(TRANSFER_SERVICE_UUID, DATA_CHARACTERISTIC_UUID),
            value: vec![0xC3, 0x28],
            error: None,
        });
        session.execute(SessionCommand::SetTargetCharacteristic {
            uuid: "nope".to_string(),
        });
        session.execute(SessionCommand::StartScan);

        assert_eq!(
            radio.take_commands(),
            vec![RadioCommand::StartScan {
                services: Vec::new()
            }]
        );
        assert!(session.snapshot().scanning);
    }

    #[test]
    fn test_connect_flow_through_commands() {
        let (radio, mut session) = session();
        let device = DeviceId::from("d1");
        session.handle_event(discovered("d1", -40));

        session.execute(SessionCommand::Connect {
            device: device.clone(),
        });
        session.handle_event(RadioEvent::Connected {
            device: device.clone(),
        });

        assert_eq!(
            session.registry().state(&device),
            Some(ConnectionState::Connected)
        );
        assert_eq!(radio.take_commands().len(), 2);
    }

    #[test]
    fn test_connected_device_outlives_ttl() {
        let (radio, mut session) = session();
        let device = DeviceId::from("d1");
        session.handle_event(discovered("d1", -40));
        session.execute(SessionCommand::Connect {
            device: device.clone(),
        });
        session.handle_event(RadioEvent::Connected {
            device: device.clone(),
        });
        radio.take_commands();

        for _ in 0..20 {
            session.tick();
        }

        assert_eq!(
            session.registry().state(&device),
            Some(ConnectionState::Connected)
        );
        assert!(radio.take_commands().is_empty());

        session.handle_event(RadioEvent::Disconnected {
            device: device.clone(),
            error: None,
        });
        session.tick();
        assert!(session.registry().is_empty());
    }

    #[test]
    fn test_snapshot_reflects_session() {
        let (_radio, mut session) = session();
        session.execute(SessionCommand::StartAdvertising);
        session.handle_event(discovered("d1", -40));
        session.handle_event(RadioEvent::CentralSubscribed {
            central: DeviceId::from("c1"),
            characteristic: DATA_CHARACTERISTIC_UUID,
            max_update_len: 20,
        });

        let snapshot = session.snapshot();

        assert!(snapshot.advertising);
        assert_eq!(snapshot.central_power, PowerState::On);
        assert_eq!(snapshot.devices.len(), 1);
        assert_eq!(snapshot.last_updated, Some(DeviceId::from("d1")));
        assert_eq!(
            snapshot.subscriber.map(|s| s.max_update_len),
            Some(20)
        );
        assert!(snapshot.log.starts_with(LOG_HEADER));
    }

    #[test]
    fn test_idle_tick_leaves_snapshot_unchanged() {
        let (_radio, mut session) = session();
        session.take_changed();

        session.tick();
        assert!(!session.take_changed());

        session.handle_event(discovered("d1", -60));
        assert!(session.take_changed());
        session.tick();
        assert!(session.take_changed());
    }

    #[test]
    fn test_received_messages_drop_oldest() {
        let (_radio, mut session) = session();

        for i in 0..MAX_RECEIVED_MESSAGES + 3 {
            session.record_message(format!("m{}", i));
        }

        let messages = session.received_messages();
        assert_eq!(messages.len(), MAX_RECEIVED_MESSAGES);
        assert_eq!(messages[0], "m3");
        assert_eq!(
            messages.last().map(String::as_str),
            Some(format!("m{}", MAX_RECEIVED_MESSAGES + 2).as_str())
        );
    }

}
