// btleplug radio bridge: central role on a desktop adapter
//
// The session submits commands synchronously; a worker task performs them on
// the adapter and feeds completions back through the session handle. The
// peripheral role is reported as unsupported: btleplug cannot advertise.

use anyhow::{Context, Result};
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use gattduo_core::transport::ble::GattError;
use gattduo_core::{
    CharacteristicId, DeviceId, PowerState, RadioBridge, RadioCommand, RadioEvent, Role,
    SessionHandle,
};
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// ATT payload of the default 23-byte MTU; btleplug does not report the
/// negotiated value
const DEFAULT_ATT_PAYLOAD: usize = 20;

pub struct BtleplugRadio {
    commands: mpsc::UnboundedSender<RadioCommand>,
}

impl BtleplugRadio {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RadioCommand>) {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        (Self { commands }, commands_rx)
    }
}

impl RadioBridge for BtleplugRadio {
    fn submit(&self, command: RadioCommand) {
        if self.commands.send(command).is_err() {
            debug!("btleplug worker stopped, command dropped");
        }
    }

    fn update_value(&self, _characteristic: Uuid, _value: &[u8]) -> Result<(), GattError> {
        Err(GattError::Unsupported)
    }

    fn max_write_len(&self, _device: &DeviceId) -> usize {
        DEFAULT_ATT_PAYLOAD
    }

    fn can_write_without_response(&self, _device: &DeviceId) -> bool {
        true
    }
}

/// Get the default Bluetooth adapter
pub async fn default_adapter() -> Result<Adapter> {
    let manager = Manager::new().await.context("Failed to start BLE manager")?;
    let adapters = manager.adapters().await.context("Failed to list adapters")?;
    adapters
        .into_iter()
        .next()
        .context("No Bluetooth adapter found")
}

fn connect_event(device: DeviceId, result: Result<(), String>) -> RadioEvent {
    match result {
        Ok(()) => RadioEvent::Connected { device },
        Err(error) => RadioEvent::ConnectFailed {
            device,
            error: Some(error),
        },
    }
}

struct Worker {
    adapter: Adapter,
    session: SessionHandle,
    peripherals: HashMap<DeviceId, Peripheral>,
    // Devices whose notification stream is already forwarded
    forwarding: HashSet<DeviceId>,
}

/// Drive `adapter` on behalf of the session until either side goes away
pub async fn run_worker(
    adapter: Adapter,
    mut commands: mpsc::UnboundedReceiver<RadioCommand>,
    session: SessionHandle,
) -> Result<()> {
    let mut events = adapter
        .events()
        .await
        .context("Failed to subscribe to adapter events")?;
    let mut worker = Worker {
        adapter,
        session,
        peripherals: HashMap::new(),
        forwarding: HashSet::new(),
    };

    worker
        .emit(RadioEvent::PowerStateChanged {
            role: Role::Central,
            state: PowerState::On,
        })
        .await?;
    worker
        .emit(RadioEvent::PowerStateChanged {
            role: Role::Peripheral,
            state: PowerState::Unsupported,
        })
        .await?;

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                if let Err(e) = worker.apply(command).await {
                    warn!("btleplug command failed: {:#}", e);
                }
            }
            event = events.next() => {
                let Some(event) = event else { break };
                worker.on_central_event(event).await?;
            }
        }
    }

    info!("btleplug worker stopped");
    Ok(())
}

impl Worker {
    async fn emit(&self, event: RadioEvent) -> Result<()> {
        self.session
            .radio_event(event)
            .await
            .context("Session stopped")
    }

    fn peripheral(&self, device: &DeviceId) -> Result<&Peripheral> {
        self.peripherals
            .get(device)
            .with_context(|| format!("Unknown peripheral {}", device))
    }

    fn characteristic(&self, device: &DeviceId, id: &CharacteristicId) -> Result<Characteristic> {
        self.peripheral(device)?
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == id.characteristic && c.service_uuid == id.service)
            .with_context(|| format!("Unknown characteristic {}", id))
    }

    async fn on_central_event(&mut self, event: CentralEvent) -> Result<()> {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                let peripheral = match self.adapter.peripheral(&id).await {
                    Ok(peripheral) => peripheral,
                    Err(e) => {
                        debug!("peripheral vanished: {}", e);
                        return Ok(());
                    }
                };
                let Ok(Some(properties)) = peripheral.properties().await else {
                    return Ok(());
                };
                let Some(rssi) = properties.rssi else {
                    return Ok(());
                };
                let device = DeviceId::new(peripheral.id().to_string());
                let advertisement = properties
                    .manufacturer_data
                    .values()
                    .flatten()
                    .copied()
                    .collect();
                self.peripherals.insert(device.clone(), peripheral);
                self.emit(RadioEvent::Discovered {
                    device,
                    name: properties.local_name,
                    rssi,
                    advertisement,
                })
                .await?;
            }
            CentralEvent::DeviceDisconnected(id) => {
                let device = DeviceId::new(id.to_string());
                // The stream ends with the link
                self.forwarding.remove(&device);
                self.emit(RadioEvent::Disconnected {
                    device,
                    error: None,
                })
                .await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn apply(&mut self, command: RadioCommand) -> Result<()> {
        match command {
            RadioCommand::StartScan { services } => {
                self.adapter
                    .start_scan(ScanFilter { services })
                    .await
                    .context("Failed to start scan")?;
            }
            RadioCommand::StopScan => {
                self.adapter.stop_scan().await.context("Failed to stop scan")?;
            }
            RadioCommand::Connect { device } => {
                // The session waits in Connecting until one of the two events
                let result = match self.peripherals.get(&device) {
                    Some(peripheral) => peripheral.connect().await.map_err(|e| e.to_string()),
                    None => Err(format!("Unknown peripheral {}", device)),
                };
                self.emit(connect_event(device, result)).await?;
            }
            RadioCommand::CancelConnection { device } => {
                // Completion arrives as CentralEvent::DeviceDisconnected
                self.peripheral(&device)?
                    .disconnect()
                    .await
                    .context("Failed to disconnect")?;
            }
            RadioCommand::DiscoverServices { device, filter } => {
                let peripheral = self.peripheral(&device)?;
                let event = match peripheral.discover_services().await {
                    Ok(()) => RadioEvent::ServicesDiscovered {
                        services: peripheral
                            .services()
                            .into_iter()
                            .map(|s| s.uuid)
                            .filter(|uuid| filter.is_empty() || filter.contains(uuid))
                            .collect(),
                        device,
                        error: None,
                    },
                    Err(e) => RadioEvent::ServicesDiscovered {
                        device,
                        services: Vec::new(),
                        error: Some(e.to_string()),
                    },
                };
                self.emit(event).await?;
            }
            RadioCommand::DiscoverCharacteristics {
                device,
                service,
                filter,
            } => {
                let characteristics = self
                    .peripheral(&device)?
                    .services()
                    .into_iter()
                    .find(|s| s.uuid == service)
                    .map(|s| {
                        s.characteristics
                            .into_iter()
                            .map(|c| c.uuid)
                            .filter(|uuid| filter.is_empty() || filter.contains(uuid))
                            .collect()
                    })
                    .unwrap_or_default();
                self.emit(RadioEvent::CharacteristicsDiscovered {
                    device,
                    service,
                    characteristics,
                    error: None,
                })
                .await?;
            }
            RadioCommand::SetNotify {
                device,
                characteristic,
                enabled,
            } => {
                let target = self.characteristic(&device, &characteristic)?;
                let peripheral = self.peripheral(&device)?.clone();
                let result = if enabled {
                    self.forward_notifications(&device, &peripheral).await?;
                    peripheral.subscribe(&target).await
                } else {
                    peripheral.unsubscribe(&target).await
                };
                self.emit(RadioEvent::NotifyStateChanged {
                    device,
                    characteristic,
                    notifying: enabled && result.is_ok(),
                    error: result.err().map(|e| e.to_string()),
                })
                .await?;
            }
            RadioCommand::WriteValue {
                device,
                characteristic,
                value,
                with_response,
            } => {
                let target = self.characteristic(&device, &characteristic)?;
                let write_type = if with_response {
                    WriteType::WithResponse
                } else {
                    WriteType::WithoutResponse
                };
                self.peripheral(&device)?
                    .write(&target, &value, write_type)
                    .await
                    .context("Write failed")?;
            }
            RadioCommand::ReadValue {
                device,
                characteristic,
            } => {
                let target = self.characteristic(&device, &characteristic)?;
                let event = match self.peripheral(&device)?.read(&target).await {
                    Ok(value) => RadioEvent::ValueUpdated {
                        device,
                        characteristic,
                        value,
                        error: None,
                    },
                    Err(e) => RadioEvent::ValueUpdated {
                        device,
                        characteristic,
                        value: Vec::new(),
                        error: Some(e.to_string()),
                    },
                };
                self.emit(event).await?;
            }
            other => debug!("peripheral role unsupported on btleplug: {}", other),
        }
        Ok(())
    }

    /// Forward every notification of `peripheral` to the session
    async fn forward_notifications(
        &mut self,
        device: &DeviceId,
        peripheral: &Peripheral,
    ) -> Result<()> {
        if self.forwarding.contains(device) {
            return Ok(());
        }
        let mut notifications = peripheral
            .notifications()
            .await
            .context("Failed to open notification stream")?;
        let services: HashMap<Uuid, Uuid> = peripheral
            .characteristics()
            .into_iter()
            .map(|c| (c.uuid, c.service_uuid))
            .collect();
        let session = self.session.clone();
        let device = device.clone();
        self.forwarding.insert(device.clone());

        tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                let Some(service) = services.get(&notification.uuid) else {
                    continue;
                };
                let event = RadioEvent::ValueUpdated {
                    device: device.clone(),
                    characteristic: CharacteristicId::new(*service, notification.uuid),
                    value: notification.value,
                    error: None,
                };
                if session.radio_event(event).await.is_err() {
                    break;
                }
            }
        });
        Ok(())
    }
}
