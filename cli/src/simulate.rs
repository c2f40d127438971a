// Loopback simulation: both roles in one process
//
// A central session and a peripheral session are joined by a `LoopbackLink`
// and walked through discovery, subscription and a transfer in each direction.

use anyhow::{bail, Context, Result};
use gattduo_core::transport::ble::{
    LoopbackLink, LoopbackRadio, RemoteDevice, TRANSFER_SERVICE_UUID, WRITE_CHARACTERISTIC_UUID,
};
use gattduo_core::{
    BleSession, CharacteristicId, DeviceId, PowerState, RadioEvent, Role, SessionCommand,
    SessionSettings,
};
use std::sync::Arc;
use tracing::debug;

const PERIPHERAL_ID: &str = "loopback-peripheral";
const CENTRAL_ID: &str = "loopback-central";

/// Exchanges allowed before the link is considered stuck
const MAX_ROUNDS: usize = 256;

/// What each side ended up with
#[derive(Debug)]
pub struct SimulationReport {
    pub devices: Vec<RemoteDevice>,
    pub central_log: String,
    pub received_messages: Vec<String>,
    pub last_write_received: Option<String>,
}

struct Simulation {
    central_radio: Arc<LoopbackRadio>,
    peripheral_radio: Arc<LoopbackRadio>,
    central: BleSession,
    peripheral: BleSession,
    link: LoopbackLink,
}

impl Simulation {
    fn settle(&mut self) -> Result<()> {
        for _ in 0..MAX_ROUNDS {
            let events = self
                .link
                .exchange(&self.central_radio, &self.peripheral_radio);
            if events.is_empty() {
                return Ok(());
            }
            for event in events.to_peripheral {
                debug!("-> peripheral: {}", event);
                self.peripheral.handle_event(event);
            }
            for event in events.to_central {
                debug!("-> central: {}", event);
                self.central.handle_event(event);
            }
        }
        bail!("Loopback link did not settle after {} rounds", MAX_ROUNDS)
    }
}

/// Run a full exchange over the loopback link
///
/// The peripheral notifies `payload` to the subscribed central, then the
/// central writes `message` back.
pub fn run(settings: &SessionSettings, payload: &str, message: &str, mtu: usize) -> Result<SimulationReport> {
    let central_radio = Arc::new(LoopbackRadio::new());
    let peripheral_radio = Arc::new(LoopbackRadio::new());
    let peripheral_settings = SessionSettings {
        local_name: format!("{}-peripheral", settings.local_name),
        ..settings.clone()
    };

    let mut sim = Simulation {
        central: BleSession::new(settings.clone(), central_radio.clone())
            .context("Invalid central settings")?,
        peripheral: BleSession::new(peripheral_settings, peripheral_radio.clone())
            .context("Invalid peripheral settings")?,
        central_radio,
        peripheral_radio,
        link: LoopbackLink::new(DeviceId::from(PERIPHERAL_ID), DeviceId::from(CENTRAL_ID))
            .with_mtu(mtu),
    };
    let device = DeviceId::from(PERIPHERAL_ID);

    sim.central.handle_event(RadioEvent::PowerStateChanged {
        role: Role::Central,
        state: PowerState::On,
    });
    sim.peripheral.handle_event(RadioEvent::PowerStateChanged {
        role: Role::Peripheral,
        state: PowerState::On,
    });
    sim.peripheral.execute(SessionCommand::StartAdvertising);
    sim.central.execute(SessionCommand::StartScan);
    sim.settle()?;

    if sim.central.registry().get(&device).is_none() {
        bail!("Peripheral was not discovered");
    }
    sim.central.execute(SessionCommand::Connect {
        device: device.clone(),
    });
    sim.settle()?;
    if !sim.link.is_connected() {
        bail!("Connection to {} failed", device);
    }

    let write_channel = CharacteristicId::new(TRANSFER_SERVICE_UUID, WRITE_CHARACTERISTIC_UUID);
    let already_subscribed = sim
        .central
        .central()
        .inbound()
        .is_some_and(|inbound| inbound.characteristic == write_channel);
    if !already_subscribed {
        sim.central.execute(SessionCommand::Subscribe {
            device: device.clone(),
            characteristic: write_channel,
        });
        sim.settle()?;
    }

    sim.peripheral.execute(SessionCommand::Send {
        payload: payload.as_bytes().to_vec(),
    });
    sim.settle()?;

    sim.central.execute(SessionCommand::SendMessage {
        device,
        text: message.to_string(),
    });
    sim.settle()?;

    let central = sim.central.snapshot();
    Ok(SimulationReport {
        devices: central.devices,
        central_log: central.log,
        received_messages: central.received_messages,
        last_write_received: sim.peripheral.snapshot().last_write_received,
    })
}
