// Integration test: two sessions joined over a loopback link
//
// One session acts as central ("phone"), the other as peripheral ("sensor").
// Every command one side submits is routed to the other as a radio event until
// the link goes quiet.

use gattduo_core::session::BleSession;
use gattduo_core::transport::ble::{
    ConnectionState, LoopbackLink, LoopbackRadio, DATA_CHARACTERISTIC_UUID, EOM_MARKER,
    TRANSFER_SERVICE_UUID, WRITE_CHARACTERISTIC_UUID,
};
use gattduo_core::{
    CharacteristicId, DeviceId, PowerState, RadioEvent, Role, SessionCommand, SessionSettings,
};
use std::sync::Arc;

struct Pair {
    central_radio: Arc<LoopbackRadio>,
    peripheral_radio: Arc<LoopbackRadio>,
    central: BleSession,
    peripheral: BleSession,
    link: LoopbackLink,
}

fn sensor() -> DeviceId {
    DeviceId::from("sensor")
}

fn write_channel() -> CharacteristicId {
    CharacteristicId::new(TRANSFER_SERVICE_UUID, WRITE_CHARACTERISTIC_UUID)
}

impl Pair {
    fn new(central_settings: SessionSettings, link: LoopbackLink) -> Self {
        let central_radio = Arc::new(LoopbackRadio::new());
        let peripheral_radio = Arc::new(LoopbackRadio::new());
        let central =
            BleSession::new(central_settings, central_radio.clone()).expect("central session");
        let peripheral = BleSession::new(
            SessionSettings {
                local_name: "sensor-01".to_string(),
                ..Default::default()
            },
            peripheral_radio.clone(),
        )
        .expect("peripheral session");

        let mut pair = Self {
            central_radio,
            peripheral_radio,
            central,
            peripheral,
            link,
        };
        pair.central.handle_event(RadioEvent::PowerStateChanged {
            role: Role::Central,
            state: PowerState::On,
        });
        pair.peripheral.handle_event(RadioEvent::PowerStateChanged {
            role: Role::Peripheral,
            state: PowerState::On,
        });
        pair.settle();
        pair
    }

    fn with_defaults() -> Self {
        Self::new(
            SessionSettings::default(),
            LoopbackLink::new(sensor(), DeviceId::from("phone")),
        )
    }

    /// Route events both ways until nothing is left in flight
    fn settle(&mut self) {
        for _ in 0..64 {
            let events = self
                .link
                .exchange(&self.central_radio, &self.peripheral_radio);
            if events.is_empty() {
                return;
            }
            for event in events.to_peripheral {
                self.peripheral.handle_event(event);
            }
            for event in events.to_central {
                self.central.handle_event(event);
            }
        }
        panic!("loopback link did not settle");
    }

    /// Discover, connect and fully enumerate the sensor
    fn connect(&mut self) {
        self.peripheral.execute(SessionCommand::StartAdvertising);
        self.central.execute(SessionCommand::StartScan);
        self.settle();
        self.central.execute(SessionCommand::Connect { device: sensor() });
        self.settle();
    }

    fn subscribe(&mut self, characteristic: CharacteristicId) {
        self.central.execute(SessionCommand::Subscribe {
            device: sensor(),
            characteristic,
        });
        self.settle();
    }
}

#[test]
fn test_scan_discovers_advertising_peripheral() {
    let mut pair = Pair::with_defaults();

    pair.peripheral.execute(SessionCommand::StartAdvertising);
    pair.central.execute(SessionCommand::StartScan);
    pair.settle();

    let snapshot = pair.central.snapshot();
    assert!(snapshot.scanning);
    assert_eq!(snapshot.devices.len(), 1);
    let device = snapshot.device(&sensor()).expect("sensor listed");
    assert_eq!(device.name.as_deref(), Some("sensor-01"));
    assert_eq!(device.rssi, -50);
    assert_eq!(device.ttl, 9);
    assert_eq!(device.state, ConnectionState::Discovered);
}

#[test]
fn test_connect_enumerates_transfer_service() {
    let mut pair = Pair::with_defaults();

    pair.connect();

    let device = pair.central.registry().get(&sensor()).expect("sensor");
    assert_eq!(device.state, ConnectionState::Connected);
    assert_eq!(device.services.len(), 1);
    assert_eq!(device.characteristic_count(), 2);
    let log = pair.central.log().as_str();
    assert!(log.contains("C: 11111111-90ab-cdef-0123-456789abcdef (1111)"));
    assert!(log.contains("C: 22222222-90ab-cdef-0123-456789abcdef (2222)"));
}

#[test]
fn test_weak_peripheral_is_never_listed() {
    let mut pair = Pair::new(
        SessionSettings::default(),
        LoopbackLink::new(sensor(), DeviceId::from("phone")).with_rssi(-100),
    );

    pair.peripheral.execute(SessionCommand::StartAdvertising);
    pair.central.execute(SessionCommand::StartScan);
    pair.settle();

    assert!(pair.central.registry().is_empty());
}

#[test]
fn test_notification_transfer_is_reassembled() {
    let mut pair = Pair::with_defaults();
    pair.connect();
    pair.subscribe(write_channel());
    assert_eq!(
        pair.peripheral
            .snapshot()
            .subscriber
            .map(|s| s.max_update_len),
        Some(20)
    );

    pair.peripheral.execute(SessionCommand::Send {
        payload: b"Hello Central!".to_vec(),
    });
    pair.settle();

    let snapshot = pair.central.snapshot();
    assert_eq!(snapshot.received_messages, vec!["Hello Central!".to_string()]);
    assert!(snapshot.log.ends_with("Hello Central!\nEOM"));
}

#[test]
fn test_large_transfer_uses_subscriber_mtu() {
    let mut pair = Pair::new(
        SessionSettings::default(),
        LoopbackLink::new(sensor(), DeviceId::from("phone")).with_mtu(500),
    );
    pair.connect();
    pair.subscribe(write_channel());
    let payload: String = "abcdefghij".repeat(150);

    pair.peripheral.execute(SessionCommand::Send {
        payload: payload.clone().into_bytes(),
    });
    pair.settle();

    let snapshot = pair.central.snapshot();
    assert_eq!(snapshot.received_messages, vec![payload]);
    let eom = std::str::from_utf8(EOM_MARKER).expect("ascii");
    let chunk_lines: Vec<&str> = snapshot
        .log
        .lines()
        .skip_while(|line| !line.starts_with("abcdefghij"))
        .collect();
    assert_eq!(chunk_lines.len(), 4);
    assert!(chunk_lines[..3].iter().all(|line| line.len() == 500));
    assert_eq!(chunk_lines[3], eom);
}

#[test]
fn test_central_message_reaches_peripheral() {
    let mut pair = Pair::with_defaults();
    pair.connect();
    pair.subscribe(write_channel());

    pair.central.execute(SessionCommand::SendMessage {
        device: sensor(),
        text: "Hello Peripheral!".to_string(),
    });
    pair.settle();

    assert_eq!(
        pair.peripheral.snapshot().last_write_received.as_deref(),
        Some("Hello Peripheral!")
    );
}

#[test]
fn test_message_without_subscription_is_not_written() {
    let mut pair = Pair::with_defaults();
    pair.connect();

    pair.central.execute(SessionCommand::SendMessage {
        device: sensor(),
        text: "nobody listens".to_string(),
    });
    pair.settle();

    assert_eq!(pair.peripheral.snapshot().last_write_received, None);
}

#[test]
fn test_auto_subscribe_follows_target_characteristic() {
    let settings = SessionSettings {
        auto_subscribe: true,
        target_characteristic: WRITE_CHARACTERISTIC_UUID.to_string(),
        ..Default::default()
    };
    let mut pair = Pair::new(settings, LoopbackLink::new(sensor(), DeviceId::from("phone")));

    pair.connect();

    assert_eq!(
        pair.central.snapshot().inbound.map(|c| c.characteristic),
        Some(write_channel())
    );
    assert!(pair.peripheral.snapshot().subscriber.is_some());
    assert!(pair
        .central
        .log()
        .as_str()
        .contains("Sub2: 22222222-90ab-cdef-0123-456789abcdef"));
}

#[test]
fn test_disconnect_releases_both_sides() {
    let mut pair = Pair::with_defaults();
    pair.connect();
    pair.subscribe(write_channel());

    pair.central
        .execute(SessionCommand::Disconnect { device: sensor() });
    pair.settle();

    let device = pair.central.registry().get(&sensor()).expect("still listed");
    assert_eq!(device.state, ConnectionState::Discovered);
    assert!(device.services.is_empty());
    assert!(pair.central.snapshot().inbound.is_none());
    assert!(pair.peripheral.snapshot().subscriber.is_none());
}

#[test]
fn test_read_request_round_trip() {
    let mut pair = Pair::with_defaults();
    pair.connect();
    let log_len = pair.central.log().as_str().len();

    pair.central.execute(SessionCommand::Read {
        device: sensor(),
        characteristic: CharacteristicId::new(TRANSFER_SERVICE_UUID, DATA_CHARACTERISTIC_UUID),
    });
    pair.settle();

    // The empty read value lands in the log as an empty line
    assert_eq!(pair.central.log().as_str().len(), log_len + 1);
    assert!(pair.central.log().as_str().ends_with('\n'));
}

#[test]
fn test_device_expires_when_advertising_stops() {
    let mut pair = Pair::with_defaults();
    pair.peripheral.execute(SessionCommand::StartAdvertising);
    pair.central.execute(SessionCommand::StartScan);
    pair.settle();

    for _ in 0..20 {
        pair.central.tick();
        if let Some(advertisement) = pair.link.advertisement() {
            pair.central.handle_event(advertisement);
        }
    }
    assert_eq!(pair.central.registry().len(), 1);

    pair.peripheral.execute(SessionCommand::StopAdvertising);
    pair.settle();
    for _ in 0..8 {
        pair.central.tick();
        assert!(pair.link.advertisement().is_none());
    }
    assert_eq!(pair.central.registry().len(), 1);

    pair.central.tick();
    assert!(pair.central.registry().is_empty());
}

#[test]
fn test_repeated_discovery_updates_single_entry() {
    let mut pair = Pair::with_defaults();

    pair.central.handle_event(RadioEvent::Discovered {
        device: DeviceId::from("D1"),
        name: Some("Thermo".to_string()),
        rssi: -80,
        advertisement: Vec::new(),
    });
    pair.central.tick();
    pair.central.handle_event(RadioEvent::Discovered {
        device: DeviceId::from("D1"),
        name: None,
        rssi: -60,
        advertisement: Vec::new(),
    });

    let snapshot = pair.central.snapshot();
    assert_eq!(snapshot.devices.len(), 1);
    assert_eq!(snapshot.devices[0].rssi, -60);
    assert_eq!(snapshot.devices[0].name.as_deref(), Some("Thermo"));
    assert_eq!(snapshot.last_updated, Some(DeviceId::from("D1")));
}
