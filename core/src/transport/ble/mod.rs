/// BLE (Bluetooth Low Energy) Transport Module
///
/// Protocol-level logic of both GATT roles, independent of any radio stack:
///
/// - **gatt**: transfer service layout and GATT-level errors
/// - **registry**: remote devices with freshness countdown and GATT graph
/// - **central**: scanning, connections, discovery and subscriptions
/// - **peripheral**: advertising, subscribed centrals and ATT requests
/// - **transfer**: chunked notification transfer with `EOM` framing
/// - **loopback**: in-process radio bridge that records every command
///
/// Platform code (CoreBluetooth, BlueZ, btleplug) implements
/// [`RadioBridge`](crate::transport::RadioBridge) and feeds events back.

pub mod central;
pub mod gatt;
pub mod loopback;
pub mod peripheral;
pub mod registry;
pub mod transfer;

pub use central::{CentralController, InboundChannel};

pub use gatt::{
    AttributePermission, CharacteristicDefinition, CharacteristicProperty, GattError,
    ServiceDefinition, TransferCharacteristic, DATA_CHARACTERISTIC_UUID, TRANSFER_SERVICE_UUID,
    WRITE_CHARACTERISTIC_UUID,
};

pub use loopback::{LinkEvents, LoopbackLink, LoopbackRadio};

pub use peripheral::{PeripheralController, Subscriber};

pub use registry::{
    CharacteristicHandle, ConnectionState, DeviceRegistry, DiscoveredService, DiscoveryOutcome,
    RemoteDevice,
};

pub use transfer::{MessageAssembler, PumpOutcome, TransferSession, EOM_MARKER};
