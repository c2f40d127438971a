// Transport module: radio abstraction and BLE role logic

pub mod abstraction;
pub mod ble;

pub use abstraction::{
    AttRequest, AttResponse, CharacteristicId, DeviceId, PowerState, RadioBridge, RadioCommand,
    RadioEvent, Role,
};
