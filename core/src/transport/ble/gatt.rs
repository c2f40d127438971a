/// GATT service definition for the transfer service
///
/// One primary service with two characteristics: a notify+read "data" channel and
/// a notify+read+write-without-response "write" channel. Identifiers are fixed at
/// compile time.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Transfer service UUID
pub const TRANSFER_SERVICE_UUID: Uuid = Uuid::from_u128(0x12345678_90ab_cdef_0123_456789abcdef);

/// Data characteristic UUID (notify, read)
pub const DATA_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x11111111_90ab_cdef_0123_456789abcdef);

/// Write characteristic UUID (notify, read, write without response)
pub const WRITE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x22222222_90ab_cdef_0123_456789abcdef);

/// Characteristics exposed by the transfer service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferCharacteristic {
    /// Data channel
    Data,
    /// Write channel, also carries outbound notifications
    Write,
}

impl TransferCharacteristic {
    /// Get characteristic UUID
    pub fn uuid(&self) -> Uuid {
        match self {
            TransferCharacteristic::Data => DATA_CHARACTERISTIC_UUID,
            TransferCharacteristic::Write => WRITE_CHARACTERISTIC_UUID,
        }
    }

    /// Resolve one of our characteristics from its UUID
    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        if uuid == DATA_CHARACTERISTIC_UUID {
            Some(TransferCharacteristic::Data)
        } else if uuid == WRITE_CHARACTERISTIC_UUID {
            Some(TransferCharacteristic::Write)
        } else {
            None
        }
    }

    pub fn properties(&self) -> Vec<CharacteristicProperty> {
        match self {
            TransferCharacteristic::Data => {
                vec![CharacteristicProperty::Notify, CharacteristicProperty::Read]
            }
            TransferCharacteristic::Write => vec![
                CharacteristicProperty::Notify,
                CharacteristicProperty::Read,
                CharacteristicProperty::WriteWithoutResponse,
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CharacteristicProperty {
    Read,
    Write,
    WriteWithoutResponse,
    Notify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributePermission {
    Readable,
    Writeable,
}

/// A characteristic as published through `AddService`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicDefinition {
    pub uuid: Uuid,
    pub properties: Vec<CharacteristicProperty>,
    pub permissions: Vec<AttributePermission>,
}

/// A service as published through `AddService`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub uuid: Uuid,
    pub primary: bool,
    pub characteristics: Vec<CharacteristicDefinition>,
}

impl ServiceDefinition {
    /// The transfer service advertised while acting as peripheral
    pub fn transfer_service() -> Self {
        let characteristics = [TransferCharacteristic::Data, TransferCharacteristic::Write]
            .iter()
            .map(|c| CharacteristicDefinition {
                uuid: c.uuid(),
                properties: c.properties(),
                permissions: vec![AttributePermission::Readable, AttributePermission::Writeable],
            })
            .collect();

        Self {
            uuid: TRANSFER_SERVICE_UUID,
            primary: true,
            characteristics,
        }
    }

    pub fn has_characteristic(&self, uuid: Uuid) -> bool {
        self.characteristics.iter().any(|c| c.uuid == uuid)
    }
}

/// Errors reported by the radio for GATT operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("Transmit queue full (backpressure)")]
    Backpressure,
    #[error("Write failed: {0}")]
    WriteFailed(String),
    #[error("Read failed: {0}")]
    ReadFailed(String),
    #[error("Invalid characteristic")]
    InvalidCharacteristic,
    #[error("Not connected")]
    NotConnected,
    #[error("Operation not supported by this radio")]
    Unsupported,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_uuids() {
        assert_eq!(
            TRANSFER_SERVICE_UUID.to_string(),
            "12345678-90ab-cdef-0123-456789abcdef"
        );
        assert_eq!(
            DATA_CHARACTERISTIC_UUID.to_string(),
            "11111111-90ab-cdef-0123-456789abcdef"
        );
        assert_eq!(
            WRITE_CHARACTERISTIC_UUID.to_string(),
            "22222222-90ab-cdef-0123-456789abcdef"
        );
    }

    #[test]
    fn test_characteristic_from_uuid() {
        assert_eq!(
            TransferCharacteristic::from_uuid(DATA_CHARACTERISTIC_UUID),
            Some(TransferCharacteristic::Data)
        );
        assert_eq!(
            TransferCharacteristic::from_uuid(WRITE_CHARACTERISTIC_UUID),
            Some(TransferCharacteristic::Write)
        );
        assert_eq!(TransferCharacteristic::from_uuid(Uuid::nil()), None);
    }

    #[test]
    fn test_write_channel_accepts_write_without_response() {
        let props = TransferCharacteristic::Write.properties();
        assert!(props.contains(&CharacteristicProperty::WriteWithoutResponse));
        assert!(props.contains(&CharacteristicProperty::Notify));

        let data_props = TransferCharacteristic::Data.properties();
        assert!(!data_props.contains(&CharacteristicProperty::WriteWithoutResponse));
    }

    #[test]
    fn test_transfer_service_layout() {
        let service = ServiceDefinition::transfer_service();
        assert!(service.primary);
        assert_eq!(service.uuid, TRANSFER_SERVICE_UUID);
        assert_eq!(service.characteristics.len(), 2);
        assert!(service.has_characteristic(DATA_CHARACTERISTIC_UUID));
        assert!(service.has_characteristic(WRITE_CHARACTERISTIC_UUID));
        assert!(!service.has_characteristic(Uuid::nil()));
    }
}
