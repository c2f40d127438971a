/// Peripheral role controller
///
/// Publishes the transfer service, advertises it, and pushes outbound payloads
/// to the subscribed central as MTU-sized notifications framed by `EOM`.
/// Incoming ATT write and read requests are answered here as well.

use crate::settings::SessionSettings;
use crate::transport::abstraction::{
    AttRequest, AttResponse, DeviceId, PowerState, RadioBridge, RadioCommand, Role,
};
use crate::transport::ble::gatt::{ServiceDefinition, TRANSFER_SERVICE_UUID, WRITE_CHARACTERISTIC_UUID};
use crate::transport::ble::transfer::{PumpOutcome, TransferSession};
use crate::{BleError, GuardViolation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// The remote central currently receiving our notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub central: DeviceId,
    pub characteristic: Uuid,
    /// Largest notification the central accepts
    pub max_update_len: usize,
}

pub struct PeripheralController {
    radio: Arc<dyn RadioBridge>,
    power: PowerState,
    advertising: bool,
    local_name: String,
    subscriber: Option<Subscriber>,
    transfer: Option<TransferSession>,
    // Requested while the current transfer still owed its EOM
    queued: Option<Vec<u8>>,
    last_write_received: Option<String>,
}

impl PeripheralController {
    pub fn new(radio: Arc<dyn RadioBridge>, settings: &SessionSettings) -> Self {
        Self {
            radio,
            power: PowerState::Unknown,
            advertising: false,
            local_name: settings.local_name.clone(),
            subscriber: None,
            transfer: None,
            queued: None,
            last_write_received: None,
        }
    }

    pub fn power(&self) -> PowerState {
        self.power
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising
    }

    pub fn subscriber(&self) -> Option<&Subscriber> {
        self.subscriber.as_ref()
    }

    pub fn transfer(&self) -> Option<&TransferSession> {
        self.transfer.as_ref()
    }

    /// Text of the most recent decodable write request
    pub fn last_write_received(&self) -> Option<&str> {
        self.last_write_received.as_deref()
    }

    /// Republish the transfer service whenever the radio comes up
    pub fn on_power_state(&mut self, state: PowerState) {
        info!(role = %Role::Peripheral, "State: {}", state);
        self.power = state;
        if !state.is_on() {
            return;
        }

        self.radio.submit(RadioCommand::RemoveAllServices);
        self.radio.submit(RadioCommand::AddService {
            service: ServiceDefinition::transfer_service(),
        });
        if self.advertising {
            self.submit_advertising();
        }
    }

    fn submit_advertising(&self) {
        self.radio.submit(RadioCommand::StartAdvertising {
            local_name: self.local_name.clone(),
            services: vec![TRANSFER_SERVICE_UUID],
        });
    }

    /// Advertise the transfer service
    ///
    /// While the radio is not powered the request is remembered and issued
    /// once it comes up.
    pub fn start_advertising(&mut self) -> Result<(), BleError> {
        if self.advertising {
            return Ok(());
        }
        self.advertising = true;
        if self.power.is_on() {
            self.submit_advertising();
            info!(local_name = %self.local_name, "advertising started");
        } else {
            debug!("advertising deferred until the peripheral radio is powered on");
        }
        Ok(())
    }

    pub fn stop_advertising(&mut self) -> Result<(), BleError> {
        if !self.advertising {
            return Ok(());
        }
        self.advertising = false;
        if self.power.is_on() {
            self.radio.submit(RadioCommand::StopAdvertising);
        }
        info!("advertising stopped");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Subscribers
    // ------------------------------------------------------------------------

    /// A central subscribed; an in-flight transfer restarts from the first byte
    pub fn on_subscribed(&mut self, central: DeviceId, characteristic: Uuid, max_update_len: usize) {
        info!(central = %central, mtu = max_update_len, "Central subscribed to characteristic");
        if let Some(next) = self.queued.take() {
            self.transfer = Some(TransferSession::new(next));
        } else if let Some(transfer) = self.transfer.as_mut() {
            transfer.rewind();
        }
        self.subscriber = Some(Subscriber {
            central,
            characteristic,
            max_update_len,
        });
    }

    pub fn on_unsubscribed(&mut self, central: &DeviceId) {
        info!(central = %central, "Central unsubscribed from characteristic");
        self.drop_subscriber(central);
    }

    pub fn on_central_disconnected(&mut self, central: &DeviceId) {
        debug!(central = %central, "central link dropped");
        self.drop_subscriber(central);
    }

    fn drop_subscriber(&mut self, central: &DeviceId) {
        if self
            .subscriber
            .as_ref()
            .is_some_and(|s| s.central == *central)
        {
            self.subscriber = None;
        }
    }

    // ------------------------------------------------------------------------
    // Outbound transfer
    // ------------------------------------------------------------------------

    /// Send `payload` to the subscribed central
    ///
    /// Sending the payload of an unfinished transfer again resumes it; any
    /// other payload starts a new transfer that replaces the old one. A
    /// transfer whose EOM is still pending gets it delivered first, and the new
    /// payload waits behind it.
    pub fn send(&mut self, payload: Vec<u8>) -> Result<PumpOutcome, BleError> {
        if self.queued.as_deref() == Some(payload.as_slice()) {
            return self.pump();
        }
        let current = self.transfer.as_ref();
        let resume = current.is_some_and(|t| !t.is_finished() && t.payload() == payload.as_slice());
        if resume {
            self.queued = None;
        } else if current.is_some_and(|t| t.is_eom_pending()) {
            debug!("queueing payload behind pending EOM");
            self.queued = Some(payload);
        } else {
            if current.is_some_and(|t| !t.is_finished()) {
                debug!("superseding unfinished transfer");
            }
            self.queued = None;
            self.transfer = Some(TransferSession::new(payload));
        }
        self.pump()
    }

    /// The transmit queue drained; continue a stalled transfer
    pub fn on_ready_to_send(&mut self) -> Result<PumpOutcome, BleError> {
        if self.transfer.is_none() || self.subscriber.is_none() {
            return Ok(PumpOutcome::Idle);
        }
        self.pump()
    }

    fn pump(&mut self) -> Result<PumpOutcome, BleError> {
        let mtu = self
            .subscriber
            .as_ref()
            .map(|s| s.max_update_len)
            .ok_or(GuardViolation::NoSubscriber)?;
        loop {
            let Some(transfer) = self.transfer.as_mut() else {
                return Ok(PumpOutcome::Idle);
            };

            let radio = &self.radio;
            let outcome = transfer.pump(mtu, |chunk| {
                radio.update_value(WRITE_CHARACTERISTIC_UUID, chunk)?;
                debug!(bytes = chunk.len(), "Sent {}", String::from_utf8_lossy(chunk));
                Ok(())
            });

            match outcome {
                PumpOutcome::Completed => info!(bytes = transfer.payload().len(), "Sent: EOM"),
                PumpOutcome::Stalled => {
                    debug!(cursor = transfer.cursor(), "transmit queue full, waiting for readiness");
                    return Ok(outcome);
                }
                PumpOutcome::Idle => {}
            }

            match self.queued.take() {
                Some(next) => self.transfer = Some(TransferSession::new(next)),
                None => return Ok(outcome),
            }
        }
    }

    // ------------------------------------------------------------------------
    // ATT requests
    // ------------------------------------------------------------------------

    fn respond(&self, request_id: u64, result: AttResponse, value: Option<Vec<u8>>) {
        self.radio.submit(RadioCommand::RespondToRequest {
            request_id,
            result,
            value,
        });
    }

    /// Answer a batch of write requests
    ///
    /// Requests whose value is not UTF-8 get no response.
    pub fn on_write_requests(&mut self, requests: &[AttRequest]) {
        let service = ServiceDefinition::transfer_service();
        for request in requests {
            if !service.has_characteristic(request.characteristic) {
                debug!(characteristic = %request.characteristic, "write to unknown characteristic");
                self.respond(request.request_id, AttResponse::InvalidHandle, None);
                continue;
            }
            let Ok(text) = std::str::from_utf8(&request.value) else {
                debug!(central = %request.central, "skipping write request that is not UTF-8");
                continue;
            };
            info!(
                central = %request.central,
                characteristic = %request.characteristic,
                bytes = request.value.len(),
                "Received write request: {}",
                text
            );
            self.last_write_received = Some(text.to_string());
            self.respond(request.request_id, AttResponse::Success, None);
        }
    }

    /// Every read is acknowledged, whatever characteristic it targets
    pub fn on_read_request(&mut self, request: &AttRequest) {
        debug!(central = %request.central, "didReceiveRead");
        self.respond(request.request_id, AttResponse::Success, Some(Vec::new()));
    }
}

impl std::fmt::Debug for PeripheralController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeripheralController")
            .field("power", &self.power)
            .field("advertising", &self.advertising)
            .field("subscriber", &self.subscriber)
            .field("transfer", &self.transfer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::abstraction::MockRadioBridge;
    use crate::transport::ble::gatt::{GattError, DATA_CHARACTERISTIC_UUID};
    use crate::transport::ble::loopback::LoopbackRadio;
    use crate::transport::ble::transfer::EOM_MARKER;

    fn powered() -> (Arc<LoopbackRadio>, PeripheralController) {
        let radio = Arc::new(LoopbackRadio::new());
        let mut peripheral = PeripheralController::new(radio.clone(), &SessionSettings::default());
        peripheral.on_power_state(PowerState::On);
        radio.take_commands();
        (radio, peripheral)
    }

    fn write_request(id: u64, characteristic: Uuid, value: &[u8]) -> AttRequest {
        AttRequest {
            request_id: id,
            central: DeviceId::from("central-1"),
            characteristic,
            value: value.to_vec(),
        }
    }

    #[test]
    fn test_power_on_publishes_service() {
        let radio = Arc::new(LoopbackRadio::new());
        let mut peripheral = PeripheralController::new(radio.clone(), &SessionSettings::default());

        peripheral.on_power_state(PowerState::On);

        assert_eq!(
            radio.take_commands(),
            vec![
                RadioCommand::RemoveAllServices,
                RadioCommand::AddService {
                    service: ServiceDefinition::transfer_service()
                },
            ]
        );
    }

    #[test]
    fn test_advertising_deferred_until_power_on() {
        let radio = Arc::new(LoopbackRadio::new());
        let mut peripheral = PeripheralController::new(radio.clone(), &SessionSettings::default());

        peripheral.start_advertising().expect("advertise");
        assert!(radio.take_commands().is_empty());
        assert!(peripheral.is_advertising());

        peripheral.on_power_state(PowerState::On);

        let commands = radio.take_commands();
        assert_eq!(
            commands.last(),
            Some(&RadioCommand::StartAdvertising {
                local_name: "gattduo".to_string(),
                services: vec![TRANSFER_SERVICE_UUID],
            })
        );
    }

    #[test]
    fn test_advertising_toggle_is_idempotent() {
        let (radio, mut peripheral) = powered();

        peripheral.start_advertising().expect("start");
        peripheral.start_advertising().expect("start again");
        peripheral.stop_advertising().expect("stop");
        peripheral.stop_advertising().expect("stop again");

        let commands = radio.take_commands();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[1], RadioCommand::StopAdvertising);
    }

    #[test]
    fn test_send_without_subscriber_is_kept() {
        let (radio, mut peripheral) = powered();

        let result = peripheral.send(b"Hello Central!".to_vec());

        assert_eq!(result, Err(BleError::Guard(GuardViolation::NoSubscriber)));
        assert!(radio.notifications().is_empty());
        assert_eq!(peripheral.transfer().map(|t| t.cursor()), Some(0));
    }

    #[test]
    fn test_send_chunks_to_subscriber_mtu() {
        let (radio, mut peripheral) = powered();
        peripheral.on_subscribed(DeviceId::from("c1"), WRITE_CHARACTERISTIC_UUID, 500);

        let outcome = peripheral.send(vec![b'a'; 1500]).expect("send");

        assert_eq!(outcome, PumpOutcome::Completed);
        let sent = radio.notifications();
        assert_eq!(sent.len(), 4);
        assert!(sent[..3]
            .iter()
            .all(|(uuid, chunk)| *uuid == WRITE_CHARACTERISTIC_UUID && chunk.len() == 500));
        assert_eq!(sent[3].1, EOM_MARKER);
    }

    #[test]
    fn test_backpressure_resumes_on_readiness() {
        let (radio, mut peripheral) = powered();
        peripheral.on_subscribed(DeviceId::from("c1"), WRITE_CHARACTERISTIC_UUID, 500);
        radio.refuse_next_updates(1);

        let outcome = peripheral.send(vec![b'z'; 500]).expect("send");
        assert_eq!(outcome, PumpOutcome::Stalled);
        assert!(radio.notifications().is_empty());

        let outcome = peripheral.on_ready_to_send().expect("ready");
        assert_eq!(outcome, PumpOutcome::Completed);
        let sent = radio.take_notifications();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1.len(), 500);
        assert_eq!(sent[1].1, EOM_MARKER);

        assert_eq!(peripheral.on_ready_to_send(), Ok(PumpOutcome::Idle));
        assert!(radio.notifications().is_empty());
    }

    #[test]
    fn test_same_payload_resumes_new_payload_replaces() {
        let (radio, mut peripheral) = powered();
        peripheral.on_subscribed(DeviceId::from("c1"), WRITE_CHARACTERISTIC_UUID, 4);
        radio.refuse_next_updates(2);
        peripheral.send(b"abcdefgh".to_vec()).expect("send");
        radio.refuse_next_updates(0);

        peripheral.send(b"abcdefgh".to_vec()).expect("resume");
        let bodies: Vec<Vec<u8>> = radio.take_notifications().into_iter().map(|(_, v)| v).collect();
        assert_eq!(bodies, vec![b"abcd".to_vec(), b"efgh".to_vec(), EOM_MARKER.to_vec()]);

        peripheral.send(b"xy".to_vec()).expect("new payload");
        let bodies: Vec<Vec<u8>> = radio.take_notifications().into_iter().map(|(_, v)| v).collect();
        assert_eq!(bodies, vec![b"xy".to_vec(), EOM_MARKER.to_vec()]);
    }

    #[test]
    fn test_pending_eom_is_sent_before_next_payload() {
        let (radio, mut peripheral) = powered();
        peripheral.on_subscribed(DeviceId::from("c1"), WRITE_CHARACTERISTIC_UUID, 500);
        radio.refuse_updates_after(1, 1);

        assert_eq!(peripheral.send(b"first".to_vec()), Ok(PumpOutcome::Stalled));
        assert!(peripheral.transfer().is_some_and(|t| t.is_eom_pending()));

        assert_eq!(peripheral.send(b"second".to_vec()), Ok(PumpOutcome::Completed));
        let bodies: Vec<Vec<u8>> = radio.take_notifications().into_iter().map(|(_, v)| v).collect();
        assert_eq!(
            bodies,
            vec![
                b"first".to_vec(),
                EOM_MARKER.to_vec(),
                b"second".to_vec(),
                EOM_MARKER.to_vec(),
            ]
        );
    }

    #[test]
    fn test_payload_waits_behind_refused_eom() {
        let (radio, mut peripheral) = powered();
        peripheral.on_subscribed(DeviceId::from("c1"), WRITE_CHARACTERISTIC_UUID, 500);
        radio.refuse_updates_after(1, 2);
        peripheral.send(b"first".to_vec()).expect("send");

        assert_eq!(peripheral.send(b"second".to_vec()), Ok(PumpOutcome::Stalled));
        assert_eq!(peripheral.transfer().map(|t| t.payload().to_vec()), Some(b"first".to_vec()));

        assert_eq!(peripheral.on_ready_to_send(), Ok(PumpOutcome::Completed));
        let bodies: Vec<Vec<u8>> = radio.take_notifications().into_iter().map(|(_, v)| v).collect();
        assert_eq!(
            bodies,
            vec![
                b"first".to_vec(),
                EOM_MARKER.to_vec(),
                b"second".to_vec(),
                EOM_MARKER.to_vec(),
            ]
        );
        assert_eq!(peripheral.on_ready_to_send(), Ok(PumpOutcome::Idle));
    }

    #[test]
    fn test_resubscribe_rewinds_transfer() {
        let (radio, mut peripheral) = powered();
        peripheral.on_subscribed(DeviceId::from("c1"), WRITE_CHARACTERISTIC_UUID, 4);
        radio.refuse_next_updates(1);
        peripheral.send(b"abcdefgh".to_vec()).expect("send");
        assert_eq!(peripheral.transfer().map(|t| t.cursor()), Some(0));

        peripheral.on_ready_to_send().expect("resume");
        peripheral.on_subscribed(DeviceId::from("c2"), WRITE_CHARACTERISTIC_UUID, 8);

        assert_eq!(peripheral.transfer().map(|t| t.cursor()), Some(0));
        assert_eq!(
            peripheral.subscriber().map(|s| s.central.clone()),
            Some(DeviceId::from("c2"))
        );
    }

    #[test]
    fn test_unsubscribe_clears_only_matching_central() {
        let (_radio, mut peripheral) = powered();
        peripheral.on_subscribed(DeviceId::from("c1"), WRITE_CHARACTERISTIC_UUID, 20);

        peripheral.on_unsubscribed(&DeviceId::from("other"));
        assert!(peripheral.subscriber().is_some());

        peripheral.on_central_disconnected(&DeviceId::from("c1"));
        assert!(peripheral.subscriber().is_none());
    }

    #[test]
    fn test_write_request_stored_and_acknowledged() {
        let (radio, mut peripheral) = powered();

        peripheral.on_write_requests(&[write_request(7, WRITE_CHARACTERISTIC_UUID, b"hi there")]);

        assert_eq!(peripheral.last_write_received(), Some("hi there"));
        assert_eq!(
            radio.take_commands(),
            vec![RadioCommand::RespondToRequest {
                request_id: 7,
                result: AttResponse::Success,
                value: None,
            }]
        );
    }

    #[test]
    fn test_undecodable_write_is_skipped() {
        let (radio, mut peripheral) = powered();

        peripheral.on_write_requests(&[
            write_request(1, DATA_CHARACTERISTIC_UUID, &[0xFF, 0xFE]),
            write_request(2, Uuid::from_u128(3), b"x"),
        ]);

        assert_eq!(peripheral.last_write_received(), None);
        assert_eq!(
            radio.take_commands(),
            vec![RadioCommand::RespondToRequest {
                request_id: 2,
                result: AttResponse::InvalidHandle,
                value: None,
            }]
        );
    }

    #[test]
    fn test_read_request_answered_with_mock() {
        let mut radio = MockRadioBridge::new();
        radio
            .expect_submit()
            .withf(|command| {
                matches!(
                    command,
                    RadioCommand::RespondToRequest {
                        request_id: 4,
                        result: AttResponse::Success,
                        ..
                    }
                )
            })
            .times(1)
            .return_const(());
        let mut peripheral = PeripheralController::new(Arc::new(radio), &SessionSettings::default());

        peripheral.on_read_request(&write_request(4, DATA_CHARACTERISTIC_UUID, b""));
    }

    #[test]
    fn test_read_of_unknown_characteristic_still_succeeds() {
        let (radio, mut peripheral) = powered();

        peripheral.on_read_request(&write_request(9, Uuid::from_u128(42), b""));

        assert_eq!(
            radio.take_commands(),
            vec![RadioCommand::RespondToRequest {
                request_id: 9,
                result: AttResponse::Success,
                value: Some(Vec::new()),
            }]
        );
    }

    #[test]
    fn test_radio_failure_stalls_transfer_with_mock() {
        let mut radio = MockRadioBridge::new();
        radio
            .expect_update_value()
            .times(1)
            .returning(|_, _| Err(GattError::WriteFailed("link lost".into())));
        let mut peripheral = PeripheralController::new(Arc::new(radio), &SessionSettings::default());
        peripheral.on_subscribed(DeviceId::from("c1"), WRITE_CHARACTERISTIC_UUID, 20);

        let outcome = peripheral.send(b"data".to_vec()).expect("send");

        assert_eq!(outcome, PumpOutcome::Stalled);
        assert_eq!(peripheral.transfer().map(|t| t.cursor()), Some(0));
    }
}
