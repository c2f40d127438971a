/// Chunked transfer protocol over notifications
///
/// A payload is split into MTU-sized chunks and delivered one notification at a
/// time, followed by a bare `EOM` marker so the receiver knows the message is
/// complete. Delivery may be refused by the transport (backpressure); the
/// session then keeps its cursor and resumes on the next readiness signal.
///
/// The marker is sent in-band, so a chunk equal to `EOM` can never be part of a
/// payload.

use crate::transport::ble::gatt::GattError;
use crate::BleError;

/// End-of-message sentinel
pub const EOM_MARKER: &[u8] = b"EOM";

/// Upper bound on a reassembled inbound message
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 64 * 1024;

/// What a call to [`TransferSession::pump`] achieved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpOutcome {
    /// Payload and marker are delivered
    Completed,
    /// The transport refused a delivery; wait for readiness and pump again
    Stalled,
    /// Nothing left to deliver
    Idle,
}

/// One in-flight outbound transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSession {
    payload: Vec<u8>,
    cursor: usize,
    eom_pending: bool,
    finished: bool,
}

impl TransferSession {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            cursor: 0,
            eom_pending: false,
            finished: false,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Bytes already delivered
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn remaining(&self) -> usize {
        self.payload.len() - self.cursor
    }

    pub fn is_eom_pending(&self) -> bool {
        self.eom_pending
    }

    /// True once the marker went out
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Start over from the first byte, e.g. for a newly subscribed central
    pub fn rewind(&mut self) {
        self.cursor = 0;
        self.eom_pending = false;
        self.finished = false;
    }

    /// Deliver as much as the transport accepts
    ///
    /// `deliver` pushes one notification and fails when the transport cannot
    /// take it right now. Chunks are at most `mtu` bytes.
    pub fn pump<F>(&mut self, mtu: usize, mut deliver: F) -> PumpOutcome
    where
        F: FnMut(&[u8]) -> Result<(), GattError>,
    {
        if self.eom_pending {
            return self.deliver_eom(&mut deliver);
        }

        if self.cursor >= self.payload.len() {
            return PumpOutcome::Idle;
        }

        let mtu = mtu.max(1);
        while self.cursor < self.payload.len() {
            let amount = self.remaining().min(mtu);
            let chunk = &self.payload[self.cursor..self.cursor + amount];
            if deliver(chunk).is_err() {
                return PumpOutcome::Stalled;
            }
            self.cursor += amount;
        }

        self.eom_pending = true;
        self.deliver_eom(&mut deliver)
    }

    fn deliver_eom<F>(&mut self, deliver: &mut F) -> PumpOutcome
    where
        F: FnMut(&[u8]) -> Result<(), GattError>,
    {
        match deliver(EOM_MARKER) {
            Ok(()) => {
                self.eom_pending = false;
                self.finished = true;
                PumpOutcome::Completed
            }
            Err(_) => PumpOutcome::Stalled,
        }
    }
}

/// Collects notification chunks until the `EOM` marker
#[derive(Debug, Clone)]
pub struct MessageAssembler {
    buffer: Vec<u8>,
    max_len: usize,
}

impl Default for MessageAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_LEN)
    }
}

impl MessageAssembler {
    pub fn new(max_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_len,
        }
    }

    /// Feed one notification value
    ///
    /// Returns the complete message when `chunk` is the marker. A marker with
    /// nothing buffered yields `None`. Overflowing `max_len` discards the
    /// partial message.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>, BleError> {
        if chunk == EOM_MARKER {
            if self.buffer.is_empty() {
                return Ok(None);
            }
            return Ok(Some(std::mem::take(&mut self.buffer)));
        }

        if self.buffer.len() + chunk.len() > self.max_len {
            let dropped = self.buffer.len() + chunk.len();
            self.buffer.clear();
            return Err(BleError::Protocol(format!(
                "inbound message exceeds {} bytes ({} buffered)",
                self.max_len, dropped
            )));
        }

        self.buffer.extend_from_slice(chunk);
        Ok(None)
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}
