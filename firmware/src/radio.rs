//! Framed UART link to the radio co-processor.
//!
//! The wireless stack runs on a separate network co-processor. Both
//! directions use the same framing:
//!
//! ```text
//! 0xA5 | opcode | len | payload[len] | checksum
//! ```
//!
//! where `checksum` is the bitwise complement of the wrapping sum of opcode,
//! length and payload. Indications from the co-processor decode straight into
//! control-plane [`Event`]s; requests from the control plane are encoded and
//! handed to the UART task through a bounded channel, so a full channel is
//! what the controller sees as a busy stack.

use core::fmt;

#[cfg(not(target_os = "none"))]
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
#[cfg(target_os = "none")]
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, Sender, TrySendError};
use heapless::Vec;
use tracker_core::Event;
use tracker_core::drivers::{
    Characteristic, ConnectionParameters, RadioError, RadioLink, SlaveLatency,
};
use tracker_core::event::ProtocolCommand;

use crate::config::RADIO_TX_DEPTH;

pub const SYNC: u8 = 0xA5;
pub const MAX_PAYLOAD: usize = 24;
pub const MAX_FRAME: usize = MAX_PAYLOAD + 4;
/// Largest value pushed in one notification.
pub const MAX_NOTIFY: usize = 20;

/// One encoded frame.
pub type Frame = Vec<u8, MAX_FRAME>;

#[cfg(target_os = "none")]
pub type RadioMutex = CriticalSectionRawMutex;
#[cfg(not(target_os = "none"))]
pub type RadioMutex = NoopRawMutex;

/// Frames waiting for the UART transmitter.
pub type RadioTx = Channel<RadioMutex, Frame, RADIO_TX_DEPTH>;

mod opcode {
    pub const CONNECTED: u8 = 0x01;
    pub const DISCONNECTED: u8 = 0x02;
    pub const PARAMETERS_CHANGED: u8 = 0x03;
    pub const WRITE: u8 = 0x04;
    pub const READ: u8 = 0x05;

    pub const REQUEST_PARAMETERS: u8 = 0x81;
    pub const DISCONNECT: u8 = 0x82;
    pub const NOTIFY: u8 = 0x83;
    pub const START_ADVERTISING: u8 = 0x84;
    pub const STOP_ADVERTISING: u8 = 0x85;
}

/// Why a frame was rejected.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FrameError {
    TooLong,
    Checksum,
    UnknownOpcode(u8),
    /// Payload length or contents do not fit the opcode.
    Malformed(u8),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::TooLong => f.write_str("frame too long"),
            FrameError::Checksum => f.write_str("frame checksum mismatch"),
            FrameError::UnknownOpcode(op) => write!(f, "unknown opcode 0x{op:02x}"),
            FrameError::Malformed(op) => write!(f, "malformed payload for opcode 0x{op:02x}"),
        }
    }
}

const fn characteristic_code(characteristic: Characteristic) -> u8 {
    match characteristic {
        Characteristic::Response => 0,
        Characteristic::Status => 1,
        Characteristic::Battery => 2,
        Characteristic::Activity => 3,
        Characteristic::LastError => 4,
        Characteristic::RawData => 5,
    }
}

const fn characteristic_from_code(code: u8) -> Option<Characteristic> {
    match code {
        0 => Some(Characteristic::Response),
        1 => Some(Characteristic::Status),
        2 => Some(Characteristic::Battery),
        3 => Some(Characteristic::Activity),
        4 => Some(Characteristic::LastError),
        5 => Some(Characteristic::RawData),
        _ => None,
    }
}

fn checksum(opcode: u8, payload: &[u8]) -> u8 {
    // Payloads never exceed MAX_PAYLOAD, so the length fits a byte.
    let len = u8::try_from(payload.len()).unwrap_or(u8::MAX);
    !payload
        .iter()
        .fold(opcode.wrapping_add(len), |sum, byte| sum.wrapping_add(*byte))
}

/// Encodes one frame.
///
/// # Errors
///
/// [`FrameError::TooLong`] when `payload` exceeds [`MAX_PAYLOAD`].
pub fn encode_frame(opcode: u8, payload: &[u8]) -> Result<Frame, FrameError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::TooLong);
    }
    let len = u8::try_from(payload.len()).map_err(|_| FrameError::TooLong)?;
    let mut frame = Frame::new();
    frame
        .extend_from_slice(&[SYNC, opcode, len])
        .map_err(|_| FrameError::TooLong)?;
    frame
        .extend_from_slice(payload)
        .map_err(|_| FrameError::TooLong)?;
    frame
        .push(checksum(opcode, payload))
        .map_err(|_| FrameError::TooLong)?;
    Ok(frame)
}

fn encode_parameters(params: ConnectionParameters) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..2].copy_from_slice(&params.interval_min.to_le_bytes());
    out[2..4].copy_from_slice(&params.interval_max.to_le_bytes());
    out[4..6].copy_from_slice(&params.latency.events().to_le_bytes());
    out[6..].copy_from_slice(&params.supervision_timeout.to_le_bytes());
    out
}

fn indication(opcode: u8, payload: &[u8]) -> Result<Event, FrameError> {
    match (opcode, payload) {
        (opcode::CONNECTED, []) => Ok(Event::Connected),
        (opcode::DISCONNECTED, []) => Ok(Event::Disconnected),
        (opcode::PARAMETERS_CHANGED, [lo, hi]) => Ok(Event::ParametersChanged(
            SlaveLatency::new(u16::from_le_bytes([*lo, *hi])),
        )),
        (opcode::WRITE, [id, body @ ..]) => Ok(Event::Command(ProtocolCommand::new(*id, body))),
        (opcode::READ, [code]) => characteristic_from_code(*code)
            .map(Event::ReadRequested)
            .ok_or(FrameError::Malformed(opcode)),
        (
            opcode::CONNECTED
            | opcode::DISCONNECTED
            | opcode::PARAMETERS_CHANGED
            | opcode::WRITE
            | opcode::READ,
            _,
        ) => Err(FrameError::Malformed(opcode)),
        (other, _) => Err(FrameError::UnknownOpcode(other)),
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum DecodeState {
    Sync,
    Opcode,
    Length,
    Payload,
    Checksum,
}

/// Incremental decoder for indications arriving on the UART.
pub struct FrameDecoder {
    state: DecodeState,
    opcode: u8,
    len: usize,
    payload: Vec<u8, MAX_PAYLOAD>,
}

impl FrameDecoder {
    pub const fn new() -> Self {
        Self {
            state: DecodeState::Sync,
            opcode: 0,
            len: 0,
            payload: Vec::new(),
        }
    }

    /// Feeds one byte; returns a result whenever a frame ends.
    pub fn push(&mut self, byte: u8) -> Option<Result<Event, FrameError>> {
        match self.state {
            DecodeState::Sync => {
                if byte == SYNC {
                    self.state = DecodeState::Opcode;
                }
                None
            }
            DecodeState::Opcode => {
                self.opcode = byte;
                self.state = DecodeState::Length;
                None
            }
            DecodeState::Length => {
                self.len = usize::from(byte);
                self.payload.clear();
                if self.len > MAX_PAYLOAD {
                    self.state = DecodeState::Sync;
                    return Some(Err(FrameError::TooLong));
                }
                self.state = if self.len == 0 {
                    DecodeState::Checksum
                } else {
                    DecodeState::Payload
                };
                None
            }
            DecodeState::Payload => {
                // Capacity checked against `len` in the length state.
                let _ = self.payload.push(byte);
                if self.payload.len() == self.len {
                    self.state = DecodeState::Checksum;
                }
                None
            }
            DecodeState::Checksum => {
                self.state = DecodeState::Sync;
                if byte != checksum(self.opcode, &self.payload) {
                    return Some(Err(FrameError::Checksum));
                }
                Some(indication(self.opcode, &self.payload))
            }
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// [`RadioLink`] that queues encoded requests for the UART task.
pub struct UartRadio<'a> {
    tx: Sender<'a, RadioMutex, Frame, RADIO_TX_DEPTH>,
}

impl<'a> UartRadio<'a> {
    pub fn new(tx: Sender<'a, RadioMutex, Frame, RADIO_TX_DEPTH>) -> Self {
        Self { tx }
    }

    fn send(&mut self, opcode: u8, payload: &[u8]) -> Result<(), RadioError> {
        let frame = encode_frame(opcode, payload).map_err(|_| RadioError::Failed)?;
        self.tx.try_send(frame).map_err(|TrySendError::Full(_)| RadioError::Busy)
    }
}

impl RadioLink for UartRadio<'_> {
    fn request_connection_parameters(
        &mut self,
        params: ConnectionParameters,
    ) -> Result<(), RadioError> {
        self.send(opcode::REQUEST_PARAMETERS, &encode_parameters(params))
    }

    fn disconnect(&mut self) -> Result<(), RadioError> {
        self.send(opcode::DISCONNECT, &[])
    }

    fn notify(&mut self, characteristic: Characteristic, bytes: &[u8]) -> Result<(), RadioError> {
        if bytes.len() > MAX_NOTIFY {
            return Err(RadioError::Failed);
        }
        let mut payload: Vec<u8, { MAX_NOTIFY + 1 }> = Vec::new();
        payload
            .push(characteristic_code(characteristic))
            .map_err(|_| RadioError::Failed)?;
        payload
            .extend_from_slice(bytes)
            .map_err(|_| RadioError::Failed)?;
        self.send(opcode::NOTIFY, &payload)
    }

    fn start_advertising(&mut self) -> Result<(), RadioError> {
        self.send(opcode::START_ADVERTISING, &[])
    }

    fn stop_advertising(&mut self) -> Result<(), RadioError> {
        self.send(opcode::STOP_ADVERTISING, &[])
    }
}
