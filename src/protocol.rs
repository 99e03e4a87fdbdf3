//! Framing for the Modbus-style protocol spoken by Renogy BT-1 modules.
//!
//! Every frame ends with a CRC-16/MODBUS checksum, appended little-endian.
//! All other multi-byte integers are big-endian.

use crate::telemetry::{FieldMap, TelemetryRecord};
use crate::{Error, ProtocolError};
use crc16::{State, MODBUS};
use serde::Serialize;

/// Device id the BT-1 module answers to.
pub const DEFAULT_DEVICE_ADDRESS: u8 = 0xff;

pub const FUNCTION_READ: u8 = 0x03;
pub const FUNCTION_WRITE: u8 = 0x06;

/// First register of the controller status block.
pub const STATUS_REGISTER: u16 = 0x0100;
/// Words read from [`STATUS_REGISTER`] in one poll.
pub const STATUS_WORDS: u16 = 34;
/// Load output switch, 1 = on, 0 = off.
pub const LOAD_REGISTER: u16 = 0x010a;

// A read reply can declare at most 255 payload bytes
pub const MAX_READ_WORDS: u16 = 125;

const REQUEST_LENGTH: usize = 8;
const WRITE_REPLY_LENGTH: usize = 8;
const CRC_LENGTH: usize = 2;
// address, function, byte count, checksum
const MIN_REPLY_LENGTH: usize = 3 + CRC_LENGTH;

/// CRC-16/MODBUS over `bytes`.
pub fn calc_crc(bytes: &[u8]) -> u16 {
    State::<MODBUS>::calculate(bytes)
}

/// Checks the trailing two bytes of `frame` against the checksum of everything before them.
pub fn verify_crc(frame: &[u8]) -> bool {
    if frame.len() < CRC_LENGTH {
        return false;
    }
    let (body, trailer) = frame.split_at(frame.len() - CRC_LENGTH);
    calc_crc(body).to_le_bytes() == trailer
}

/// Appends the checksum of the current contents of `buffer`.
pub fn append_crc(buffer: &mut Vec<u8>) {
    let crc = calc_crc(buffer);
    buffer.extend_from_slice(&crc.to_le_bytes());
}

fn create_request(device_address: u8, function: u8, register: u16, argument: u16) -> Vec<u8> {
    let mut tx_buffer = Vec::with_capacity(REQUEST_LENGTH);
    tx_buffer.push(device_address);
    tx_buffer.push(function);
    tx_buffer.extend_from_slice(&register.to_be_bytes());
    tx_buffer.extend_from_slice(&argument.to_be_bytes());
    append_crc(&mut tx_buffer);
    tx_buffer
}

/// Read-multiple-registers request.
///
/// `word_count` must be between 1 and [`MAX_READ_WORDS`].
pub fn build_read_request(
    device_address: u8,
    register: u16,
    word_count: u32,
) -> Result<Vec<u8>, Error> {
    let words = u16::try_from(word_count)
        .ok()
        .filter(|w| (1..=MAX_READ_WORDS).contains(w))
        .ok_or_else(|| {
            Error::InvalidArgument(format!(
                "word count {word_count} outside 1..={MAX_READ_WORDS}"
            ))
        })?;
    Ok(create_request(device_address, FUNCTION_READ, register, words))
}

/// Write-single-register request.
pub fn build_write_request(device_address: u8, register: u16, value: u32) -> Result<Vec<u8>, Error> {
    let value = u16::try_from(value)
        .map_err(|_| Error::InvalidArgument(format!("value {value} does not fit 16 bits")))?;
    Ok(create_request(device_address, FUNCTION_WRITE, register, value))
}

/// Echo of a write-single-register request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WriteAck {
    pub device_address: u8,
    pub register: u16,
    pub value: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Telemetry(TelemetryRecord),
    WriteAck(WriteAck),
}

/// Validates reply frames and turns them into typed [`Response`]s.
#[derive(Debug, Clone, Default)]
pub struct FrameDecoder {
    fields: FieldMap,
}

impl FrameDecoder {
    pub fn new(fields: FieldMap) -> Self {
        Self { fields }
    }

    pub fn field_map(&self) -> &FieldMap {
        &self.fields
    }

    /// Never panics on malformed input; every rejection is a [`ProtocolError`].
    pub fn parse(&self, rx_buffer: &[u8]) -> Result<Response, ProtocolError> {
        if rx_buffer.len() < MIN_REPLY_LENGTH {
            return Err(ProtocolError::Truncated {
                required: MIN_REPLY_LENGTH,
                actual: rx_buffer.len(),
            });
        }
        validate_crc(rx_buffer)?;

        let body = &rx_buffer[..rx_buffer.len() - CRC_LENGTH];
        match body[1] {
            FUNCTION_READ => self.parse_read_reply(body).map(Response::Telemetry),
            FUNCTION_WRITE => parse_write_reply(body).map(Response::WriteAck),
            code => Err(ProtocolError::UnknownOperation(code)),
        }
    }

    fn parse_read_reply(&self, body: &[u8]) -> Result<TelemetryRecord, ProtocolError> {
        let declared = usize::from(body[2]);
        let payload = &body[3..];
        if payload.len() != declared {
            log::debug!(
                "Byte count mismatch - declared={} actual={}",
                declared,
                payload.len()
            );
            return Err(ProtocolError::LengthMismatch {
                declared,
                actual: payload.len(),
            });
        }
        self.fields.decode(payload)
    }
}

fn parse_write_reply(body: &[u8]) -> Result<WriteAck, ProtocolError> {
    if body.len() != WRITE_REPLY_LENGTH - CRC_LENGTH {
        return Err(ProtocolError::Truncated {
            required: WRITE_REPLY_LENGTH,
            actual: body.len() + CRC_LENGTH,
        });
    }
    Ok(WriteAck {
        device_address: body[0],
        register: u16::from_be_bytes([body[2], body[3]]),
        value: u16::from_be_bytes([body[4], body[5]]),
    })
}

fn validate_crc(frame: &[u8]) -> Result<(), ProtocolError> {
    let (body, trailer) = frame.split_at(frame.len() - CRC_LENGTH);
    let calculated = calc_crc(body);
    let received = u16::from_le_bytes([trailer[0], trailer[1]]);
    if calculated != received {
        log::trace!(
            "Invalid checksum - calculated={:04X} received={:04X} buffer={:02X?}",
            calculated,
            received,
            frame
        );
        return Err(ProtocolError::ChecksumMismatch {
            calculated,
            received,
        });
    }
    Ok(())
}
