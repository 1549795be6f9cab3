//! # MSP v1 frame codec
//!
//! This module builds outbound request frames and parses inbound frames into
//! [`Frame`] records. It knows the wire layout only; field meaning is the
//! business of [`device`](crate::device).

use std::fmt::{self, Display};

use crate::codes::MspCode;
use crate::error::{Error, Result};
use crate::payload::Payload;

// Wire layout of an MSP v1 frame:
// ['$', 'M', direction, length, code, payload[length], checksum]
//
// direction: '<' request, '>' response, '!' unsupported command
// checksum: XOR of length, code and every payload byte

/// First two preamble bytes shared by every frame.
pub const PREAMBLE: [u8; 2] = [b'$', b'M'];
/// Bytes in a frame besides the payload.
pub const FRAME_OVERHEAD: usize = 6;
/// Largest payload a v1 frame can declare.
pub const MAX_PAYLOAD: usize = u8::MAX as usize;

/// Direction marker at offset 2 of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host to device, `<`.
    Request,
    /// Device to host, `>`.
    Response,
    /// Device rejected the command, `!`.
    Unsupported,
}

impl Direction {
    /// The marker byte.
    pub fn marker(self) -> u8 {
        match self {
            Direction::Request => b'<',
            Direction::Response => b'>',
            Direction::Unsupported => b'!',
        }
    }

    /// Parse a marker byte.
    pub fn from_marker(marker: u8) -> Option<Self> {
        match marker {
            b'<' => Some(Direction::Request),
            b'>' => Some(Direction::Response),
            b'!' => Some(Direction::Unsupported),
            _ => None,
        }
    }
}

/// One decoded MSP frame
///
/// Holds the direction, command and raw payload bytes. Use
/// [`payload`](Self::payload) to read typed fields sequentially.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    direction: Direction,
    code: MspCode,
    payload: Vec<u8>,
}

impl Frame {
    /// Build a frame from its parts.
    pub fn new(direction: Direction, code: MspCode, payload: Vec<u8>) -> Self {
        Frame { direction, code, payload }
    }

    /// Direction marker of the frame.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Command code of the frame.
    pub fn code(&self) -> MspCode {
        self.code
    }

    /// Raw payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.payload
    }

    /// A fresh cursor over the payload, positioned at its first byte.
    pub fn payload(&self) -> Payload<'_> {
        Payload::new(&self.payload)
    }

    /// Encode the frame back to wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        encode_with_direction(self.direction, self.code.code(), &self.payload)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Frame")
            .field("direction", &self.direction)
            .field("code", &self.code)
            .field("payload", &format_args!("{:02X?}", self.payload))
            .finish()
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Frame {{ direction: {:?}, code: {}, payload: {} bytes }}",
               self.direction, self.code, self.payload.len())
    }
}

/// XOR checksum over the length byte, the code and the payload.
pub fn checksum(code: u8, data: &[u8]) -> u8 {
    data.iter().fold(data.len() as u8 ^ code, |acc, b| acc ^ b)
}

/// Encode a request frame for `code` carrying `data`.
///
/// # Panics
///
/// Panics if `data` is longer than [`MAX_PAYLOAD`] bytes, which a v1 length
/// byte cannot express.
pub fn encode(code: u8, data: &[u8]) -> Vec<u8> {
    encode_with_direction(Direction::Request, code, data)
}

fn encode_with_direction(direction: Direction, code: u8, data: &[u8]) -> Vec<u8> {
    assert!(data.len() <= MAX_PAYLOAD, "MSP v1 payload too long: {} bytes", data.len());

    let mut buffer = Vec::with_capacity(FRAME_OVERHEAD + data.len());
    buffer.extend_from_slice(&PREAMBLE);
    buffer.push(direction.marker());
    buffer.push(data.len() as u8);
    buffer.push(code);
    buffer.extend_from_slice(data);
    buffer.push(checksum(code, data));
    buffer
}

/// Decode a complete wire frame starting at `'$'`.
///
/// `raw` is laid out exactly as [`encode`] writes it: the length byte sits at
/// offset 3 and the command code at offset 4, so every encoded frame decodes
/// back to the same code and payload. Stream readers must keep the length
/// byte when reassembling a frame.
///
/// The checksum is computed and a mismatch is logged, but the frame is still
/// returned.
///
/// # Errors
///
/// Returns [`Error::MalformedFrame`] if the frame is too short, the direction
/// marker or command code is unknown, or the length byte disagrees with the
/// number of payload bytes present.
pub fn decode_frame(raw: &[u8]) -> Result<Frame> {
    if raw.len() < FRAME_OVERHEAD {
        return Err(Error::MalformedFrame(format!("frame too short: {} bytes", raw.len())));
    }
    let direction = Direction::from_marker(raw[2])
        .ok_or_else(|| Error::MalformedFrame(format!("unknown direction marker 0x{:02X}", raw[2])))?;
    let length = raw[3] as usize;
    let code = MspCode::try_from(raw[4])?;
    let payload = &raw[5..raw.len() - 1];
    if payload.len() != length {
        return Err(Error::MalformedFrame(format!(
            "length byte declares {} payload bytes, frame carries {}",
            length, payload.len()
        )));
    }

    let expected = checksum(raw[4], payload);
    let received = raw[raw.len() - 1];
    if expected != received {
        tracing::warn!(code = %code, expected, received, "MSP checksum mismatch");
    }

    Ok(Frame::new(direction, code, payload.to_vec()))
}
