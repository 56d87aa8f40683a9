//! Frame - the length-delimited, typed, token-addressed protocol unit
//!
//! ```text
//! offset 0  : u32 total_length   (whole frame, length field included)
//! offset 4  : u16 command_type
//! offset 6  : [u8; 16] token
//! offset 22 : payload
//! ```

use crate::command::CommandType;
use crate::token::{TOKEN_LEN, Token};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the fixed frame header
pub const HEADER_LEN: usize = 4 + 2 + TOKEN_LEN;

/// Largest frame the codec produces or accepts (16MB)
pub const MAX_FRAME_SIZE: usize = 16 << 20;

/// Frame codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame too short: {0} bytes (header is {HEADER_LEN})")]
    TooShort(usize),

    #[error("Length mismatch: header declares {declared}, buffer holds {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Unknown command type {code} for token {token}")]
    UnknownCommand { code: u16, token: Token },
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: CommandType,
    pub token: Token,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(command: CommandType, token: Token, payload: impl Into<Bytes>) -> Self {
        Self {
            command,
            token,
            payload: payload.into(),
        }
    }

    /// Frame with an empty payload
    pub fn empty(command: CommandType, token: Token) -> Self {
        Self::new(command, token, Bytes::new())
    }

    /// Encoded size of this frame
    pub fn total_length(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn encode(&self) -> Result<Bytes, FrameError> {
        encode(self.command, &self.token, &self.payload)
    }
}

/// Encode one frame
pub fn encode(command: CommandType, token: &Token, payload: &[u8]) -> Result<Bytes, FrameError> {
    let total = HEADER_LEN + payload.len();
    if total > MAX_FRAME_SIZE {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE - HEADER_LEN,
        });
    }

    let mut buf = BytesMut::with_capacity(total);
    buf.put_u32(total as u32);
    buf.put_u16(command.code());
    buf.put_slice(token.as_bytes());
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Decode one complete frame; the buffer must hold exactly one frame
pub fn decode(data: &[u8]) -> Result<Frame, FrameError> {
    if data.len() < HEADER_LEN {
        return Err(FrameError::TooShort(data.len()));
    }

    let declared = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if declared != data.len() {
        return Err(FrameError::LengthMismatch {
            declared,
            actual: data.len(),
        });
    }

    let code = u16::from_be_bytes([data[4], data[5]]);
    let token = Token::from_slice(&data[6..HEADER_LEN]).ok_or(FrameError::TooShort(data.len()))?;
    let command = CommandType::from_u16(code).ok_or(FrameError::UnknownCommand { code, token })?;

    Ok(Frame {
        command,
        token,
        payload: Bytes::copy_from_slice(&data[HEADER_LEN..]),
    })
}

/// Read the declared `total_length` from the first four bytes of a frame
pub fn peek_length(header: [u8; 4]) -> usize {
    u32::from_be_bytes(header) as usize
}
