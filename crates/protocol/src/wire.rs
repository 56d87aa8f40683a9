//! Payload primitives: big-endian integers and length-prefixed fields

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Payload decoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Truncated payload: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("Invalid number in {field}: {value:?}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("Unknown IP type {0}")]
    UnknownIpType(u8),

    #[error("Unknown protocol {0:?}")]
    UnknownProtocol(String),

    #[error("Missing required field {0}")]
    MissingField(&'static str),
}

/// Cursor over a payload
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn need(&self, needed: usize) -> Result<(), WireError> {
        if self.buf.remaining() < needed {
            return Err(WireError::Truncated {
                needed,
                available: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8, WireError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn u16(&mut self) -> Result<u16, WireError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn u32(&mut self) -> Result<u32, WireError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn u64(&mut self) -> Result<u64, WireError> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    /// Exactly `len` raw bytes
    pub fn take(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// Everything that is left
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = self.buf;
        self.buf = &[];
        rest
    }

    /// `u32` length + raw bytes
    pub fn bytes(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    /// `u32` length + UTF-8 text
    pub fn string(&mut self, field: &'static str) -> Result<String, WireError> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidUtf8(field))
    }

    /// Like [`string`](Self::string), but a zero-length string reads as `None`
    pub fn opt_string(&mut self, field: &'static str) -> Result<Option<String>, WireError> {
        let value = self.string(field)?;
        Ok((!value.is_empty()).then_some(value))
    }

    /// Decimal integer carried as a string
    pub fn number(&mut self, field: &'static str) -> Result<i64, WireError> {
        let text = self.string(field)?;
        text.trim()
            .parse::<i64>()
            .map_err(|_| WireError::InvalidNumber { field, value: text })
    }
}

/// Payload builder
#[derive(Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.put_u16(v);
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32(v);
        self
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.put_u64(v);
        self
    }

    /// Raw bytes, no length prefix
    pub fn raw(&mut self, data: &[u8]) -> &mut Self {
        self.buf.put_slice(data);
        self
    }

    /// `u32` length + raw bytes
    pub fn bytes(&mut self, data: &[u8]) -> &mut Self {
        self.buf.put_u32(data.len() as u32);
        self.buf.put_slice(data);
        self
    }

    /// `u32` length + UTF-8 text
    pub fn string(&mut self, text: &str) -> &mut Self {
        self.bytes(text.as_bytes())
    }

    /// `u32` byte length + UTF-16LE text
    pub fn wide_string(&mut self, text: &str) -> &mut Self {
        let wide: Vec<u8> = text.encode_utf16().flat_map(u16::to_le_bytes).collect();
        self.bytes(&wide)
    }

    /// Decimal integer carried as a string
    pub fn number(&mut self, v: i64) -> &mut Self {
        self.string(&v.to_string())
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Decode a UTF-16LE byte string
pub fn decode_wide(raw: &[u8]) -> Result<String, WireError> {
    if raw.len() % 2 != 0 {
        return Err(WireError::InvalidUtf8("wide string"));
    }
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|_| WireError::InvalidUtf8("wide string"))
}
