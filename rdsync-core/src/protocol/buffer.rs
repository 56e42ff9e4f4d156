//! Binary Buffer
//!
//! A growable byte buffer with a read cursor. All integers are little endian.
//! Strings and byte arrays carry a `u32` length prefix.

use crate::error::BufferError;

use super::id::RdId;

macro_rules! numeric {
    ($($write:ident, $read:ident, $ty:ty;)*) => {
        $(
            pub fn $write(&mut self, value: $ty) {
                self.data.extend_from_slice(&value.to_le_bytes());
            }

            pub fn $read(&mut self) -> Result<$ty, BufferError> {
                const N: usize = std::mem::size_of::<$ty>();
                let bytes = self.take(N)?;
                let mut raw = [0u8; N];
                raw.copy_from_slice(bytes);
                Ok(<$ty>::from_le_bytes(raw))
            }
        )*
    };
}

/// Byte buffer used for both outgoing payloads and incoming frames.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Buffer {
    data: Vec<u8>,
    position: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { data: Vec::with_capacity(capacity), position: 0 }
    }

    /// Wrap received bytes for reading from the start.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data, position: 0 }
    }

    /// All written bytes, regardless of the read position.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Number of bytes not yet read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    pub fn rewind(&mut self) {
        self.position = 0;
    }

    numeric! {
        write_u8, read_u8, u8;
        write_i16, read_i16, i16;
        write_u16, read_u16, u16;
        write_i32, read_i32, i32;
        write_u32, read_u32, u32;
        write_i64, read_i64, i64;
        write_u64, read_u64, u64;
        write_f32, read_f32, f32;
        write_f64, read_f64, f64;
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_u8(value as u8);
    }

    pub fn read_bool(&mut self) -> Result<bool, BufferError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            tag => Err(BufferError::InvalidTag { kind: "bool", tag: tag as i64 }),
        }
    }

    pub fn write_rd_id(&mut self, id: RdId) {
        self.write_i64(id.value());
    }

    pub fn read_rd_id(&mut self) -> Result<RdId, BufferError> {
        self.read_i64().map(RdId::new)
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_byte_array(value.as_bytes());
    }

    pub fn read_string(&mut self) -> Result<String, BufferError> {
        let bytes = self.read_byte_array()?;
        String::from_utf8(bytes).map_err(|_| BufferError::InvalidUtf8)
    }

    /// Write a length-prefixed byte array.
    pub fn write_byte_array(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.data.extend_from_slice(bytes);
    }

    pub fn read_byte_array(&mut self) -> Result<Vec<u8>, BufferError> {
        let len = self.read_u32()? as usize;
        self.take(len).map(<[u8]>::to_vec)
    }

    /// Append raw bytes without a length prefix.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Consume and return every unread byte.
    pub fn read_remaining(&mut self) -> &[u8] {
        let start = self.position;
        self.position = self.data.len();
        &self.data[start..]
    }

    /// Overwrite a previously written `u32` at `offset`.
    ///
    /// Used to back-fill length prefixes once the payload size is known.
    pub fn patch_u32(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn take(&mut self, n: usize) -> Result<&[u8], BufferError> {
        let remaining = self.remaining();
        if n > remaining {
            return Err(BufferError::UnexpectedEof { needed: n, remaining });
        }
        let start = self.position;
        self.position += n;
        Ok(&self.data[start..start + n])
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
