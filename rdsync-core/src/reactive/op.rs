//! Collection operation records.
//!
//! Every mutation of a synchronized collection is sent as one record, tagged
//! with a one-byte kind. The receiving side applies exactly that operation to
//! its mirror.
//!
//! Keyed collections extend the kind byte into a [`RecordHeader`]: the top bit
//! says whether an `i64` version follows.

use crate::error::{BufferError, ProtocolError};
use crate::protocol::Buffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpKind {
    Add = 0,
    Update = 1,
    Remove = 2,
    Clear = 3,
    Ack = 4,
}

impl OpKind {
    pub fn write(self, buffer: &mut Buffer) {
        buffer.write_u8(self as u8);
    }

    pub fn read(buffer: &mut Buffer) -> Result<Self, ProtocolError> {
        Self::from_tag(buffer.read_u8()?)
    }

    fn from_tag(tag: u8) -> Result<Self, ProtocolError> {
        match tag {
            0 => Ok(OpKind::Add),
            1 => Ok(OpKind::Update),
            2 => Ok(OpKind::Remove),
            3 => Ok(OpKind::Clear),
            4 => Ok(OpKind::Ack),
            tag => Err(BufferError::InvalidTag { kind: "collection op", tag: tag as i64 }.into()),
        }
    }
}

const VERSIONED: u8 = 0x80;

/// Kind byte plus optional version of a keyed collection record.
///
/// ```text
///   [u8 kind | 0x80][i64 version]    versioned
///   [u8 kind]                        unversioned
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecordHeader {
    pub kind: OpKind,
    pub version: Option<i64>,
}

impl RecordHeader {
    pub(crate) fn new(kind: OpKind, version: Option<i64>) -> Self {
        Self { kind, version }
    }

    pub(crate) fn write(self, buffer: &mut Buffer) {
        match self.version {
            Some(version) => {
                buffer.write_u8(self.kind as u8 | VERSIONED);
                buffer.write_i64(version);
            }
            None => self.kind.write(buffer),
        }
    }

    pub(crate) fn read(buffer: &mut Buffer) -> Result<Self, ProtocolError> {
        let tag = buffer.read_u8()?;
        let kind = OpKind::from_tag(tag & !VERSIONED)?;
        let version = if tag & VERSIONED != 0 { Some(buffer.read_i64()?) } else { None };
        Ok(Self { kind, version })
    }
}

/// Change of a synchronized map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapEvent<K, V> {
    Add { key: K, value: V },
    Update { key: K, old: V, new: V },
    Remove { key: K, value: V },
}

/// Change of a synchronized set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetEvent<T> {
    Add(T),
    Remove(T),
}

/// Change of a synchronized list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListEvent<T> {
    Add { index: usize, value: T },
    Update { index: usize, old: T, new: T },
    Remove { index: usize, value: T },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_use_one_byte_tags() {
        let mut buffer = Buffer::new();
        for kind in [OpKind::Add, OpKind::Update, OpKind::Remove, OpKind::Clear, OpKind::Ack] {
            kind.write(&mut buffer);
        }
        assert_eq!(buffer.as_slice(), &[0, 1, 2, 3, 4]);
        assert_eq!(OpKind::read(&mut buffer).unwrap(), OpKind::Add);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut buffer = Buffer::from_bytes(vec![9]);
        assert_eq!(
            OpKind::read(&mut buffer),
            Err(ProtocolError::Buffer(BufferError::InvalidTag { kind: "collection op", tag: 9 }))
        );
    }

    #[test]
    fn versioned_header_sets_top_bit() {
        let mut buffer = Buffer::new();
        RecordHeader::new(OpKind::Remove, Some(7)).write(&mut buffer);
        RecordHeader::new(OpKind::Add, None).write(&mut buffer);
        assert_eq!(buffer.as_slice()[0], 0x82);
        assert_eq!(buffer.as_slice()[9], 0x00);

        let mut buffer = Buffer::from_bytes(buffer.into_bytes());
        assert_eq!(RecordHeader::read(&mut buffer).unwrap(), RecordHeader::new(OpKind::Remove, Some(7)));
        assert_eq!(RecordHeader::read(&mut buffer).unwrap(), RecordHeader::new(OpKind::Add, None));
    }
}
