//! zonekv - Core Type Definitions
//! Defines the keys, sequence numbers and value records shared by every layer.

use std::cmp::Ordering;
use std::fmt;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Key type for the storage engine.
/// Using Vec<u8> allows arbitrary binary keys.
pub type Key = Vec<u8>;

/// Value type for the storage engine.
pub type Value = Vec<u8>;

/// Global write order. Every applied write gets the next number.
pub type SequenceNumber = u64;

/// Number shared by every file the engine creates (logs, manifests, tables, values).
pub type FileNumber = u64;

/// Largest sequence number that fits next to the kind tag.
pub const MAX_SEQUENCE: SequenceNumber = (1 << 56) - 1;

/// Operation kind stored with every internal key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ValueKind {
    Delete = 0,
    Put = 1,
}

impl ValueKind {
    pub fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(ValueKind::Delete),
            1 => Ok(ValueKind::Put),
            _ => Err(Error::Corruption(format!("invalid value kind: {}", byte))),
        }
    }
}

/// `(user_key, sequence, kind)`.
///
/// Ordered by user key ascending, then sequence descending, so the newest
/// version of a key sorts first.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InternalKey {
    pub user_key: Key,
    pub sequence: SequenceNumber,
    pub kind: ValueKind,
}

impl InternalKey {
    pub fn new(user_key: impl Into<Key>, sequence: SequenceNumber, kind: ValueKind) -> Self {
        Self {
            user_key: user_key.into(),
            sequence,
            kind,
        }
    }

    /// The smallest internal key for `user_key` visible at `sequence`.
    /// Seeking to it lands on the newest version not newer than `sequence`.
    pub fn lookup(user_key: &[u8], sequence: SequenceNumber) -> Self {
        Self::new(user_key.to_vec(), sequence, ValueKind::Put)
    }

    fn tag(&self) -> u64 {
        (self.sequence << 8) | self.kind as u64
    }

    pub fn encoded_len(&self) -> usize {
        4 + self.user_key.len() + 8
    }

    /// `[user_key_len: u32][user_key][sequence << 8 | kind: u64]`, little endian.
    pub fn encode_to(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.user_key.len() as u32);
        buf.put_slice(&self.user_key);
        buf.put_u64_le(self.tag());
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_to(&mut buf);
        buf
    }

    pub fn decode_from(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < 4 {
            return Err(Error::Corruption("internal key too short".into()));
        }
        let key_len = buf.get_u32_le() as usize;
        if buf.remaining() < key_len + 8 {
            return Err(Error::Corruption("internal key truncated".into()));
        }
        let mut user_key = vec![0u8; key_len];
        buf.copy_to_slice(&mut user_key);
        let tag = buf.get_u64_le();
        Ok(Self {
            user_key,
            sequence: tag >> 8,
            kind: ValueKind::from_u8((tag & 0xff) as u8)?,
        })
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.user_key
            .cmp(&other.user_key)
            .then_with(|| other.sequence.cmp(&self.sequence))
            .then_with(|| other.kind.cmp(&self.kind))
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "'{}' @ {} : {:?}",
            String::from_utf8_lossy(&self.user_key),
            self.sequence,
            self.kind
        )
    }
}

/// Location of a value stored outside the sorted index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueReference {
    pub file_number: FileNumber,
    pub offset: u64,
    pub length: u32,
}

impl ValueReference {
    pub const ENCODED_LEN: usize = 8 + 8 + 4;

    pub fn encode_to(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.file_number);
        buf.put_u64_le(self.offset);
        buf.put_u32_le(self.length);
    }

    pub fn decode_from(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::ENCODED_LEN {
            return Err(Error::Corruption("value reference truncated".into()));
        }
        Ok(Self {
            file_number: buf.get_u64_le(),
            offset: buf.get_u64_le(),
            length: buf.get_u32_le(),
        })
    }
}

const TAG_INLINE: u8 = 0;
const TAG_EXTERNAL: u8 = 1;

/// A value as it is stored in the WAL, the MemTable and sorted files.
///
/// Serialized form: `[tag: u8]` followed by `[len: u32][bytes]` for inline
/// values or a fixed-size [`ValueReference`] for external ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueRecord {
    Inline(Value),
    External(ValueReference),
}

impl ValueRecord {
    pub fn empty() -> Self {
        ValueRecord::Inline(Vec::new())
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            ValueRecord::Inline(value) => 1 + 4 + value.len(),
            ValueRecord::External(_) => 1 + ValueReference::ENCODED_LEN,
        }
    }

    /// Payload bytes this record accounts for in memory.
    pub fn payload_len(&self) -> usize {
        match self {
            ValueRecord::Inline(value) => value.len(),
            ValueRecord::External(reference) => reference.length as usize,
        }
    }

    pub fn external(&self) -> Option<&ValueReference> {
        match self {
            ValueRecord::External(reference) => Some(reference),
            ValueRecord::Inline(_) => None,
        }
    }

    pub fn encode_to(&self, buf: &mut impl BufMut) {
        match self {
            ValueRecord::Inline(value) => {
                buf.put_u8(TAG_INLINE);
                buf.put_u32_le(value.len() as u32);
                buf.put_slice(value);
            }
            ValueRecord::External(reference) => {
                buf.put_u8(TAG_EXTERNAL);
                reference.encode_to(buf);
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_to(&mut buf);
        buf
    }

    pub fn decode_from(buf: &mut impl Buf) -> Result<Self> {
        if !buf.has_remaining() {
            return Err(Error::Corruption("empty value record".into()));
        }
        match buf.get_u8() {
            TAG_INLINE => {
                if buf.remaining() < 4 {
                    return Err(Error::Corruption("inline value header truncated".into()));
                }
                let len = buf.get_u32_le() as usize;
                if buf.remaining() < len {
                    return Err(Error::Corruption("inline value truncated".into()));
                }
                let mut value = vec![0u8; len];
                buf.copy_to_slice(&mut value);
                Ok(ValueRecord::Inline(value))
            }
            TAG_EXTERNAL => Ok(ValueRecord::External(ValueReference::decode_from(buf)?)),
            tag => Err(Error::Corruption(format!("unknown value record tag {}", tag))),
        }
    }
}
