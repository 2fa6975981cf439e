//! zonekv - Write Batch
//! An ordered group of puts and deletes applied atomically under one
//! contiguous range of sequence numbers.
//!
//! ## Binary Format
//! ```text
//! [sequence: 8 bytes (LE)][count: 4 bytes (LE)]
//! count x [kind: 1 byte][key_len: 4 bytes (LE)][key][value_record (puts only)]
//! ```

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};
use crate::types::{Key, SequenceNumber, Value, ValueKind, ValueRecord, ValueReference};

const HEADER_SIZE: usize = 8 + 4;

/// One operation of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    pub kind: ValueKind,
    pub key: Key,
    pub value: ValueRecord,
    /// Apply only if the key's newest value is still this external reference.
    /// Evaluated by the write leader and never logged.
    pub expected: Option<ValueReference>,
}

impl BatchEntry {
    fn encoded_len(&self) -> usize {
        1 + 4
            + self.key.len()
            + match self.kind {
                ValueKind::Put => self.value.encoded_len(),
                ValueKind::Delete => 0,
            }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    entries: Vec<BatchEntry>,
    sequence: SequenceNumber,
    encoded_size: usize,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            sequence: 0,
            encoded_size: HEADER_SIZE,
        }
    }

    fn push(&mut self, entry: BatchEntry) {
        if self.encoded_size == 0 {
            self.encoded_size = HEADER_SIZE;
        }
        self.encoded_size += entry.encoded_len();
        self.entries.push(entry);
    }

    pub fn put(&mut self, key: impl Into<Key>, value: impl Into<Value>) {
        self.push(BatchEntry {
            kind: ValueKind::Put,
            key: key.into(),
            value: ValueRecord::Inline(value.into()),
            expected: None,
        });
    }

    pub fn delete(&mut self, key: impl Into<Key>) {
        self.push(BatchEntry {
            kind: ValueKind::Delete,
            key: key.into(),
            value: ValueRecord::empty(),
            expected: None,
        });
    }

    /// Put `value` only if `key` still resolves to `expected`.
    pub(crate) fn put_if(&mut self, key: impl Into<Key>, value: impl Into<Value>, expected: ValueReference) {
        self.push(BatchEntry {
            kind: ValueKind::Put,
            key: key.into(),
            value: ValueRecord::Inline(value.into()),
            expected: Some(expected),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Size of the encoded batch in bytes.
    pub fn approximate_size(&self) -> usize {
        self.encoded_size.max(HEADER_SIZE)
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }

    pub fn set_sequence(&mut self, sequence: SequenceNumber) {
        self.sequence = sequence;
    }

    pub fn has_conditions(&self) -> bool {
        self.entries.iter().any(|e| e.expected.is_some())
    }

    /// Keep only the entries for which `keep` returns true.
    pub(crate) fn retain(&mut self, mut keep: impl FnMut(&BatchEntry) -> bool) {
        self.entries.retain(|e| keep(e));
        self.encoded_size = HEADER_SIZE + self.entries.iter().map(BatchEntry::encoded_len).sum::<usize>();
    }

    /// Move every entry of `other` to the end of this batch.
    pub fn append(&mut self, other: &WriteBatch) {
        for entry in &other.entries {
            self.push(entry.clone());
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.approximate_size());
        buf.put_u64_le(self.sequence);
        buf.put_u32_le(self.entries.len() as u32);
        for entry in &self.entries {
            buf.put_u8(entry.kind as u8);
            buf.put_u32_le(entry.key.len() as u32);
            buf.put_slice(&entry.key);
            if entry.kind == ValueKind::Put {
                entry.value.encode_to(&mut buf);
            }
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        if buf.remaining() < HEADER_SIZE {
            return Err(Error::Corruption("write batch too short".into()));
        }
        let sequence = buf.get_u64_le();
        let count = buf.get_u32_le() as usize;
        let mut batch = WriteBatch::new();
        batch.sequence = sequence;
        for _ in 0..count {
            if buf.remaining() < 5 {
                return Err(Error::Corruption("write batch entry truncated".into()));
            }
            let kind = ValueKind::from_u8(buf.get_u8())?;
            let key_len = buf.get_u32_le() as usize;
            if buf.remaining() < key_len {
                return Err(Error::Corruption("write batch key truncated".into()));
            }
            let mut key = vec![0u8; key_len];
            buf.copy_to_slice(&mut key);
            let value = match kind {
                ValueKind::Put => ValueRecord::decode_from(&mut buf)?,
                ValueKind::Delete => ValueRecord::empty(),
            };
            batch.push(BatchEntry {
                kind,
                key,
                value,
                expected: None,
            });
        }
        if buf.has_remaining() {
            return Err(Error::Corruption(format!(
                "{} trailing bytes after write batch",
                buf.remaining()
            )));
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let mut batch = WriteBatch::new();
        batch.put(b"a".to_vec(), b"1".to_vec());
        batch.delete(b"b".to_vec());
        batch.put(b"c".to_vec(), vec![3u8; 100]);
        batch.set_sequence(42);
        let encoded = batch.encode();
        assert_eq!(encoded.len(), batch.approximate_size());
        let decoded = WriteBatch::decode(&encoded).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn test_conditions_are_not_logged() {
        let mut batch = WriteBatch::new();
        let reference = ValueReference {
            file_number: 1,
            offset: 0,
            length: 10,
        };
        batch.put_if(b"k".to_vec(), b"v".to_vec(), reference);
        assert!(batch.has_conditions());
        let decoded = WriteBatch::decode(&batch.encode()).unwrap();
        assert!(!decoded.has_conditions());
        assert_eq!(decoded.entries()[0].key, b"k".to_vec());
    }

    #[test]
    fn test_append_and_retain() {
        let mut a = WriteBatch::new();
        a.put(b"x".to_vec(), b"1".to_vec());
        let mut b = WriteBatch::new();
        b.delete(b"y".to_vec());
        b.put(b"z".to_vec(), b"2".to_vec());
        a.append(&b);
        assert_eq!(a.len(), 3);
        a.retain(|e| e.kind == ValueKind::Put);
        assert_eq!(a.len(), 2);
        assert_eq!(a.encode().len(), a.approximate_size());
    }

    #[test]
    fn test_truncated_batch_is_corrupt() {
        let mut batch = WriteBatch::new();
        batch.put(b"key".to_vec(), b"value".to_vec());
        let encoded = batch.encode();
        assert!(WriteBatch::decode(&encoded[..encoded.len() - 2]).is_err());
    }
}
