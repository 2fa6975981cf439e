//! zonekv - Write-Ahead Log (WAL)
//! Provides durability by logging every write batch before it is applied to
//! the MemTable. The same framing carries the manifest's VersionEdits.
//!
//! ## Binary Format
//! The log is a sequence of 32 KiB blocks. A logical record is split into one or
//! more physical records, none of which straddles a block boundary:
//! ```text
//! [crc32: 4 bytes (LE)][len: 2 bytes (LE)][type: 1 byte][data: len bytes]
//! ```
//! The checksum covers the type byte and the data. A block tail shorter than a
//! header is zero-filled.

use std::sync::Arc;

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};
use crate::zoned::{FileId, ZonedStore};

pub const BLOCK_SIZE: usize = 32 * 1024;
pub const HEADER_SIZE: usize = 4 + 2 + 1;

/// Physical record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RecordType {
    Zero = 0,
    Full = 1,
    First = 2,
    Middle = 3,
    Last = 4,
}

impl RecordType {
    fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(RecordType::Zero),
            1 => Some(RecordType::Full),
            2 => Some(RecordType::First),
            3 => Some(RecordType::Middle),
            4 => Some(RecordType::Last),
            _ => None,
        }
    }
}

fn record_crc(kind: RecordType, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[kind as u8]);
    hasher.update(data);
    hasher.finalize()
}

/// Frame one logical record, starting at `block_offset` within the current block.
/// Returns the framed bytes and the block offset after them.
fn frame(record: &[u8], mut block_offset: usize) -> (Vec<u8>, usize) {
    let mut buf = Vec::with_capacity(record.len() + HEADER_SIZE * (1 + record.len() / BLOCK_SIZE));
    let mut left = record;
    let mut begin = true;
    loop {
        let leftover = BLOCK_SIZE - block_offset;
        if leftover < HEADER_SIZE {
            buf.put_bytes(0, leftover);
            block_offset = 0;
        }
        let available = BLOCK_SIZE - block_offset - HEADER_SIZE;
        let len = left.len().min(available);
        let end = len == left.len();
        let kind = match (begin, end) {
            (true, true) => RecordType::Full,
            (true, false) => RecordType::First,
            (false, true) => RecordType::Last,
            (false, false) => RecordType::Middle,
        };
        let data = &left[..len];
        buf.put_u32_le(record_crc(kind, data));
        buf.put_u16_le(len as u16);
        buf.put_u8(kind as u8);
        buf.put_slice(data);
        block_offset += HEADER_SIZE + len;
        left = &left[len..];
        begin = false;
        if end {
            return (buf, block_offset);
        }
    }
}

/// Appends framed records to one log file in the zoned store.
pub struct LogWriter {
    store: Arc<ZonedStore>,
    id: FileId,
    block_offset: usize,
}

impl LogWriter {
    /// Allocate a fresh log file.
    pub fn create(store: Arc<ZonedStore>, id: FileId) -> Result<Self> {
        store.allocate(id)?;
        Ok(Self {
            store,
            id,
            block_offset: 0,
        })
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    /// Bytes written so far.
    pub fn size(&self) -> Result<u64> {
        self.store.size(self.id)
    }

    /// Append one logical record. Every physical fragment lands in a single
    /// store append, so a crash tears at most the tail of this record.
    pub fn add_record(&mut self, record: &[u8]) -> Result<()> {
        let (buf, block_offset) = frame(record, self.block_offset);
        self.store.append(self.id, &buf)?;
        self.block_offset = block_offset;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.store.sync(self.id)
    }

    /// Release the log's zone; the file stays readable.
    pub fn close(&self) -> Result<()> {
        self.store.close(self.id)
    }
}

/// Reads logical records back from a log image.
///
/// In non-strict mode a torn or corrupt record ends the log: everything before
/// it is returned and the rest is reported as dropped. Strict mode turns the
/// same condition into `Corruption`.
pub struct LogReader {
    data: Vec<u8>,
    pos: usize,
    strict: bool,
    dropped: usize,
    done: bool,
}

impl LogReader {
    pub fn new(data: Vec<u8>, strict: bool) -> Self {
        Self {
            data,
            pos: 0,
            strict,
            dropped: 0,
            done: false,
        }
    }

    /// Read the whole log file out of the store.
    pub fn open(store: &ZonedStore, id: FileId, strict: bool) -> Result<Self> {
        Ok(Self::new(store.read_all(id)?, strict))
    }

    /// Bytes discarded because of a torn or corrupt tail.
    pub fn dropped_bytes(&self) -> usize {
        self.dropped
    }

    fn stop(&mut self, reason: &str, at: usize) -> Result<Option<Vec<u8>>> {
        self.done = true;
        self.dropped = self.data.len().saturating_sub(at);
        if self.strict {
            return Err(Error::Corruption(format!("log record at {}: {}", at, reason)));
        }
        if self.dropped > 0 {
            log::warn!(
                "Log ends at offset {} ({}); dropping {} bytes",
                at,
                reason,
                self.dropped
            );
        }
        Ok(None)
    }

    /// Next logical record, or `None` at the end of the valid log.
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }
        let mut scratch: Option<(usize, Vec<u8>)> = None;
        loop {
            let mut block_left = BLOCK_SIZE - self.pos % BLOCK_SIZE;
            if block_left < HEADER_SIZE {
                self.pos += block_left;
                block_left = BLOCK_SIZE;
            }
            if self.pos + HEADER_SIZE > self.data.len() {
                return match scratch {
                    Some((start, _)) => self.stop("truncated fragmented record", start),
                    None => {
                        let at = self.pos.min(self.data.len());
                        if at < self.data.len() {
                            self.stop("truncated header", at)
                        } else {
                            self.done = true;
                            Ok(None)
                        }
                    }
                };
            }

            let start = self.pos;
            let mut header = &self.data[start..start + HEADER_SIZE];
            let crc = header.get_u32_le();
            let len = header.get_u16_le() as usize;
            let kind_byte = header.get_u8();
            let body_start = start + HEADER_SIZE;
            if body_start + len > self.data.len() {
                let at = scratch.as_ref().map_or(start, |(s, _)| *s);
                return self.stop("truncated record", at);
            }
            let kind = match RecordType::from_u8(kind_byte) {
                Some(RecordType::Zero) if len == 0 && crc == 0 => {
                    // Zero padding: nothing else in this block.
                    self.pos = start + block_left;
                    continue;
                }
                Some(kind) => kind,
                None => {
                    let at = scratch.as_ref().map_or(start, |(s, _)| *s);
                    return self.stop("unknown record type", at);
                }
            };
            let body = &self.data[body_start..body_start + len];
            if record_crc(kind, body) != crc {
                let at = scratch.as_ref().map_or(start, |(s, _)| *s);
                return self.stop("checksum mismatch", at);
            }
            self.pos = body_start + len;

            match kind {
                RecordType::Full if scratch.is_none() => return Ok(Some(body.to_vec())),
                RecordType::First if scratch.is_none() => scratch = Some((start, body.to_vec())),
                RecordType::Middle | RecordType::Last if scratch.is_some() => {
                    if let Some((_, buf)) = scratch.as_mut() {
                        buf.extend_from_slice(body);
                    }
                    if kind == RecordType::Last {
                        return Ok(scratch.map(|(_, buf)| buf));
                    }
                }
                _ => {
                    let at = scratch.as_ref().map_or(start, |(s, _)| *s);
                    return self.stop("fragment out of order", at);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zoned::MemoryZonedDevice;

    fn read_all(data: Vec<u8>, strict: bool) -> Result<Vec<Vec<u8>>> {
        let mut reader = LogReader::new(data, strict);
        let mut records = Vec::new();
        while let Some(record) = reader.read_record()? {
            records.push(record);
        }
        Ok(records)
    }

    fn encode_all(records: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut offset = 0;
        for record in records {
            let (buf, next) = frame(record, offset);
            out.extend_from_slice(&buf);
            offset = next;
        }
        out
    }

    #[test]
    fn test_small_and_fragmented_records() {
        let records = vec![
            b"small".to_vec(),
            vec![7u8; BLOCK_SIZE * 2 + 100],
            Vec::new(),
            b"after".to_vec(),
        ];
        let data = encode_all(&records);
        assert_eq!(read_all(data, true).unwrap(), records);
    }

    #[test]
    fn test_block_trailer_is_padded() {
        let first = vec![1u8; BLOCK_SIZE - HEADER_SIZE - 3];
        let records = vec![first, b"next".to_vec()];
        let data = encode_all(&records);
        assert_eq!(data.len(), BLOCK_SIZE + HEADER_SIZE + 4);
        assert_eq!(read_all(data, true).unwrap(), records);
    }

    #[test]
    fn test_torn_tail_is_safe_stop() {
        let records = vec![b"one".to_vec(), b"two".to_vec(), vec![9u8; 500]];
        let mut data = encode_all(&records);
        data.truncate(data.len() - 10);
        let mut reader = LogReader::new(data, false);
        assert_eq!(reader.read_record().unwrap(), Some(b"one".to_vec()));
        assert_eq!(reader.read_record().unwrap(), Some(b"two".to_vec()));
        assert_eq!(reader.read_record().unwrap(), None);
        assert!(reader.dropped_bytes() > 0);
    }

    #[test]
    fn test_strict_mode_reports_corruption() {
        let records = vec![b"one".to_vec(), b"two".to_vec()];
        let mut data = encode_all(&records);
        let last = data.len() - 1;
        data[last] ^= 0xff;
        assert!(matches!(read_all(data.clone(), true), Err(Error::Corruption(_))));
        assert_eq!(read_all(data, false).unwrap(), vec![b"one".to_vec()]);
    }

    #[test]
    fn test_writer_through_store() {
        let device = MemoryZonedDevice::new(64 * 1024, 8);
        let store = Arc::new(ZonedStore::open(Arc::new(device)).unwrap());
        let id = FileId::log(3);
        let mut writer = LogWriter::create(store.clone(), id).unwrap();
        let big = vec![5u8; BLOCK_SIZE + 10];
        writer.add_record(b"alpha").unwrap();
        writer.add_record(&big).unwrap();
        writer.sync().unwrap();
        writer.close().unwrap();

        let mut reader = LogReader::open(&store, id, true).unwrap();
        assert_eq!(reader.read_record().unwrap(), Some(b"alpha".to_vec()));
        assert_eq!(reader.read_record().unwrap(), Some(big));
        assert_eq!(reader.read_record().unwrap(), None);
    }
}
