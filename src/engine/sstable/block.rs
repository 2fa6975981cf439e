//! Block and footer codecs of the sorted file format.
//!
//! ## Block
//! ```text
//! count x [key_len: u32][key][value_len: u32][value]
//! [count: u32][crc32 of everything before: u32]
//! ```
//! Data blocks hold encoded InternalKey -> ValueRecord pairs, the index block
//! holds last-key-of-block -> BlockHandle, and the meta-index block holds
//! block name -> BlockHandle.
//!
//! ## Footer (fixed size, at the end of the file)
//! ```text
//! [meta_index: BlockHandle][index: BlockHandle][entry_count: u64][crc32: u32][magic: u64]
//! ```

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};

pub const FOOTER_SIZE: usize = BlockHandle::ENCODED_LEN * 2 + 8 + 4 + 8;
const TABLE_MAGIC: u64 = 0x7a6b_7673_7374_6231;

/// Location of a block inside a sorted file. `size` excludes the checksum trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    pub const ENCODED_LEN: usize = 16;

    pub fn encode_to(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.offset);
        buf.put_u64_le(self.size);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::ENCODED_LEN);
        self.encode_to(&mut buf);
        buf
    }

    pub fn decode_from(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::ENCODED_LEN {
            return Err(Error::Corruption("block handle truncated".into()));
        }
        Ok(Self {
            offset: buf.get_u64_le(),
            size: buf.get_u64_le(),
        })
    }

    /// Bytes on disk including the checksum trailer.
    pub fn stored_len(&self) -> u64 {
        self.size + 4
    }
}

#[derive(Debug, Default)]
pub struct BlockBuilder {
    buf: Vec<u8>,
    count: u32,
}

impl BlockBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        self.buf.put_u32_le(key.len() as u32);
        self.buf.put_slice(key);
        self.buf.put_u32_le(value.len() as u32);
        self.buf.put_slice(value);
        self.count += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn size_estimate(&self) -> usize {
        self.buf.len() + 8
    }

    /// Seal the block: returns the content length (the handle size) and the
    /// bytes to write, checksum included. The builder is left empty.
    pub fn finish(&mut self) -> (u64, Vec<u8>) {
        let mut out = std::mem::take(&mut self.buf);
        out.put_u32_le(self.count);
        let size = out.len() as u64;
        let crc = crc32fast::hash(&out);
        out.put_u32_le(crc);
        self.count = 0;
        (size, out)
    }
}

/// Verify the trailer of a stored block and split it into raw pairs.
pub fn decode_block(stored: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    if stored.len() < 8 {
        return Err(Error::Corruption("block too short".into()));
    }
    let (content, mut trailer) = stored.split_at(stored.len() - 4);
    if crc32fast::hash(content) != trailer.get_u32_le() {
        return Err(Error::Corruption("block checksum mismatch".into()));
    }
    let (mut body, mut count_bytes) = content.split_at(content.len() - 4);
    let count = count_bytes.get_u32_le() as usize;
    let mut pairs = Vec::with_capacity(count);
    for _ in 0..count {
        let key = take_slice(&mut body)?;
        let value = take_slice(&mut body)?;
        pairs.push((key, value));
    }
    if body.has_remaining() {
        return Err(Error::Corruption("trailing bytes in block".into()));
    }
    Ok(pairs)
}

fn take_slice(buf: &mut &[u8]) -> Result<Vec<u8>> {
    if buf.remaining() < 4 {
        return Err(Error::Corruption("block entry truncated".into()));
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(Error::Corruption("block entry truncated".into()));
    }
    let out = buf[..len].to_vec();
    buf.advance(len);
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub meta_index: BlockHandle,
    pub index: BlockHandle,
    pub entry_count: u64,
}

impl Footer {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FOOTER_SIZE);
        self.meta_index.encode_to(&mut buf);
        self.index.encode_to(&mut buf);
        buf.put_u64_le(self.entry_count);
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        buf.put_u64_le(TABLE_MAGIC);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != FOOTER_SIZE {
            return Err(Error::Corruption("footer has the wrong size".into()));
        }
        let checked = &data[..FOOTER_SIZE - 12];
        let mut tail = &data[FOOTER_SIZE - 12..];
        let crc = tail.get_u32_le();
        if tail.get_u64_le() != TABLE_MAGIC {
            return Err(Error::Corruption("not a sorted file (bad magic)".into()));
        }
        if crc32fast::hash(checked) != crc {
            return Err(Error::Corruption("footer checksum mismatch".into()));
        }
        let mut buf = checked;
        Ok(Self {
            meta_index: BlockHandle::decode_from(&mut buf)?,
            index: BlockHandle::decode_from(&mut buf)?,
            entry_count: buf.get_u64_le(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_codec() {
        let mut builder = BlockBuilder::new();
        builder.add(b"k1", b"v1");
        builder.add(b"k2", b"");
        let (size, stored) = builder.finish();
        assert_eq!(stored.len() as u64, size + 4);
        assert!(builder.is_empty());
        let pairs = decode_block(&stored).unwrap();
        assert_eq!(
            pairs,
            vec![(b"k1".to_vec(), b"v1".to_vec()), (b"k2".to_vec(), Vec::new())]
        );
    }

    #[test]
    fn test_block_checksum() {
        let mut builder = BlockBuilder::new();
        builder.add(b"key", b"value");
        let (_, mut stored) = builder.finish();
        stored[3] ^= 1;
        assert!(matches!(decode_block(&stored), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_footer_codec() {
        let footer = Footer {
            meta_index: BlockHandle { offset: 100, size: 20 },
            index: BlockHandle { offset: 124, size: 60 },
            entry_count: 9,
        };
        let encoded = footer.encode();
        assert_eq!(encoded.len(), FOOTER_SIZE);
        assert_eq!(Footer::decode(&encoded).unwrap(), footer);
        let mut bad = encoded.clone();
        bad[FOOTER_SIZE - 1] ^= 0xff;
        assert!(Footer::decode(&bad).is_err());
    }
}
