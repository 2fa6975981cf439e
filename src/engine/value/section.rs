//! Value file sections.
//!
//! ```text
//! section = [value bytes]+ [key index block] [footer]
//! footer  = [prev_end: u64][index_offset: u64][index_size: u32][crc32: u32][magic: u64]
//! ```
//! The key index is a sorted-file block mapping user key -> ValueReference.
//! `prev_end` is the file offset where the previous section ended, so a file
//! can be walked from its last footer back to the first section.

use bytes::{Buf, BufMut};

use crate::engine::sstable::block::{decode_block, BlockBuilder};
use crate::error::{Error, Result};
use crate::types::{Key, ValueReference};
use crate::zoned::{FileId, ZonedStore};

pub const SECTION_FOOTER_SIZE: usize = 8 + 8 + 4 + 4 + 8;
const SECTION_MAGIC: u64 = 0x421d_413b_4533_423b;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionFooter {
    pub prev_end: u64,
    pub index_offset: u64,
    pub index_size: u32,
}

impl SectionFooter {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SECTION_FOOTER_SIZE);
        buf.put_u64_le(self.prev_end);
        buf.put_u64_le(self.index_offset);
        buf.put_u32_le(self.index_size);
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        buf.put_u64_le(SECTION_MAGIC);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != SECTION_FOOTER_SIZE {
            return Err(Error::Corruption("section footer has the wrong size".into()));
        }
        let (checked, mut tail) = data.split_at(20);
        let crc = tail.get_u32_le();
        if tail.get_u64_le() != SECTION_MAGIC || crc32fast::hash(checked) != crc {
            return Err(Error::Corruption("invalid section footer".into()));
        }
        let mut buf = checked;
        Ok(Self {
            prev_end: buf.get_u64_le(),
            index_offset: buf.get_u64_le(),
            index_size: buf.get_u32_le(),
        })
    }

    /// File offset just past this footer.
    pub fn end(&self) -> u64 {
        self.index_offset + self.index_size as u64 + SECTION_FOOTER_SIZE as u64
    }

    /// A footer found at `footer_offset` must describe a section that ends there.
    fn consistent_at(&self, footer_offset: u64) -> bool {
        self.prev_end <= self.index_offset
            && self.index_offset + self.index_size as u64 == footer_offset
    }
}

/// Key index of the section being written.
#[derive(Debug, Default)]
pub struct SectionIndex {
    block: BlockBuilder,
    count: u64,
}

impl SectionIndex {
    pub fn add(&mut self, key: &[u8], reference: &ValueReference) {
        let mut encoded = Vec::with_capacity(ValueReference::ENCODED_LEN);
        reference.encode_to(&mut encoded);
        self.block.add(key, &encoded);
        self.count += 1;
    }

    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn size_estimate(&self) -> usize {
        self.block.size_estimate()
    }

    /// Index block plus footer, ready to append at `index_offset`.
    pub fn finish(&mut self, prev_end: u64, index_offset: u64) -> Vec<u8> {
        let (_, mut stored) = self.block.finish();
        let footer = SectionFooter {
            prev_end,
            index_offset,
            index_size: stored.len() as u32,
        };
        stored.extend_from_slice(&footer.encode());
        self.count = 0;
        stored
    }
}

/// Read the key index of one section.
pub fn read_index(
    store: &ZonedStore,
    id: FileId,
    footer: &SectionFooter,
) -> Result<Vec<(Key, ValueReference)>> {
    let mut stored = vec![0u8; footer.index_size as usize];
    store.read(id, footer.index_offset, &mut stored)?;
    decode_block(&stored)?
        .into_iter()
        .map(|(key, reference)| Ok((key, ValueReference::decode_from(&mut reference.as_slice())?)))
        .collect()
}

/// Footers of every complete section, last section first.
///
/// Bytes after the last complete section (a flush torn by a crash) are skipped
/// by scanning backwards for the newest valid footer.
pub fn read_footers(store: &ZonedStore, id: FileId) -> Result<Vec<SectionFooter>> {
    let size = store.size(id)?;
    let mut footers = Vec::new();
    let mut end = size;
    if let Some(footer) = footer_ending_at(store, id, end)? {
        footers.push(footer);
    } else if end > 0 {
        log::warn!(
            "{:?} does not end with a section footer, scanning for the last complete section",
            id
        );
        match scan_for_last_footer(&store.read_all(id)?) {
            Some(footer) => footers.push(footer),
            None => return Ok(footers),
        }
    }
    while let Some(last) = footers.last() {
        end = last.prev_end;
        if end == 0 {
            break;
        }
        match footer_ending_at(store, id, end)? {
            Some(footer) => footers.push(footer),
            None => {
                return Err(Error::Corruption(format!(
                    "{:?}: no section footer before offset {}",
                    id, end
                )))
            }
        }
    }
    Ok(footers)
}

fn footer_ending_at(store: &ZonedStore, id: FileId, end: u64) -> Result<Option<SectionFooter>> {
    if end < SECTION_FOOTER_SIZE as u64 {
        return Ok(None);
    }
    let offset = end - SECTION_FOOTER_SIZE as u64;
    let mut buf = vec![0u8; SECTION_FOOTER_SIZE];
    store.read(id, offset, &mut buf)?;
    Ok(SectionFooter::decode(&buf)
        .ok()
        .filter(|footer| footer.consistent_at(offset)))
}

fn scan_for_last_footer(data: &[u8]) -> Option<SectionFooter> {
    if data.len() < SECTION_FOOTER_SIZE {
        return None;
    }
    (0..=data.len() - SECTION_FOOTER_SIZE).rev().find_map(|offset| {
        SectionFooter::decode(&data[offset..offset + SECTION_FOOTER_SIZE])
            .ok()
            .filter(|footer| footer.consistent_at(offset as u64))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::zoned::MemoryZonedDevice;

    fn reference(offset: u64, length: u32) -> ValueReference {
        ValueReference {
            file_number: 4,
            offset,
            length,
        }
    }

    fn write_section(store: &ZonedStore, id: FileId, keys: &[&str]) {
        let prev_end = store.size(id).unwrap();
        let mut index = SectionIndex::default();
        for key in keys {
            let offset = store.append(id, &[7u8; 100]).unwrap();
            index.add(key.as_bytes(), &reference(offset, 100));
        }
        let index_offset = store.size(id).unwrap();
        store.append(id, &index.finish(prev_end, index_offset)).unwrap();
    }

    fn store_with_file() -> (Arc<ZonedStore>, FileId) {
        let device = MemoryZonedDevice::new(64 * 1024, 16);
        let store = Arc::new(ZonedStore::open(Arc::new(device)).unwrap());
        let id = FileId::value(4);
        store.allocate(id).unwrap();
        (store, id)
    }

    #[test]
    fn test_footer_rejects_garbage() {
        let footer = SectionFooter {
            prev_end: 0,
            index_offset: 300,
            index_size: 40,
        };
        let encoded = footer.encode();
        assert_eq!(SectionFooter::decode(&encoded).unwrap(), footer);
        let mut bad = encoded.clone();
        bad[0] ^= 1;
        assert!(SectionFooter::decode(&bad).is_err());
    }

    #[test]
    fn test_walks_sections_backwards() {
        let (store, id) = store_with_file();
        write_section(&store, id, &["a", "b"]);
        write_section(&store, id, &["c"]);
        let footers = read_footers(&store, id).unwrap();
        assert_eq!(footers.len(), 2);
        assert_eq!(footers[1].prev_end, 0);
        let newest = read_index(&store, id, &footers[0]).unwrap();
        assert_eq!(newest.len(), 1);
        assert_eq!(newest[0].0, b"c".to_vec());
        let oldest = read_index(&store, id, &footers[1]).unwrap();
        assert_eq!(oldest[1].1, reference(100, 100));
    }

    #[test]
    fn test_skips_torn_last_section() {
        let (store, id) = store_with_file();
        write_section(&store, id, &["a"]);
        write_section(&store, id, &["b"]);
        // Values of a third section whose index never made it to disk.
        store.append(id, &[9u8; 250]).unwrap();
        let footers = read_footers(&store, id).unwrap();
        assert_eq!(footers.len(), 2);
        let keys: Vec<Key> = footers
            .iter()
            .flat_map(|footer| read_index(&store, id, footer).unwrap())
            .map(|(key, _)| key)
            .collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"a".to_vec()]);
    }
}
