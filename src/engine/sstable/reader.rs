//! Sorted file reader.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::{FileNumber, InternalKey, ValueRecord};
use crate::zoned::{FileId, ZonedStore};

use super::block::{decode_block, BlockHandle, Footer, FOOTER_SIZE};
use super::bloom::BloomFilter;
use super::FILTER_BLOCK_NAME;
use crate::engine::iterator::InternalIterator;

/// An open sorted file. The index and filter stay in memory; data blocks are
/// read from the store on demand.
pub struct Table {
    store: Arc<ZonedStore>,
    id: FileId,
    size: u64,
    /// Last key of every data block, with the block's location.
    index: Vec<(InternalKey, BlockHandle)>,
    filter: Option<BloomFilter>,
    entry_count: u64,
}

impl Table {
    pub fn open(store: Arc<ZonedStore>, number: FileNumber) -> Result<Self> {
        let id = FileId::table(number);
        let size = store.size(id)?;
        if size < FOOTER_SIZE as u64 {
            return Err(Error::Corruption(format!("{:?} is too short", id)));
        }
        let mut footer = vec![0u8; FOOTER_SIZE];
        store.read(id, size - FOOTER_SIZE as u64, &mut footer)?;
        let footer = Footer::decode(&footer)?;

        let mut index = Vec::new();
        for (key, handle) in decode_block(&read_block(&store, id, footer.index)?)? {
            let key = InternalKey::decode_from(&mut key.as_slice())?;
            let handle = BlockHandle::decode_from(&mut handle.as_slice())?;
            index.push((key, handle));
        }

        let mut filter = None;
        for (name, handle) in decode_block(&read_block(&store, id, footer.meta_index)?)? {
            if name == FILTER_BLOCK_NAME.as_bytes() {
                let handle = BlockHandle::decode_from(&mut handle.as_slice())?;
                let block = decode_block(&read_block(&store, id, handle)?)?;
                if let Some((_, data)) = block.first() {
                    filter = Some(BloomFilter::decode(data)?);
                }
            }
        }

        Ok(Self {
            store,
            id,
            size,
            index,
            filter,
            entry_count: footer.entry_count,
        })
    }

    pub fn number(&self) -> FileNumber {
        self.id.number
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    fn block_entries(&self, block: usize) -> Result<Vec<(InternalKey, ValueRecord)>> {
        let (_, handle) = &self.index[block];
        let pairs = decode_block(&read_block(&self.store, self.id, *handle)?)?;
        pairs
            .into_iter()
            .map(|(key, value)| {
                Ok((
                    InternalKey::decode_from(&mut key.as_slice())?,
                    ValueRecord::decode_from(&mut value.as_slice())?,
                ))
            })
            .collect()
    }

    /// Index of the first block whose last key is not less than `target`.
    fn find_block(&self, target: &InternalKey) -> usize {
        self.index.partition_point(|(last, _)| last < target)
    }

    /// First entry at or after `lookup` with the same user key.
    pub fn get(&self, lookup: &InternalKey) -> Result<Option<(InternalKey, ValueRecord)>> {
        if let Some(filter) = &self.filter {
            if !filter.may_contain(&lookup.user_key) {
                return Ok(None);
            }
        }
        let block = self.find_block(lookup);
        if block >= self.index.len() {
            return Ok(None);
        }
        let entries = self.block_entries(block)?;
        let pos = entries.partition_point(|(key, _)| key < lookup);
        Ok(entries
            .into_iter()
            .nth(pos)
            .filter(|(key, _)| key.user_key == lookup.user_key))
    }

    pub fn iter(self: &Arc<Self>) -> TableIterator {
        TableIterator {
            table: Arc::clone(self),
            block: self.index.len(),
            entries: Vec::new(),
            pos: 0,
        }
    }
}

fn read_block(store: &ZonedStore, id: FileId, handle: BlockHandle) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; handle.stored_len() as usize];
    store.read(id, handle.offset, &mut buf)?;
    Ok(buf)
}

/// Two-level iterator: walks the index and loads one data block at a time.
pub struct TableIterator {
    table: Arc<Table>,
    block: usize,
    entries: Vec<(InternalKey, ValueRecord)>,
    pos: usize,
}

impl TableIterator {
    fn load(&mut self, block: usize) -> Result<()> {
        self.block = block;
        self.pos = 0;
        self.entries = if block < self.table.index.len() {
            self.table.block_entries(block)?
        } else {
            Vec::new()
        };
        Ok(())
    }

    fn skip_exhausted_blocks(&mut self) -> Result<()> {
        while self.pos >= self.entries.len() && self.block < self.table.index.len() {
            self.load(self.block + 1)?;
        }
        Ok(())
    }
}

impl InternalIterator for TableIterator {
    fn valid(&self) -> bool {
        self.pos < self.entries.len()
    }

    fn seek_to_first(&mut self) -> Result<()> {
        self.load(0)?;
        self.skip_exhausted_blocks()
    }

    fn seek(&mut self, target: &InternalKey) -> Result<()> {
        let block = self.table.find_block(target);
        self.load(block)?;
        self.pos = self.entries.partition_point(|(key, _)| key < target);
        self.skip_exhausted_blocks()
    }

    fn next(&mut self) -> Result<()> {
        self.pos += 1;
        self.skip_exhausted_blocks()
    }

    fn key(&self) -> &InternalKey {
        &self.entries[self.pos].0
    }

    fn value(&self) -> &ValueRecord {
        &self.entries[self.pos].1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sstable::TableBuilder;
    use crate::types::{ValueKind, ValueReference};
    use crate::zoned::MemoryZonedDevice;

    fn store() -> Arc<ZonedStore> {
        let device = MemoryZonedDevice::new(64 * 1024, 16);
        Arc::new(ZonedStore::open(Arc::new(device)).unwrap())
    }

    fn key(i: usize) -> Vec<u8> {
        format!("key{:04}", i).into_bytes()
    }

    fn build(store: &Arc<ZonedStore>, number: u64, count: usize) {
        let mut builder = TableBuilder::create(store.clone(), number, 256, 10).unwrap();
        for i in 0..count {
            let value = if i % 10 == 0 {
                ValueRecord::External(ValueReference {
                    file_number: 99,
                    offset: i as u64,
                    length: 1000,
                })
            } else {
                ValueRecord::Inline(format!("value{}", i).into_bytes())
            };
            builder
                .add(&InternalKey::new(key(i), i as u64 + 1, ValueKind::Put), &value)
                .unwrap();
        }
        let built = builder.finish().unwrap();
        assert_eq!(built.entries, count as u64);
        assert!(built.value_files.contains(&99));
    }

    #[test]
    fn test_point_lookups() {
        let store = store();
        build(&store, 7, 200);
        let table = Table::open(store, 7).unwrap();
        assert_eq!(table.entry_count(), 200);
        let (found, value) = table
            .get(&InternalKey::lookup(&key(42), 1000))
            .unwrap()
            .unwrap();
        assert_eq!(found.sequence, 43);
        assert_eq!(value, ValueRecord::Inline(b"value42".to_vec()));
        // Not yet visible at sequence 10.
        assert!(table.get(&InternalKey::lookup(&key(42), 10)).unwrap().is_none());
        assert!(table.get(&InternalKey::lookup(b"nope", 1000)).unwrap().is_none());
    }

    #[test]
    fn test_iterator_walks_every_block() {
        let store = store();
        build(&store, 3, 150);
        let table = Arc::new(Table::open(store, 3).unwrap());
        let mut it = table.iter();
        it.seek_to_first().unwrap();
        let mut count = 0;
        let mut last: Option<InternalKey> = None;
        while it.valid() {
            if let Some(prev) = &last {
                assert!(prev < it.key());
            }
            last = Some(it.key().clone());
            count += 1;
            it.next().unwrap();
        }
        assert_eq!(count, 150);

        it.seek(&InternalKey::lookup(&key(77), 1000)).unwrap();
        assert_eq!(it.key().user_key, key(77));
        it.seek(&InternalKey::lookup(b"zzz", 1000)).unwrap();
        assert!(!it.valid());
    }

    #[test]
    fn test_dropped_builder_leaves_no_file() {
        let store = store();
        {
            let mut builder = TableBuilder::create(store.clone(), 5, 256, 10).unwrap();
            builder
                .add(&InternalKey::new(b"a".to_vec(), 1, ValueKind::Put), &ValueRecord::empty())
                .unwrap();
        }
        assert!(!store.exists(FileId::table(5)));
    }

    #[test]
    fn test_out_of_order_keys_rejected() {
        let store = store();
        let mut builder = TableBuilder::create(store, 9, 256, 10).unwrap();
        builder
            .add(&InternalKey::new(b"b".to_vec(), 1, ValueKind::Put), &ValueRecord::empty())
            .unwrap();
        let err = builder
            .add(&InternalKey::new(b"a".to_vec(), 2, ValueKind::Put), &ValueRecord::empty())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
