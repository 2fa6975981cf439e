//! Sorted file builder.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::{FileNumber, InternalKey, ValueRecord};
use crate::zoned::{FileId, ZonedStore};

use super::block::{BlockBuilder, BlockHandle, Footer};
use super::bloom::BloomFilter;
use super::FILTER_BLOCK_NAME;

/// Metadata of a finished sorted file.
#[derive(Debug, Clone)]
pub struct BuiltTable {
    pub number: FileNumber,
    pub size: u64,
    pub smallest: InternalKey,
    pub largest: InternalKey,
    pub entries: u64,
    /// Value files referenced by the table's entries.
    pub value_files: BTreeSet<FileNumber>,
}

/// Streams sorted entries into a new table file.
///
/// Dropping a builder that was not finished deletes the partial file, so an
/// error on any path leaves nothing visible behind.
pub struct TableBuilder {
    store: Arc<ZonedStore>,
    id: FileId,
    block_size: usize,
    bloom_bits_per_key: usize,
    data: BlockBuilder,
    index: BlockBuilder,
    filter_keys: Vec<Vec<u8>>,
    offset: u64,
    smallest: Option<InternalKey>,
    last_key: Option<InternalKey>,
    entries: u64,
    value_files: BTreeSet<FileNumber>,
    finished: bool,
}

impl TableBuilder {
    pub fn create(
        store: Arc<ZonedStore>,
        number: FileNumber,
        block_size: usize,
        bloom_bits_per_key: usize,
    ) -> Result<Self> {
        let id = FileId::table(number);
        store.allocate(id)?;
        Ok(Self {
            store,
            id,
            block_size,
            bloom_bits_per_key,
            data: BlockBuilder::new(),
            index: BlockBuilder::new(),
            filter_keys: Vec::new(),
            offset: 0,
            smallest: None,
            last_key: None,
            entries: 0,
            value_files: BTreeSet::new(),
            finished: false,
        })
    }

    pub fn number(&self) -> FileNumber {
        self.id.number
    }

    /// Add the next entry; keys must arrive in strictly increasing order.
    pub fn add(&mut self, key: &InternalKey, value: &ValueRecord) -> Result<()> {
        if let Some(last) = &self.last_key {
            if key <= last {
                return Err(Error::InvalidArgument(format!(
                    "table keys out of order: {:?} after {:?}",
                    key, last
                )));
            }
        }
        if self.bloom_bits_per_key > 0
            && self.filter_keys.last().map(|k| k.as_slice()) != Some(key.user_key.as_slice())
        {
            self.filter_keys.push(key.user_key.clone());
        }
        if let Some(reference) = value.external() {
            self.value_files.insert(reference.file_number);
        }
        if self.smallest.is_none() {
            self.smallest = Some(key.clone());
        }
        self.data.add(&key.encode(), &value.encode());
        self.last_key = Some(key.clone());
        self.entries += 1;
        if self.data.size_estimate() >= self.block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    fn write_block(&mut self, block: &mut BlockBuilder) -> Result<BlockHandle> {
        let (size, stored) = block.finish();
        let handle = BlockHandle {
            offset: self.offset,
            size,
        };
        self.store.append(self.id, &stored)?;
        self.offset += stored.len() as u64;
        Ok(handle)
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.data.is_empty() {
            return Ok(());
        }
        let mut data = std::mem::take(&mut self.data);
        let handle = self.write_block(&mut data)?;
        if let Some(last) = &self.last_key {
            self.index.add(&last.encode(), &handle.encode());
        }
        Ok(())
    }

    pub fn num_entries(&self) -> u64 {
        self.entries
    }

    /// Bytes written so far plus the pending block.
    pub fn file_size(&self) -> u64 {
        self.offset + self.data.size_estimate() as u64
    }

    /// Write the filter, meta-index, index and footer, then sync and close the file.
    pub fn finish(mut self) -> Result<BuiltTable> {
        let (smallest, largest) = match (self.smallest.clone(), self.last_key.clone()) {
            (Some(smallest), Some(largest)) => (smallest, largest),
            _ => return Err(Error::InvalidArgument("cannot finish an empty table".into())),
        };
        self.flush_block()?;

        let mut meta_index = BlockBuilder::new();
        if self.bloom_bits_per_key > 0 {
            let mut filter = BloomFilter::new(self.filter_keys.len(), self.bloom_bits_per_key);
            for key in &self.filter_keys {
                filter.insert(key);
            }
            let mut block = BlockBuilder::new();
            block.add(b"bloom", &filter.encode());
            let handle = self.write_block(&mut block)?;
            meta_index.add(FILTER_BLOCK_NAME.as_bytes(), &handle.encode());
        }
        let meta_index = self.write_block(&mut meta_index)?;
        let mut index = std::mem::take(&mut self.index);
        let index = self.write_block(&mut index)?;

        let footer = Footer {
            meta_index,
            index,
            entry_count: self.entries,
        }
        .encode();
        self.store.append(self.id, &footer)?;
        self.offset += footer.len() as u64;
        self.store.sync(self.id)?;
        self.store.close(self.id)?;
        self.finished = true;

        log::debug!(
            "Finished table {:?}: {} entries, {} bytes",
            self.id,
            self.entries,
            self.offset
        );
        Ok(BuiltTable {
            number: self.id.number,
            size: self.offset,
            smallest,
            largest,
            entries: self.entries,
            value_files: std::mem::take(&mut self.value_files),
        })
    }

    /// Delete the partial file.
    pub fn abandon(mut self) {
        self.discard();
    }

    fn discard(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Err(err) = self.store.delete(self.id) {
            log::warn!("Failed to delete abandoned table {:?}: {}", self.id, err);
        }
    }
}

impl Drop for TableBuilder {
    fn drop(&mut self) {
        self.discard();
    }
}
