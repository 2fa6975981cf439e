//! Value builder: moves large values out of a flushing memtable into value files.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::engine::version::FileNumbers;
use crate::error::Result;
use crate::types::{FileNumber, ValueReference};

use super::cache::{ValueFileCache, WritableValueFile};
use super::section::{SectionIndex, SECTION_FOOTER_SIZE};

/// Per-entry overhead of the key index, beyond the key itself.
const INDEX_ENTRY_OVERHEAD: usize = 8 + ValueReference::ENCODED_LEN;

struct OpenSection {
    file: WritableValueFile,
    prev_end: u64,
    index: SectionIndex,
}

/// Appends values to a cached value file writer and records a section index.
///
/// A section is closed when its index outgrows `section_limit`; the file is
/// rotated when its zone could not take the next value plus the section's
/// index and footer. A builder dropped without `finish` retires its writer, so
/// orphaned value bytes are never followed by another section.
pub struct ValueBuilder {
    cache: Arc<ValueFileCache>,
    numbers: Arc<FileNumbers>,
    section_limit: usize,
    rotation_reserve: u64,
    open: Option<OpenSection>,
    /// Records in closed sections, per value file.
    records: BTreeMap<FileNumber, u64>,
    done: bool,
}

impl ValueBuilder {
    pub fn new(
        cache: Arc<ValueFileCache>,
        numbers: Arc<FileNumbers>,
        section_limit: usize,
        rotation_reserve: u64,
    ) -> Self {
        Self {
            cache,
            numbers,
            section_limit,
            rotation_reserve,
            open: None,
            records: BTreeMap::new(),
            done: false,
        }
    }

    fn open_file(&mut self) -> Result<&mut OpenSection> {
        let open = match self.open.take() {
            Some(open) => open,
            None => {
                let file = self.cache.get_writable(self.numbers.next())?;
                let prev_end = file.size()?;
                OpenSection {
                    file,
                    prev_end,
                    index: SectionIndex::default(),
                }
            }
        };
        Ok(self.open.insert(open))
    }

    /// Write the index and footer of the open section.
    fn close_section(&mut self) -> Result<()> {
        let Some(open) = self.open.as_mut() else {
            return Ok(());
        };
        if open.index.is_empty() {
            return Ok(());
        }
        let count = open.index.len();
        let index_offset = open.file.size()?;
        let trailer = open.index.finish(open.prev_end, index_offset);
        open.file.append(&trailer)?;
        open.prev_end = index_offset + trailer.len() as u64;
        *self.records.entry(open.file.number()).or_default() += count;
        log::debug!(
            "Closed section of value file {}: {} values, {} bytes left in zone",
            open.file.number(),
            count,
            open.file.space_left().unwrap_or(0)
        );
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        self.close_section()?;
        if let Some(open) = self.open.take() {
            open.file.sync()?;
            log::debug!("Rotating away from full value file {}", open.file.number());
            open.file.retire();
        }
        self.open_file()?;
        Ok(())
    }

    /// Append `value` for `key` and return where it was stored.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<ValueReference> {
        let section_limit = self.section_limit;
        let rotation_reserve = self.rotation_reserve;
        if self.open_file()?.index.size_estimate() > section_limit {
            self.close_section()?;
        }
        let open = self.open_file()?;
        let space_left = open.file.space_left()?;
        if space_left < rotation_reserve {
            let required = open.index.size_estimate()
                + key.len()
                + INDEX_ENTRY_OVERHEAD
                + SECTION_FOOTER_SIZE
                + value.len();
            if space_left < required as u64 {
                self.rotate()?;
            }
        }
        let open = self.open_file()?;
        let offset = open.file.append(value)?;
        let reference = ValueReference {
            file_number: open.file.number(),
            offset,
            length: value.len() as u32,
        };
        open.index.add(key, &reference);
        Ok(reference)
    }

    /// Close the open section and sync. Returns the number of values written
    /// to each value file.
    pub fn finish(mut self) -> Result<BTreeMap<FileNumber, u64>> {
        self.close_section()?;
        if let Some(open) = self.open.take() {
            open.file.sync()?;
        }
        self.done = true;
        Ok(std::mem::take(&mut self.records))
    }
}

impl Drop for ValueBuilder {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Some(open) = self.open.take() {
            log::warn!(
                "Abandoning value builder, retiring value file {}",
                open.file.number()
            );
            open.file.retire();
        }
    }
}
