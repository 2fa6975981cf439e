//! zonekv - MemTable Flush
//! Writes a frozen MemTable as one level-0 sorted file. Values at or above the
//! value threshold are appended to value files first and the table stores a
//! reference to them.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::types::{FileNumber, ValueKind, ValueRecord};
use crate::zoned::FileId;

use super::memtable::MemTable;
use super::sstable::TableBuilder;
use super::value::ValueBuilder;
use super::version::{FileMetaData, VersionEdit};
use super::{EngineContext, EngineInner};

/// Level-0 file produced by a flush, with the value records it appended.
pub(crate) struct FlushOutput {
    pub file: FileMetaData,
    pub value_records: BTreeMap<FileNumber, u64>,
}

impl FlushOutput {
    /// Add the file and its value records to `edit`.
    pub fn record_in(&self, edit: &mut VersionEdit) {
        edit.add_file(0, self.file.clone());
        edit.value_records_added
            .extend(self.value_records.iter().map(|(n, c)| (*n, *c)));
    }
}

/// Write `mem` to table `number`. Returns `None` for an empty MemTable.
pub(crate) fn write_level0_table(
    ctx: &EngineContext,
    mem: &Arc<MemTable>,
    number: FileNumber,
) -> Result<Option<FlushOutput>> {
    if mem.is_empty() {
        return Ok(None);
    }
    let config = &ctx.config;
    let mut table = TableBuilder::create(
        Arc::clone(&ctx.store),
        number,
        config.block_size,
        config.bloom_bits_per_key,
    )?;
    let mut values = ValueBuilder::new(
        Arc::clone(&ctx.values),
        Arc::clone(&ctx.numbers),
        config.value_section_index_limit,
        config.value_rotation_reserve,
    );
    for (key, record) in mem.entries() {
        let record = match record {
            ValueRecord::Inline(value)
                if key.kind == ValueKind::Put && value.len() >= config.value_threshold =>
            {
                ValueRecord::External(values.add(&key.user_key, &value)?)
            }
            other => other,
        };
        table.add(&key, &record)?;
    }
    // The value section is closed only after the table is complete, so a
    // failed table leaves no section behind. Neither is referenced by a
    // version until the edit is applied.
    let built = table.finish()?;
    let value_records = match values.finish() {
        Ok(records) => records,
        Err(err) => {
            if let Err(delete_err) = ctx.store.delete(FileId::table(built.number)) {
                log::warn!("Failed to delete table #{}: {}", built.number, delete_err);
            }
            return Err(err);
        }
    };
    Ok(Some(FlushOutput {
        file: FileMetaData::from_built(&built),
        value_records,
    }))
}

impl EngineInner {
    /// Flush the immutable MemTable, if any, and install it at level 0.
    pub(crate) fn flush_imm(&self) -> Result<()> {
        let (imm, number) = {
            let mut state = self.state.lock();
            let Some(imm) = state.imm.clone() else {
                return Ok(());
            };
            if !self.ctx.store.has_space_for(imm.table_size() as u64) {
                return Err(Error::NoSpaceAvailable(format!(
                    "no room for a {} byte level-0 table",
                    imm.table_size()
                )));
            }
            let number = state.versions.new_file_number();
            state.pending_outputs.insert(number);
            (imm, number)
        };

        let start = Instant::now();
        let output = write_level0_table(&self.ctx, &imm, number);
        let mut state = self.state.lock();
        state.pending_outputs.remove(&number);
        let output = output?;

        let mut edit = VersionEdit::new();
        if let Some(output) = &output {
            output.record_in(&mut edit);
        }
        edit.log_number = Some(state.log_number);
        state.versions.log_and_apply(&mut edit)?;

        let summary = state.versions.current().level_summary();
        let stats = &mut state.level_stats[0];
        stats.micros += start.elapsed().as_micros() as u64;
        if let Some(output) = &output {
            stats.bytes_written += output.file.size;
            log::info!(
                "Level-0 table #{}: {} entries, {} bytes, {} value file(s); {}",
                number,
                imm.len(),
                output.file.size,
                output.value_records.len(),
                summary
            );
        }
        state.imm = None;
        self.has_imm.store(false, Ordering::Release);
        self.metrics.record_flush();
        self.collect_obsolete_files(&mut state);
        self.bg_cv.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::sstable::TableCache;
    use crate::engine::value::ValueFileCache;
    use crate::engine::version::FileNumbers;
    use crate::types::{InternalKey, ValueKind};
    use crate::engine::value::section::read_footers;
    use crate::zoned::{FileKind, MemoryZonedDevice, ZonedStore};

    fn context() -> EngineContext {
        context_on(MemoryZonedDevice::new(1 << 20, 16))
    }

    fn context_on(device: MemoryZonedDevice) -> EngineContext {
        let store = Arc::new(ZonedStore::open(Arc::new(device)).unwrap());
        EngineContext {
            config: Config::small("unused").with_value_threshold(100),
            values: Arc::new(ValueFileCache::new(Arc::clone(&store))),
            tables: Arc::new(TableCache::new(Arc::clone(&store), 8)),
            numbers: Arc::new(FileNumbers::new(10)),
            store,
        }
    }

    #[test]
    fn test_large_values_move_to_value_files() {
        let ctx = context();
        let mem = Arc::new(MemTable::new(100));
        mem.insert(InternalKey::new(b"big".to_vec(), 1, ValueKind::Put), ValueRecord::Inline(vec![7; 500]));
        mem.insert(InternalKey::new(b"small".to_vec(), 2, ValueKind::Put), ValueRecord::Inline(b"v".to_vec()));
        mem.insert(InternalKey::new(b"gone".to_vec(), 3, ValueKind::Delete), ValueRecord::empty());

        let number = ctx.numbers.next();
        let output = write_level0_table(&ctx, &mem, number).unwrap().unwrap();
        assert_eq!(output.value_records.values().sum::<u64>(), 1);
        assert_eq!(output.file.value_files.len(), 1);

        let lookup = InternalKey::lookup(b"big", 10);
        let (_, record) = ctx.tables.get(number, &lookup).unwrap().unwrap();
        let reference = *record.external().unwrap();
        assert_eq!(ctx.values.resolve(&ValueRecord::External(reference)).unwrap(), vec![7; 500]);

        let lookup = InternalKey::lookup(b"small", 10);
        let (_, record) = ctx.tables.get(number, &lookup).unwrap().unwrap();
        assert_eq!(record, ValueRecord::Inline(b"v".to_vec()));
    }

    #[test]
    fn test_empty_memtable_writes_nothing() {
        let ctx = context();
        let mem = Arc::new(MemTable::new(100));
        let number = ctx.numbers.next();
        assert!(write_level0_table(&ctx, &mem, number).unwrap().is_none());
        assert!(ctx.store.list_files(FileKind::Table).is_empty());
    }

    #[test]
    fn test_failed_table_leaves_no_value_section() {
        let device = MemoryZonedDevice::new(1 << 20, 16);
        let ctx = context_on(device.clone());
        let mem = Arc::new(MemTable::new(100));
        mem.insert(InternalKey::new(b"big".to_vec(), 1, ValueKind::Put), ValueRecord::Inline(vec![7; 500]));
        mem.insert(InternalKey::new(b"small".to_vec(), 2, ValueKind::Put), ValueRecord::Inline(b"v".to_vec()));

        // Zone 3 takes the value file, the table would get zone 4.
        device.fail_zone(4, true);
        let number = ctx.numbers.next();
        assert!(write_level0_table(&ctx, &mem, number).is_err());

        assert!(ctx.store.list_files(FileKind::Table).is_empty());
        let value_files = ctx.store.list_files(FileKind::Value);
        assert_eq!(value_files.len(), 1);
        let footers = read_footers(&ctx.store, FileId::value(value_files[0])).unwrap();
        assert!(footers.is_empty());
        assert!(!ctx.values.is_writable(value_files[0]));
    }
}
