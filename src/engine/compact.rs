//! zonekv - Compaction Execution
//! Runs a picked compaction: merges its inputs, drops shadowed versions and
//! deletion markers, cuts the output into files and installs the result.
//!
//! A compaction that runs out of zone space is undone and, when it had a
//! single file as its level input, that file is split into smaller pieces at
//! the same level so the next attempt needs less free space.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::types::{FileNumber, Key, SequenceNumber, ValueKind, MAX_SEQUENCE};
use crate::zoned::{FileId, ZonedStore};

use super::compaction::Compaction;
use super::iterator::{InternalIterator, MergingIterator};
use super::sstable::{BuiltTable, TableBuilder};
use super::value::ValueDeleter;
use super::version::{FileMetaData, LevelIterator, VersionEdit};
use super::{EngineInner, ManualCompaction};

/// Most pieces a table is split into.
const MAX_SPLIT_PIECES: u64 = 10;

/// Time and bytes spent by background jobs writing one level.
#[derive(Debug, Default, Clone, Copy)]
pub struct CompactionStats {
    pub micros: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl CompactionStats {
    pub fn add(&mut self, other: &CompactionStats) {
        self.micros += other.micros;
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
    }
}

/// Finished tables of a job, deleted again unless the job installs them.
struct PendingTables {
    store: Arc<ZonedStore>,
    tables: Vec<BuiltTable>,
    installed: bool,
}

impl PendingTables {
    fn new(store: Arc<ZonedStore>) -> Self {
        Self {
            store,
            tables: Vec::new(),
            installed: false,
        }
    }

    fn bytes(&self) -> u64 {
        self.tables.iter().map(|t| t.size).sum()
    }

    fn numbers(&self) -> Vec<FileNumber> {
        self.tables.iter().map(|t| t.number).collect()
    }
}

impl Drop for PendingTables {
    fn drop(&mut self) {
        if self.installed {
            return;
        }
        for table in &self.tables {
            if let Err(err) = self.store.delete(FileId::table(table.number)) {
                log::warn!("Discarding output table #{} failed: {}", table.number, err);
            }
        }
    }
}

/// Output of the merge phase of a compaction.
struct MergeOutput {
    tables: PendingTables,
    deleter: ValueDeleter,
}

impl EngineInner {
    fn new_output_number(&self) -> FileNumber {
        let mut state = self.state.lock();
        let number = state.versions.new_file_number();
        state.pending_outputs.insert(number);
        number
    }

    fn release_outputs(&self, numbers: &[FileNumber]) {
        let mut state = self.state.lock();
        for number in numbers {
            state.pending_outputs.remove(number);
        }
    }

    /// Run one manual or picked compaction. A pending immutable MemTable is
    /// flushed instead.
    pub(crate) fn background_compaction(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.imm.is_some() {
            drop(state);
            return self.flush_imm();
        }

        let picked = match state.manual.clone() {
            Some(ManualCompaction { done: true, .. }) => return Ok(()),
            Some(manual) => {
                let picked =
                    state
                        .versions
                        .compact_range(manual.level, manual.begin.as_deref(), manual.end.as_deref());
                if picked.is_none() {
                    if let Some(m) = state.manual.as_mut() {
                        m.done = true;
                    }
                    log::info!("Manual compaction of level {} done", manual.level);
                    self.bg_cv.notify_all();
                }
                picked
            }
            None => state.versions.pick_compaction(),
        };
        let Some(mut c) = picked else {
            return Ok(());
        };

        if !c.manual && c.level > 0 && c.is_trivial_move() {
            let file = Arc::clone(&c.inputs[0][0]);
            c.edit.delete_file(c.level, file.number);
            c.edit.add_file(c.level + 1, FileMetaData::clone(&file));
            if let Err(err) = state.versions.log_and_apply(&mut c.edit) {
                state.versions.revert_compact_pointer(&c);
                return Err(err);
            }
            self.metrics.record_compaction(true);
            log::info!(
                "Moved table #{} to level-{} {} bytes: {}",
                file.number,
                c.level + 1,
                file.size,
                state.versions.current().level_summary()
            );
            return Ok(());
        }

        let smallest_snapshot = self
            .snapshots
            .oldest()
            .unwrap_or_else(|| state.versions.last_sequence());
        log::info!(
            "Compacting {}@{} + {}@{} files",
            c.num_input_files(0),
            c.level,
            c.num_input_files(1),
            c.level + 1
        );
        drop(state);

        let start = Instant::now();
        let merged = self.merge_inputs(&mut c, smallest_snapshot);
        match merged {
            Ok(output) => self.install_compaction(c, output, start),
            Err(err) => {
                {
                    let mut state = self.state.lock();
                    state.versions.revert_compact_pointer(&c);
                    if c.manual && !err.is_no_space() {
                        if let Some(m) = state.manual.as_mut() {
                            m.done = true;
                        }
                    }
                }
                if err.is_no_space() && c.level > 0 && c.num_input_files(0) == 1 {
                    let file = Arc::clone(&c.inputs[0][0]);
                    match self.split_table(c.level, &file) {
                        Ok(()) => {}
                        Err(split_err) if split_err.is_not_attempted() => {
                            log::debug!("Table #{} not split: {}", file.number, split_err)
                        }
                        Err(split_err) => {
                            log::warn!("Splitting table #{} failed: {}", file.number, split_err)
                        }
                    }
                }
                Err(err)
            }
        }
    }

    fn merge_inputs(&self, c: &mut Compaction, smallest_snapshot: SequenceNumber) -> Result<MergeOutput> {
        let config = &self.ctx.config;
        let mut children: Vec<Box<dyn InternalIterator>> = Vec::new();
        for which in 0..2 {
            if c.level + which == 0 {
                for file in &c.inputs[which] {
                    children.push(Box::new(self.ctx.tables.iter(file.number)?));
                }
            } else if !c.inputs[which].is_empty() {
                children.push(Box::new(LevelIterator::new(
                    c.inputs[which].clone(),
                    Arc::clone(&self.ctx.tables),
                )));
            }
        }
        let mut input = MergingIterator::new(children);
        input.seek_to_first()?;

        let mut tables = PendingTables::new(Arc::clone(&self.ctx.store));
        let mut deleter = ValueDeleter::new();
        let mut builder: Option<TableBuilder> = None;
        let mut current_user_key: Option<Key> = None;
        let mut last_sequence_for_key = MAX_SEQUENCE;
        let mut cut_pending = false;

        let result = (|| -> Result<()> {
            while input.valid() {
                if self.shutdown.load(Ordering::Acquire) {
                    return Err(Error::ShuttingDown);
                }
                if self.has_imm.load(Ordering::Acquire) {
                    self.flush_imm()?;
                }
                let key = input.key().clone();
                if c.should_stop_before(&key) {
                    cut_pending = true;
                }

                if current_user_key.as_deref() != Some(key.user_key.as_slice()) {
                    // Outputs end only between user keys, never between two
                    // versions of the same key.
                    if cut_pending {
                        if let Some(done) = builder.take() {
                            tables.tables.push(done.finish()?);
                        }
                        cut_pending = false;
                    }
                    current_user_key = Some(key.user_key.clone());
                    last_sequence_for_key = MAX_SEQUENCE;
                }
                // Shadowed by a newer entry every snapshot can see, or a
                // deletion marker with nothing older left below it.
                let skip = last_sequence_for_key <= smallest_snapshot
                    || (key.kind == ValueKind::Delete
                        && key.sequence <= smallest_snapshot
                        && c.is_base_level_for_key(&key.user_key));
                last_sequence_for_key = key.sequence;

                if skip {
                    if let Some(reference) = input.value().external() {
                        deleter.mark(reference);
                    }
                } else {
                    if builder.is_none() {
                        builder = Some(TableBuilder::create(
                            Arc::clone(&self.ctx.store),
                            self.new_output_number(),
                            config.block_size,
                            config.bloom_bits_per_key,
                        )?);
                    }
                    if let Some(out) = builder.as_mut() {
                        out.add(&key, input.value())?;
                        if out.file_size() >= c.max_output_file_size {
                            cut_pending = true;
                        }
                    }
                }
                input.next()?;
            }
            if let Some(done) = builder.take() {
                tables.tables.push(done.finish()?);
            }
            Ok(())
        })();

        if let Err(err) = result {
            let mut numbers = tables.numbers();
            if let Some(open) = builder.take() {
                numbers.push(open.number());
            }
            drop(tables);
            self.release_outputs(&numbers);
            return Err(err);
        }
        Ok(MergeOutput { tables, deleter })
    }

    fn install_compaction(&self, mut c: Compaction, output: MergeOutput, start: Instant) -> Result<()> {
        let MergeOutput { mut tables, deleter } = output;
        let numbers = tables.numbers();
        let mut state = self.state.lock();

        c.add_input_deletions();
        for table in &tables.tables {
            c.edit.add_file(c.level + 1, FileMetaData::from_built(table));
        }
        let pending: BTreeMap<FileNumber, u64> = deleter.files().map(|n| (n, deleter.pending(n))).collect();
        let values = Arc::clone(&self.ctx.values);
        let obsolete = state
            .versions
            .reclaimable_value_files(&pending, |n| values.is_writable(n));
        let dropped_values: u64 = pending.values().sum();
        deleter.commit_to(&mut c.edit);
        c.edit.obsolete_value_files = obsolete;

        let applied = state.versions.log_and_apply(&mut c.edit);
        for number in &numbers {
            state.pending_outputs.remove(number);
        }
        if let Err(err) = applied {
            state.versions.revert_compact_pointer(&c);
            return Err(err);
        }
        tables.installed = true;

        if c.manual {
            let resume = c.input0_largest().map(|k| k.user_key);
            if let Some(m) = state.manual.as_mut() {
                m.begin = resume;
            }
        }
        let stats = CompactionStats {
            micros: start.elapsed().as_micros() as u64,
            bytes_read: c.input_bytes(),
            bytes_written: tables.bytes(),
        };
        state.level_stats[c.level + 1].add(&stats);
        self.metrics.record_compaction(false);
        log::info!(
            "Compacted {}@{} + {}@{} files => {} bytes in {} file(s), {} value record(s) dropped: {}",
            c.num_input_files(0),
            c.level,
            c.num_input_files(1),
            c.level + 1,
            stats.bytes_written,
            numbers.len(),
            dropped_values,
            state.versions.current().level_summary()
        );
        drop(c);
        self.collect_obsolete_files(&mut state);
        self.bg_cv.notify_all();
        Ok(())
    }

    /// Rewrite table `file` of `level` as up to ten smaller tables covering the
    /// same keys at the same level. All versions of a user key stay together.
    fn split_table(&self, level: usize, file: &Arc<FileMetaData>) -> Result<()> {
        let config = &self.ctx.config;
        let table = self.ctx.tables.table(file.number)?;
        let count = table.entry_count();
        if count < 2 {
            return Err(Error::NotAttempted(format!(
                "table #{} has {} entries",
                file.number, count
            )));
        }
        let pieces = count.min(MAX_SPLIT_PIECES);
        let per_piece = count / pieces;
        let mut iter = table.iter();
        iter.seek_to_first()?;

        let mut tables = PendingTables::new(Arc::clone(&self.ctx.store));
        let mut numbers = Vec::new();
        let written = (|| -> Result<()> {
            for piece in 0..pieces {
                if !iter.valid() {
                    break;
                }
                let number = self.new_output_number();
                numbers.push(number);
                let mut builder = TableBuilder::create(
                    Arc::clone(&self.ctx.store),
                    number,
                    config.block_size,
                    config.bloom_bits_per_key,
                )?;
                let last = piece + 1 == pieces;
                let mut added = 0;
                let mut previous: Option<Key> = None;
                while iter.valid() {
                    let same_key = previous.as_deref() == Some(iter.key().user_key.as_slice());
                    if !last && added >= per_piece && !same_key {
                        break;
                    }
                    previous = Some(iter.key().user_key.clone());
                    builder.add(iter.key(), iter.value())?;
                    iter.next()?;
                    added += 1;
                }
                tables.tables.push(builder.finish()?);
            }
            Ok(())
        })();

        let mut state = self.state.lock();
        let applied = written.and_then(|()| {
            if tables.tables.len() < 2 {
                return Err(Error::NotAttempted(format!(
                    "table #{} holds a single key",
                    file.number
                )));
            }
            let mut edit = VersionEdit::new();
            edit.delete_file(level, file.number);
            for piece in &tables.tables {
                edit.add_file(level, FileMetaData::from_built(piece));
            }
            state.versions.log_and_apply(&mut edit)
        });
        for number in &numbers {
            state.pending_outputs.remove(number);
        }
        applied?;
        tables.installed = true;
        self.metrics.record_split();
        log::info!(
            "Split table #{} at level {} into {} tables: {}",
            file.number,
            level,
            tables.tables.len(),
            state.versions.current().level_summary()
        );
        self.collect_obsolete_files(&mut state);
        Ok(())
    }
}
