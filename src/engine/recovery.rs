//! zonekv - Crash Recovery
//! Replays the write-ahead logs not yet covered by sorted files into a
//! MemTable and persists the result before the engine accepts writes.
//!
//! Replay is idempotent: a log that was already flushed before a crash yields
//! the same keys with the same sequence numbers again.

use std::sync::Arc;

use crate::error::Result;
use crate::types::{FileNumber, SequenceNumber};
use crate::zoned::{FileId, FileKind, ZonedStore};

use super::batch::WriteBatch;
use super::flush::write_level0_table;
use super::memtable::MemTable;
use super::metrics::EngineMetrics;
use super::version::{VersionEdit, VersionSet};
use super::wal::{LogReader, LogWriter};
use super::EngineContext;

/// State the engine starts from after recovery.
pub(crate) struct Recovered {
    /// Active WAL for new writes.
    pub log: LogWriter,
    pub log_number: FileNumber,
    /// Replayed writes that could not be flushed for lack of space.
    pub mem: Arc<MemTable>,
    pub logs_replayed: usize,
}

/// Apply every batch of log `number` to `mem`. Returns the highest sequence
/// number seen, if any record was replayed.
pub(crate) fn replay_log(
    store: &ZonedStore,
    number: FileNumber,
    mem: &MemTable,
    strict: bool,
) -> Result<Option<SequenceNumber>> {
    let mut reader = LogReader::open(store, FileId::log(number), strict)?;
    let mut max_sequence = None;
    let mut batches = 0usize;
    while let Some(record) = reader.read_record()? {
        let batch = match WriteBatch::decode(&record) {
            Ok(batch) => batch,
            Err(err) if !strict => {
                log::warn!("Skipping undecodable record in log {}: {}", number, err);
                continue;
            }
            Err(err) => return Err(err),
        };
        if batch.is_empty() {
            continue;
        }
        mem.apply(&batch);
        let last = batch.sequence() + batch.len() as u64 - 1;
        max_sequence = max_sequence.max(Some(last));
        batches += 1;
    }
    if reader.dropped_bytes() > 0 {
        log::warn!(
            "Log {}: dropped {} bytes of torn or corrupt records",
            number,
            reader.dropped_bytes()
        );
    }
    log::info!("Replayed log {}: {} batch(es)", number, batches);
    Ok(max_sequence)
}

fn flush_recovered(
    ctx: &EngineContext,
    versions: &VersionSet,
    mem: &Arc<MemTable>,
    edit: &mut VersionEdit,
) -> Result<()> {
    let number = versions.new_file_number();
    if let Some(output) = write_level0_table(ctx, mem, number)? {
        log::info!(
            "Recovered {} entries into level-0 table #{}",
            mem.len(),
            number
        );
        output.record_in(edit);
    }
    Ok(())
}

/// Replay the logs at or above the catalog's log number, flush what they
/// hold and open a fresh log.
pub(crate) fn recover(
    ctx: &EngineContext,
    versions: &mut VersionSet,
    metrics: &EngineMetrics,
) -> Result<Recovered> {
    let config = &ctx.config;
    let min_log = versions.log_number();
    let mut logs: Vec<FileNumber> = ctx
        .store
        .list_files(FileKind::Log)
        .into_iter()
        .filter(|n| *n >= min_log)
        .collect();
    logs.sort_unstable();

    let mut edit = VersionEdit::new();
    let mut max_sequence = versions.last_sequence();
    let mut mem = Arc::new(MemTable::new(config.value_threshold));
    for number in &logs {
        if let Some(last) = replay_log(&ctx.store, *number, &mem, config.paranoid_checks)? {
            max_sequence = max_sequence.max(last);
        }
        metrics.record_recovery();
        if mem.size() > config.write_buffer_size {
            flush_recovered(ctx, versions, &mem, &mut edit)?;
            mem = Arc::new(MemTable::new(config.value_threshold));
        }
    }

    // Writes that cannot be flushed stay in the MemTable and their logs stay
    // live until the next flush.
    let mut logs_covered = true;
    if !mem.is_empty() {
        match flush_recovered(ctx, versions, &mem, &mut edit) {
            Ok(()) => mem = Arc::new(MemTable::new(config.value_threshold)),
            Err(err) if err.is_no_space() => {
                log::warn!("Keeping recovered writes in memory: {}", err);
                logs_covered = false;
            }
            Err(err) => return Err(err),
        }
    }

    let log_number = ctx.numbers.next();
    let log = LogWriter::create(Arc::clone(&ctx.store), FileId::log(log_number))?;
    if logs_covered {
        edit.log_number = Some(log_number);
    }
    edit.last_sequence = Some(max_sequence);
    versions.log_and_apply(&mut edit)?;
    Ok(Recovered {
        log,
        log_number,
        mem,
        logs_replayed: logs.len(),
    })
}
