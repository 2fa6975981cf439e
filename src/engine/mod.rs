//! zonekv - Storage Engine Module
//! Top-level module for the LSM-Tree storage engine components.
//!
//! ## Write Path
//! Writer queue (group commit) -> WAL append -> MemTable insert. A full
//! MemTable is frozen and flushed to one level-0 file by the compaction
//! worker; large values go to value files on the way.
//!
//! ## Locking
//! - `state`: catalog, MemTable switch, background bookkeeping
//! - `writers`: leader election of the writer queue only
//! - `log`: the active WAL, used by the write leader
//!
//! Readers pin the MemTables and the current `Version` under `state` and then
//! read without any lock.

pub mod batch;
pub mod compaction;
pub mod iterator;
pub mod memtable;
pub mod metrics;
pub mod scheduler;
pub mod snapshot;
pub mod sstable;
pub mod value;
pub mod version;
pub mod wal;

mod background;
mod compact;
mod flush;
mod reclaim;
mod recovery;
mod write;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::types::{FileNumber, InternalKey, Key, SequenceNumber, Value, ValueRecord};
use crate::zoned::{FileZonedDevice, ZonedDevice, ZonedStore};

use self::background::{Dispatcher, Workers};
use self::batch::WriteBatch;
use self::compact::CompactionStats;
use self::iterator::{DbIterator, InternalIterator, MergingIterator};
use self::memtable::{MemLookup, MemTable, MemTableIterator};
use self::metrics::EngineMetrics;
use self::scheduler::SchedulerState;
use self::snapshot::{Snapshot, SnapshotList};
use self::sstable::TableCache;
use self::value::ValueFileCache;
use self::version::{FileNumbers, ValueFileStats, Version, VersionLookup, VersionSet, NUM_LEVELS};
use self::wal::LogWriter;
use self::write::{WriteQueue, WriteRequest};

/// Parsed tables kept open at once.
const TABLE_CACHE_CAPACITY: usize = 64;

/// Shared handles every component works through. Built once at open.
#[derive(Clone)]
pub(crate) struct EngineContext {
    pub config: Config,
    pub store: Arc<ZonedStore>,
    pub values: Arc<ValueFileCache>,
    pub tables: Arc<TableCache>,
    pub numbers: Arc<FileNumbers>,
}

/// A manual compaction request of one level.
#[derive(Debug, Clone)]
pub(crate) struct ManualCompaction {
    pub level: usize,
    pub begin: Option<Key>,
    pub end: Option<Key>,
    pub done: bool,
}

/// Everything guarded by the main lock.
pub(crate) struct EngineState {
    pub mem: Arc<MemTable>,
    pub imm: Option<Arc<MemTable>>,
    /// Number of the WAL backing `mem`.
    pub log_number: FileNumber,
    pub versions: VersionSet,
    pub bg_error: Option<Error>,
    pub manual: Option<ManualCompaction>,
    pub scheduler: SchedulerState,
    /// Files being written by a background job and not yet in any version.
    pub pending_outputs: BTreeSet<FileNumber>,
    /// Value files already emptied by the value mover.
    pub moved_value_files: BTreeSet<FileNumber>,
    pub level_stats: Vec<CompactionStats>,
}

pub(crate) struct EngineInner {
    pub ctx: EngineContext,
    pub state: Mutex<EngineState>,
    /// Signalled whenever a background job ends or the catalog changes.
    pub bg_cv: Condvar,
    pub writers: Mutex<WriteQueue>,
    pub writers_cv: Condvar,
    pub log: Mutex<LogWriter>,
    pub snapshots: Arc<SnapshotList>,
    pub metrics: EngineMetrics,
    pub shutdown: AtomicBool,
    pub has_imm: AtomicBool,
    pub last_write: Mutex<Instant>,
    pub dispatch: Dispatcher,
}

/// MemTables and version pinned for one read.
pub(crate) struct ReadView {
    pub mem: Arc<MemTable>,
    pub imm: Option<Arc<MemTable>>,
    pub version: Arc<Version>,
}

impl EngineInner {
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Pin the current read state and return it with the last sequence.
    pub(crate) fn read_view(&self) -> (ReadView, SequenceNumber) {
        let state = self.state.lock();
        let view = ReadView {
            mem: Arc::clone(&state.mem),
            imm: state.imm.clone(),
            version: state.versions.current(),
        };
        (view, state.versions.last_sequence())
    }

    /// Newest record of `key` visible at `sequence`, without resolving
    /// external values.
    pub(crate) fn lookup(
        &self,
        view: &ReadView,
        key: &[u8],
        sequence: SequenceNumber,
    ) -> Result<Option<ValueRecord>> {
        let memtables = std::iter::once(&view.mem).chain(view.imm.iter());
        for table in memtables {
            match table.get(key, sequence) {
                Some(MemLookup::Found(record)) => return Ok(Some(record)),
                Some(MemLookup::Deleted) => return Ok(None),
                None => {}
            }
        }
        let lookup = InternalKey::lookup(key, sequence);
        let (found, charge) = view.version.get(&lookup, &self.ctx.tables)?;
        if let Some(charge) = charge {
            if view.version.update_stats(&charge) {
                let mut state = self.state.lock();
                self.maybe_schedule(&mut state);
            }
        }
        Ok(match found {
            VersionLookup::Found(record) => Some(record),
            VersionLookup::Deleted | VersionLookup::Missing => None,
        })
    }

    fn get(&self, key: &[u8], snapshot: Option<SequenceNumber>) -> Result<Option<Value>> {
        let (view, last) = self.read_view();
        let sequence = snapshot.unwrap_or(last);
        let value = match self.lookup(&view, key, sequence)? {
            Some(record) => Some(self.ctx.values.resolve(&record)?),
            None => None,
        };
        self.metrics.record_get(value.as_ref().map(|v| v.len()));
        Ok(value)
    }

    fn new_iterator(&self, snapshot: Option<SequenceNumber>) -> Result<DbIterator> {
        let (view, last) = self.read_view();
        let sequence = snapshot.unwrap_or(last);
        let mut children: Vec<Box<dyn InternalIterator>> =
            vec![Box::new(MemTableIterator::new(Arc::clone(&view.mem)))];
        if let Some(imm) = &view.imm {
            children.push(Box::new(MemTableIterator::new(Arc::clone(imm))));
        }
        children.extend(view.version.iterators(&self.ctx.tables)?);
        let version: Arc<dyn Send + Sync> = view.version;
        let mut iter = DbIterator::new(
            MergingIterator::new(children),
            sequence,
            Arc::clone(&self.ctx.values),
            vec![version],
        );
        iter.seek_to_first()?;
        self.metrics.record_scan();
        Ok(iter)
    }

    /// Wait until no immutable MemTable is pending.
    fn wait_for_imm(&self) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            if state.imm.is_none() {
                return Ok(());
            }
            if self.is_shutting_down() {
                return Err(Error::ShuttingDown);
            }
            if let Some(err) = &state.bg_error {
                if err.halts_background() || err.is_no_space() {
                    return Err(err.clone());
                }
            }
            self.maybe_schedule(&mut state);
            self.bg_cv
                .wait_for(&mut state, self.ctx.config.background_tick);
        }
    }

    /// Flush every MemTable to level 0.
    fn drain_memtables(&self) -> Result<()> {
        self.wait_for_imm()?;
        let has_data = !self.state.lock().mem.is_empty();
        if has_data {
            self.write_request(WriteRequest::SwitchMemtable, false)?;
            self.wait_for_imm()?;
        }
        Ok(())
    }

    fn sync_wal(&self) -> Result<()> {
        self.log.lock().sync()
    }

    /// Compact `[begin, end]` of every level that holds it, one level at a time.
    fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        self.drain_memtables()?;
        let levels = self.state.lock().versions.levels_overlapping(begin, end);
        for level in levels {
            self.run_manual_compaction(level, begin, end)?;
        }
        Ok(())
    }

    fn run_manual_compaction(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        while state.manual.is_some() {
            self.bg_cv
                .wait_for(&mut state, self.ctx.config.background_tick);
        }
        state.manual = Some(ManualCompaction {
            level,
            begin: begin.map(|b| b.to_vec()),
            end: end.map(|e| e.to_vec()),
            done: false,
        });
        log::info!("Manual compaction of level {} requested", level);
        loop {
            if state.manual.as_ref().map_or(true, |m| m.done) {
                state.manual = None;
                break;
            }
            if self.is_shutting_down() {
                state.manual = None;
                return Err(Error::ShuttingDown);
            }
            if let Some(err) = &state.bg_error {
                if err.halts_background() || err.is_no_space() {
                    let err = err.clone();
                    state.manual = None;
                    return Err(err);
                }
            }
            self.maybe_schedule(&mut state);
            self.bg_cv
                .wait_for(&mut state, self.ctx.config.background_tick);
        }
        Ok(())
    }

    fn property(&self, name: &str) -> Option<String> {
        let name = name.strip_prefix("zonekv.")?;
        if let Some(level) = name.strip_prefix("num-files-at-level") {
            let level: usize = level.parse().ok()?;
            if level >= NUM_LEVELS {
                return None;
            }
            return Some(self.state.lock().versions.num_level_files(level).to_string());
        }
        match name {
            "stats" => Some(self.stats_report()),
            "sstables" => Some(self.state.lock().versions.describe_tables()),
            "value-files" => Some(self.value_files_report()),
            "zones" => Some(self.ctx.store.describe_zones()),
            "metrics" => Some(self.metrics.report()),
            _ => None,
        }
    }

    fn stats_report(&self) -> String {
        let state = self.state.lock();
        let version = state.versions.current();
        let mut out = String::from(
            "                               Compactions\n\
             Level  Files Size(MB) Time(sec) Read(MB) Write(MB)\n\
             --------------------------------------------------\n",
        );
        const MB: f64 = 1048576.0;
        for level in 0..NUM_LEVELS {
            let stats = &state.level_stats[level];
            let files = version.num_files(level);
            if files == 0 && stats.micros == 0 {
                continue;
            }
            out.push_str(&format!(
                "{:>3} {:>8} {:>8.0} {:>9.0} {:>8.0} {:>9.0}\n",
                level,
                files,
                version.level_bytes(level) as f64 / MB,
                stats.micros as f64 / 1e6,
                stats.bytes_read as f64 / MB,
                stats.bytes_written as f64 / MB
            ));
        }
        out.push_str(&format!("{}\n", version.level_summary()));
        out
    }

    fn value_files_report(&self) -> String {
        let state = self.state.lock();
        let mut out = String::new();
        for (number, stats) in state.versions.value_file_stats() {
            out.push_str(&format!(
                "value file {:>6}: total {:>8} deleted {:>8} live {:>5.1}%{}{}\n",
                number,
                stats.total,
                stats.deleted,
                stats.live_ratio() * 100.0,
                if self.ctx.values.is_writable(*number) { " (open)" } else { "" },
                if state.moved_value_files.contains(number) { " (moved)" } else { "" }
            ));
        }
        out
    }
}

/// An embedded key-value store over a zoned device.
///
/// Cloning is not supported; share it behind an `Arc`. Every method takes
/// `&self` and may be called from many threads.
pub struct ZoneKv {
    inner: Arc<EngineInner>,
    workers: Option<Workers>,
}

impl ZoneKv {
    /// Open or create a store on a file-backed zoned device under `config.data_dir`.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let device = FileZonedDevice::open(
            &config.data_dir,
            config.zone_size,
            config.zone_count,
            config.create_if_missing,
        )?;
        Self::open_with_device(config, Arc::new(device))
    }

    /// Open or create a store on `device`.
    pub fn open_with_device(config: Config, device: Arc<dyn ZonedDevice>) -> Result<Self> {
        config.validate()?;
        config.validate_zone_size(device.zone_size())?;
        let store = Arc::new(ZonedStore::open(device)?);
        let ctx = EngineContext {
            values: Arc::new(ValueFileCache::new(Arc::clone(&store))),
            tables: Arc::new(TableCache::new(Arc::clone(&store), TABLE_CACHE_CAPACITY)),
            numbers: Arc::new(FileNumbers::new(1)),
            store,
            config,
        };
        let metrics = EngineMetrics::new();
        let mut versions = VersionSet::new(
            Arc::clone(&ctx.store),
            Arc::clone(&ctx.tables),
            Arc::clone(&ctx.numbers),
            &ctx.config,
        );
        let existed = versions.recover()?;
        let recovered = recovery::recover(&ctx, &mut versions, &metrics)?;
        log::info!(
            "zonekv {} ({} log(s) replayed, last sequence {}): {}",
            if existed { "reopened" } else { "created" },
            recovered.logs_replayed,
            versions.last_sequence(),
            versions.current().level_summary()
        );

        let (dispatch, compaction_rx, values_rx) = Dispatcher::channels();
        let state = EngineState {
            mem: recovered.mem,
            imm: None,
            log_number: recovered.log_number,
            versions,
            bg_error: None,
            manual: None,
            scheduler: SchedulerState::default(),
            pending_outputs: BTreeSet::new(),
            moved_value_files: BTreeSet::new(),
            level_stats: vec![CompactionStats::default(); NUM_LEVELS],
        };
        let inner = Arc::new(EngineInner {
            ctx,
            state: Mutex::new(state),
            bg_cv: Condvar::new(),
            writers: Mutex::new(WriteQueue::default()),
            writers_cv: Condvar::new(),
            log: Mutex::new(recovered.log),
            snapshots: Arc::new(SnapshotList::new()),
            metrics,
            shutdown: AtomicBool::new(false),
            has_imm: AtomicBool::new(false),
            last_write: Mutex::new(Instant::now()),
            dispatch,
        });
        {
            let mut state = inner.state.lock();
            inner.collect_obsolete_files(&mut state);
        }
        let workers = Workers::spawn(&inner, compaction_rx, values_rx)?;
        {
            let mut state = inner.state.lock();
            inner.maybe_schedule(&mut state);
        }
        Ok(Self {
            inner,
            workers: Some(workers),
        })
    }

    fn check_entry(&self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("empty key".into()));
        }
        if key.len() > self.inner.ctx.config.max_key_size {
            return Err(Error::InvalidArgument(format!(
                "key of {} bytes exceeds the {} byte limit",
                key.len(),
                self.inner.ctx.config.max_key_size
            )));
        }
        let max = self.inner.ctx.config.max_value_size;
        if let Some(value) = value {
            if value.len() > max {
                return Err(Error::InvalidArgument(format!(
                    "value of {} bytes exceeds the {} byte limit",
                    value.len(),
                    max
                )));
            }
        }
        Ok(())
    }

    /// Insert a key-value pair. With `durable` the WAL is synced before returning.
    pub fn put(&self, key: impl Into<Key>, value: impl Into<Value>, durable: bool) -> Result<()> {
        let key = key.into();
        let value = value.into();
        self.check_entry(&key, Some(&value))?;
        self.inner.metrics.record_put(key.len(), value.len());
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.apply(batch, durable)
    }

    /// Delete a key by writing a tombstone.
    pub fn delete(&self, key: impl Into<Key>, durable: bool) -> Result<()> {
        let key = key.into();
        self.check_entry(&key, None)?;
        self.inner.metrics.record_delete(key.len());
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.apply(batch, durable)
    }

    /// `put` with the configured default durability.
    pub fn insert(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<()> {
        self.put(key, value, self.inner.ctx.config.sync_writes)
    }

    /// `delete` with the configured default durability.
    pub fn remove(&self, key: impl Into<Key>) -> Result<()> {
        self.delete(key, self.inner.ctx.config.sync_writes)
    }

    /// Apply every entry of `batch` atomically.
    pub fn write(&self, batch: WriteBatch, durable: bool) -> Result<()> {
        for entry in batch.entries() {
            let value = match &entry.value {
                ValueRecord::Inline(value) => Some(value.as_slice()),
                ValueRecord::External(_) => {
                    return Err(Error::InvalidArgument(
                        "batches carry inline values only".into(),
                    ))
                }
            };
            self.check_entry(&entry.key, value)?;
        }
        self.apply(batch, durable)
    }

    fn apply(&self, batch: WriteBatch, durable: bool) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        *self.inner.last_write.lock() = Instant::now();
        self.inner
            .write_request(WriteRequest::Batch(batch), durable)
            .map(|_| ())
    }

    /// Newest value of `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        self.inner.get(key, None)
    }

    /// Value of `key` as of `snapshot`.
    pub fn get_at(&self, key: &[u8], snapshot: &Snapshot) -> Result<Option<Value>> {
        self.inner.get(key, Some(snapshot.sequence()))
    }

    /// Pin the current state for repeatable reads.
    pub fn snapshot(&self) -> Snapshot {
        let sequence = self.inner.state.lock().versions.last_sequence();
        self.inner.snapshots.acquire(sequence)
    }

    /// Iterator over live keys in order, positioned at the first key.
    pub fn new_iterator(&self, snapshot: Option<&Snapshot>) -> Result<DbIterator> {
        self.inner.new_iterator(snapshot.map(Snapshot::sequence))
    }

    /// Every live key-value pair in order.
    pub fn scan(&self) -> Result<Vec<(Key, Value)>> {
        self.new_iterator(None)?.collect()
    }

    /// Make buffered writes durable.
    ///
    /// `to_durable_files` or `drain_memtables` writes every MemTable to sorted
    /// files; otherwise only the WAL is synced. `closing` stops background
    /// work afterwards and refuses further writes.
    pub fn flush(&self, to_durable_files: bool, drain_memtables: bool, closing: bool) -> Result<()> {
        let result = if to_durable_files || drain_memtables {
            self.inner.drain_memtables()
        } else {
            self.inner.sync_wal()
        };
        if closing {
            log::info!("Closing: background work stops");
            self.inner.shutdown.store(true, Ordering::Release);
            self.inner.bg_cv.notify_all();
        }
        result
    }

    /// Compact every level overlapping `[begin, end]`; `None` is unbounded.
    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        self.inner.compact_range(begin, end)
    }

    /// Compact the whole key space.
    pub fn compact(&self) -> Result<()> {
        self.compact_range(None, None)
    }

    /// Diagnostic properties: `zonekv.num-files-at-level<N>`, `zonekv.stats`,
    /// `zonekv.sstables`, `zonekv.value-files`, `zonekv.zones`, `zonekv.metrics`.
    pub fn get_property(&self, name: &str) -> Option<String> {
        self.inner.property(name)
    }

    /// Record counts of every cataloged value file.
    pub fn value_file_stats(&self) -> BTreeMap<FileNumber, ValueFileStats> {
        self.inner.state.lock().versions.value_file_stats().clone()
    }

    pub fn background_error(&self) -> Option<Error> {
        self.inner.state.lock().bg_error.clone()
    }

    /// Forget the recorded background error and resume scheduling.
    pub fn clear_background_error(&self) {
        let mut state = self.inner.state.lock();
        if let Some(err) = state.bg_error.take() {
            log::info!("Cleared background error: {}", err);
        }
        self.inner.maybe_schedule(&mut state);
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.inner.metrics
    }

    /// Stop background work and sync the WAL.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(workers) = self.workers.take() else {
            return Ok(());
        };
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.bg_cv.notify_all();
        self.inner.writers_cv.notify_all();
        workers.stop(&self.inner.dispatch);
        let result = self.inner.sync_wal();
        self.inner.ctx.values.close_all();
        if let Err(err) = self.inner.ctx.store.close_zones() {
            log::warn!("Closing zones failed: {}", err);
        }
        log::info!("zonekv closed");
        result
    }
}

impl Drop for ZoneKv {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::warn!("Error while closing: {}", err);
        }
    }
}
