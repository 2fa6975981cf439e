//! The catalog: current version, manifest log and value file counts.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};

use crate::config::Config;
use crate::engine::sstable::TableCache;
use crate::engine::wal::{LogReader, LogWriter};
use crate::error::{Error, Result};
use crate::types::{FileNumber, InternalKey, SequenceNumber};
use crate::zoned::{FileId, FileKind, ZonedStore};

use super::{FileMetaData, FileNumbers, Version, VersionEdit, NUM_LEVELS};

/// Record counts of one value file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValueFileStats {
    pub total: u64,
    pub deleted: u64,
}

impl ValueFileStats {
    pub fn live(&self) -> u64 {
        self.total.saturating_sub(self.deleted)
    }

    pub fn live_ratio(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.live() as f64 / self.total as f64
    }

    /// Every record was dropped by some compaction.
    pub fn fully_deleted(&self) -> bool {
        self.deleted >= self.total
    }
}

pub struct VersionSet {
    store: Arc<ZonedStore>,
    tables: Arc<TableCache>,
    numbers: Arc<FileNumbers>,
    strict: bool,
    max_manifest_size: u64,
    pub(crate) max_bytes_for_level_base: u64,
    pub(crate) l0_compaction_trigger: usize,
    pub(crate) max_file_size: u64,
    log_number: FileNumber,
    last_sequence: SequenceNumber,
    manifest: Option<LogWriter>,
    current: Arc<Version>,
    /// Every version handed out; dead entries are pruned on access.
    live: Vec<Weak<Version>>,
    pub(crate) compact_pointers: Vec<Option<InternalKey>>,
    value_files: BTreeMap<FileNumber, ValueFileStats>,
}

impl VersionSet {
    pub fn new(
        store: Arc<ZonedStore>,
        tables: Arc<TableCache>,
        numbers: Arc<FileNumbers>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            tables,
            numbers,
            strict: config.paranoid_checks,
            max_manifest_size: config.max_manifest_size,
            max_bytes_for_level_base: config.max_bytes_for_level_base,
            l0_compaction_trigger: config.l0_compaction_trigger,
            max_file_size: config.max_file_size,
            log_number: 0,
            last_sequence: 0,
            manifest: None,
            current: Arc::new(Version::new()),
            live: Vec::new(),
            compact_pointers: vec![None; NUM_LEVELS],
            value_files: BTreeMap::new(),
        }
    }

    /// Rebuild the catalog from the manifest named by the superblock and start
    /// a fresh manifest holding a full snapshot. Returns false for a new database.
    pub fn recover(&mut self) -> Result<bool> {
        let existing = self.store.current();
        let mut files: Vec<Vec<Arc<FileMetaData>>> = vec![Vec::new(); NUM_LEVELS];
        let mut next_file = 1;
        if let Some(manifest) = existing {
            let id = FileId::manifest(manifest);
            let mut reader = LogReader::open(&self.store, id, self.strict)?;
            let mut edits = 0usize;
            while let Some(record) = reader.read_record()? {
                let edit = VersionEdit::decode(&record)?;
                if let Some(n) = edit.log_number {
                    self.log_number = n;
                }
                if let Some(n) = edit.next_file_number {
                    next_file = n;
                }
                if let Some(s) = edit.last_sequence {
                    self.last_sequence = s;
                }
                self.apply_pointers(&edit);
                apply_files(&edit, &mut files);
                apply_value_stats(&edit, &mut self.value_files);
                edits += 1;
            }
            log::info!(
                "Recovered manifest {}: {} edits, last sequence {}",
                manifest,
                edits,
                self.last_sequence
            );
        }
        self.numbers.mark_used(next_file.saturating_sub(1));
        self.numbers.mark_used(highest_stored_number(&self.store));
        for file in files.iter().flatten() {
            self.numbers.mark_used(file.number);
        }
        if let Some(number) = self.value_files.keys().next_back() {
            self.numbers.mark_used(*number);
        }
        let version = self.build(files);
        self.install(version);

        let old = existing;
        self.manifest = None;
        self.rotate_manifest()?;
        if let Some(old) = old {
            self.delete_manifest(old);
        }
        Ok(existing.is_some())
    }

    fn build(&self, mut files: Vec<Vec<Arc<FileMetaData>>>) -> Version {
        files[0].sort_by_key(|f| f.number);
        for level in files.iter_mut().skip(1) {
            level.sort_by(|a, b| a.smallest.cmp(&b.smallest));
        }
        let mut version = Version::new();
        version.files = files;
        let (level, score) = self.compaction_score(&version);
        version.compaction_level = level;
        version.compaction_score = score;
        version
    }

    pub fn max_bytes_for_level(&self, level: usize) -> u64 {
        let mut bytes = self.max_bytes_for_level_base;
        for _ in 1..level {
            bytes = bytes.saturating_mul(10);
        }
        bytes
    }

    fn compaction_score(&self, version: &Version) -> (usize, f64) {
        let mut best = (0, version.num_files(0) as f64 / self.l0_compaction_trigger as f64);
        for level in 1..NUM_LEVELS - 1 {
            let score = version.level_bytes(level) as f64 / self.max_bytes_for_level(level) as f64;
            if score > best.1 {
                best = (level, score);
            }
        }
        best
    }

    fn install(&mut self, version: Version) {
        let version = Arc::new(version);
        self.live.retain(|v| v.strong_count() > 0);
        self.live.push(Arc::downgrade(&version));
        self.current = version;
    }

    fn apply_pointers(&mut self, edit: &VersionEdit) {
        for (level, key) in &edit.compact_pointers {
            if let Some(slot) = self.compact_pointers.get_mut(*level) {
                *slot = Some(key.clone());
            }
        }
    }

    /// A new manifest starting with a snapshot of the current state.
    fn rotate_manifest(&mut self) -> Result<()> {
        let number = self.numbers.next();
        let id = FileId::manifest(number);
        let mut writer = LogWriter::create(Arc::clone(&self.store), id)?;
        let result = (|| {
            writer.add_record(&self.snapshot_edit().encode()?)?;
            writer.sync()
        })();
        if let Err(err) = result {
            drop(writer);
            if let Err(e) = self.store.delete(id) {
                log::warn!("Failed to delete unfinished manifest {}: {}", number, e);
            }
            return Err(err);
        }
        self.store.set_current(number)?;
        let previous = self.manifest.replace(writer);
        if let Some(previous) = previous {
            self.delete_manifest(previous.id().number);
        }
        log::debug!("Manifest {} is current", number);
        Ok(())
    }

    fn delete_manifest(&self, number: FileNumber) {
        if let Err(err) = self.store.delete(FileId::manifest(number)) {
            log::warn!("Failed to delete old manifest {}: {}", number, err);
        }
    }

    fn snapshot_edit(&self) -> VersionEdit {
        let mut edit = VersionEdit::new();
        edit.log_number = Some(self.log_number);
        edit.next_file_number = Some(self.numbers.peek());
        edit.last_sequence = Some(self.last_sequence);
        for (level, pointer) in self.compact_pointers.iter().enumerate() {
            if let Some(key) = pointer {
                edit.compact_pointers.push((level, key.clone()));
            }
        }
        for (level, file) in self.current.all_files() {
            edit.add_file(level, FileMetaData::clone(file));
        }
        edit.value_records_added = self
            .value_files
            .iter()
            .map(|(number, stats)| (*number, stats.total))
            .collect();
        edit.value_records_deleted = self
            .value_files
            .iter()
            .filter(|(_, stats)| stats.deleted > 0)
            .map(|(number, stats)| (*number, stats.deleted))
            .collect();
        edit
    }

    /// Persist `edit` in the manifest, then make the resulting version current.
    /// Nothing in memory changes when the manifest write fails.
    pub fn log_and_apply(&mut self, edit: &mut VersionEdit) -> Result<()> {
        let log_number = edit.log_number.unwrap_or(self.log_number);
        if log_number < self.log_number {
            return Err(Error::InvalidArgument(format!(
                "log number {} goes backwards from {}",
                log_number, self.log_number
            )));
        }
        edit.log_number = Some(log_number);
        edit.next_file_number = Some(self.numbers.peek());
        let last_sequence = edit.last_sequence.unwrap_or(self.last_sequence).max(self.last_sequence);
        edit.last_sequence = Some(last_sequence);

        let mut files = self.current.files.clone();
        apply_files(edit, &mut files);
        let version = self.build(files);

        let rotate = match &self.manifest {
            Some(manifest) => manifest.size()? >= self.max_manifest_size,
            None => true,
        };
        if rotate {
            self.rotate_manifest()?;
        }
        let record = edit.encode()?;
        match self.manifest.as_mut() {
            Some(manifest) => {
                manifest.add_record(&record)?;
                manifest.sync()?;
            }
            None => return Err(Error::Corruption("no manifest is open".into())),
        }

        self.log_number = log_number;
        self.last_sequence = last_sequence;
        self.apply_pointers(edit);
        apply_value_stats(edit, &mut self.value_files);
        self.install(version);
        Ok(())
    }

    pub fn current(&self) -> Arc<Version> {
        Arc::clone(&self.current)
    }

    pub fn table_cache(&self) -> &Arc<TableCache> {
        &self.tables
    }

    pub fn numbers(&self) -> &Arc<FileNumbers> {
        &self.numbers
    }

    pub fn new_file_number(&self) -> FileNumber {
        self.numbers.next()
    }

    pub fn log_number(&self) -> FileNumber {
        self.log_number
    }

    pub fn last_sequence(&self) -> SequenceNumber {
        self.last_sequence
    }

    pub fn set_last_sequence(&mut self, sequence: SequenceNumber) {
        self.last_sequence = self.last_sequence.max(sequence);
    }

    pub fn manifest_number(&self) -> Option<FileNumber> {
        self.manifest.as_ref().map(|m| m.id().number)
    }

    pub fn num_level_files(&self, level: usize) -> usize {
        self.current.num_files(level)
    }

    /// Tables listed by any version still alive.
    pub fn live_tables(&mut self) -> BTreeSet<FileNumber> {
        self.live.retain(|v| v.strong_count() > 0);
        let mut live: BTreeSet<FileNumber> = self.current.all_files().map(|(_, f)| f.number).collect();
        for version in self.live.iter().filter_map(Weak::upgrade) {
            live.extend(version.all_files().map(|(_, f)| f.number));
        }
        live
    }

    /// Value files referenced by tables of any version still alive.
    pub fn referenced_value_files(&mut self) -> BTreeSet<FileNumber> {
        self.live.retain(|v| v.strong_count() > 0);
        let mut referenced = self.current.value_files();
        for version in self.live.iter().filter_map(Weak::upgrade) {
            referenced.extend(version.value_files());
        }
        referenced
    }

    pub fn value_file_stats(&self) -> &BTreeMap<FileNumber, ValueFileStats> {
        &self.value_files
    }

    /// Fully deleted value files that are not open for writing; `pending`
    /// holds deletions about to be added by the same edit.
    pub fn reclaimable_value_files(
        &self,
        pending: &BTreeMap<FileNumber, u64>,
        is_writable: impl Fn(FileNumber) -> bool,
    ) -> Vec<FileNumber> {
        self.value_files
            .iter()
            .filter(|(number, stats)| {
                let deleted = stats.deleted + pending.get(number).copied().unwrap_or(0);
                deleted >= stats.total && !is_writable(**number)
            })
            .map(|(number, _)| *number)
            .collect()
    }

    /// Per-level line for the `zonekv.sstables` property.
    pub fn describe_tables(&self) -> String {
        let mut out = String::new();
        for level in 0..NUM_LEVELS {
            let files = self.current.files(level);
            if files.is_empty() {
                continue;
            }
            out.push_str(&format!("--- level {} ---\n", level));
            for file in files {
                out.push_str(&format!(" {:?}\n", file));
            }
        }
        out
    }
}

/// Highest number used by any file in the store.
fn highest_stored_number(store: &ZonedStore) -> FileNumber {
    [FileKind::Log, FileKind::Manifest, FileKind::Table, FileKind::Value]
        .into_iter()
        .flat_map(|kind| store.list_files(kind))
        .max()
        .unwrap_or(0)
}

fn apply_files(edit: &VersionEdit, files: &mut [Vec<Arc<FileMetaData>>]) {
    for (level, number) in &edit.deleted_files {
        if let Some(level) = files.get_mut(*level) {
            level.retain(|f| f.number != *number);
        }
    }
    for (level, file) in &edit.new_files {
        if let Some(level) = files.get_mut(*level) {
            level.retain(|f| f.number != file.number);
            level.push(Arc::new(file.clone()));
        }
    }
}

fn apply_value_stats(edit: &VersionEdit, stats: &mut BTreeMap<FileNumber, ValueFileStats>) {
    for (number, count) in &edit.value_records_added {
        stats.entry(*number).or_default().total += count;
    }
    for (number, count) in &edit.value_records_deleted {
        if let Some(entry) = stats.get_mut(number) {
            entry.deleted += count;
        }
    }
    for number in &edit.obsolete_value_files {
        stats.remove(number);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ValueKind;
    use crate::zoned::MemoryZonedDevice;

    fn open(device: &MemoryZonedDevice) -> VersionSet {
        let store = Arc::new(ZonedStore::open(Arc::new(device.clone())).unwrap());
        let tables = Arc::new(TableCache::new(store.clone(), 16));
        let config = Config::small("/unused");
        let mut set = VersionSet::new(store, tables, Arc::new(FileNumbers::new(1)), &config);
        set.recover().unwrap();
        set
    }

    fn file(number: u64, smallest: &str, largest: &str) -> FileMetaData {
        FileMetaData::new(
            number,
            2048,
            InternalKey::new(smallest.as_bytes().to_vec(), 1, ValueKind::Put),
            InternalKey::new(largest.as_bytes().to_vec(), 1, ValueKind::Put),
            vec![50],
        )
    }

    #[test]
    fn test_edits_survive_reopen() {
        let device = MemoryZonedDevice::new(64 * 1024, 16);
        {
            let mut set = open(&device);
            let mut edit = VersionEdit::new();
            edit.add_file(0, file(10, "a", "c"));
            edit.add_file(1, file(11, "d", "f"));
            edit.value_records_added.push((50, 4));
            edit.last_sequence = Some(77);
            edit.log_number = Some(9);
            set.log_and_apply(&mut edit).unwrap();

            let mut edit = VersionEdit::new();
            edit.delete_file(0, 10);
            edit.value_records_deleted.push((50, 1));
            set.log_and_apply(&mut edit).unwrap();
        }
        let set = open(&device);
        let version = set.current();
        assert_eq!(version.num_files(0), 0);
        assert_eq!(version.files(1)[0].number, 11);
        assert_eq!(set.last_sequence(), 77);
        assert_eq!(set.log_number(), 9);
        assert_eq!(
            set.value_file_stats().get(&50),
            Some(&ValueFileStats { total: 4, deleted: 1 })
        );
        assert!(set.numbers().peek() > 11);
        // Only the fresh manifest remains.
        assert_eq!(set.store.list_files(FileKind::Manifest).len(), 1);
    }

    #[test]
    fn test_pinned_versions_keep_tables_live() {
        let device = MemoryZonedDevice::new(64 * 1024, 16);
        let mut set = open(&device);
        let mut edit = VersionEdit::new();
        edit.add_file(1, file(20, "a", "b"));
        set.log_and_apply(&mut edit).unwrap();
        let pinned = set.current();

        let mut edit = VersionEdit::new();
        edit.delete_file(1, 20);
        set.log_and_apply(&mut edit).unwrap();
        assert!(set.live_tables().contains(&20));
        assert!(set.referenced_value_files().contains(&50));
        drop(pinned);
        assert!(!set.live_tables().contains(&20));
    }

    #[test]
    fn test_reclaimable_value_files() {
        let device = MemoryZonedDevice::new(64 * 1024, 16);
        let mut set = open(&device);
        let mut edit = VersionEdit::new();
        edit.value_records_added = vec![(5, 2), (6, 3)];
        edit.value_records_deleted = vec![(5, 2)];
        set.log_and_apply(&mut edit).unwrap();

        let none = BTreeMap::new();
        assert_eq!(set.reclaimable_value_files(&none, |_| false), vec![5]);
        assert!(set.reclaimable_value_files(&none, |n| n == 5).is_empty());
        let pending = BTreeMap::from([(6, 3)]);
        assert_eq!(set.reclaimable_value_files(&pending, |_| false), vec![5, 6]);

        let mut edit = VersionEdit::new();
        edit.obsolete_value_files.push(5);
        set.log_and_apply(&mut edit).unwrap();
        assert!(!set.value_file_stats().contains_key(&5));
    }

    #[test]
    fn test_manifest_rotates_when_large() {
        let device = MemoryZonedDevice::new(64 * 1024, 16);
        let mut set = open(&device);
        set.max_manifest_size = 256;
        let first = set.manifest_number();
        for i in 0..5 {
            let mut edit = VersionEdit::new();
            edit.add_file(2, file(100 + i, &format!("k{}", i), &format!("k{}", i)));
            set.log_and_apply(&mut edit).unwrap();
        }
        assert_ne!(set.manifest_number(), first);
        assert_eq!(set.store.list_files(FileKind::Manifest).len(), 1);
        assert_eq!(set.current().num_files(2), 5);
    }
}
