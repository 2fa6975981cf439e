//! zonekv - Versions
//! A `Version` is the immutable set of sorted files per level at one point in
//! time. Readers and iterators pin a version through its `Arc`; the files it
//! lists stay on the device until every pin is dropped.

pub mod edit;
pub mod set;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{FileNumber, InternalKey, ValueKind, ValueRecord};

use super::iterator::InternalIterator;
use super::sstable::{BuiltTable, TableCache, TableIterator};

pub use self::edit::VersionEdit;
pub use self::set::{ValueFileStats, VersionSet};

pub const NUM_LEVELS: usize = 7;

/// Seek budget floor of a table.
const MIN_ALLOWED_SEEKS: i64 = 100;
/// One seek is charged per this many bytes of table size.
const BYTES_PER_SEEK: u64 = 16 * 1024;

/// Allocator of file numbers, shared with builders that create files while
/// the catalog lock is not held.
#[derive(Debug, Default)]
pub struct FileNumbers(AtomicU64);

impl FileNumbers {
    pub fn new(next: FileNumber) -> Self {
        Self(AtomicU64::new(next))
    }

    pub fn next(&self) -> FileNumber {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    /// Next number that would be handed out.
    pub fn peek(&self) -> FileNumber {
        self.0.load(Ordering::SeqCst)
    }

    /// Never hand out `number` or anything below it.
    pub fn mark_used(&self, number: FileNumber) {
        self.0.fetch_max(number + 1, Ordering::SeqCst);
    }
}

/// Catalog entry of one sorted file.
#[derive(Serialize, Deserialize)]
pub struct FileMetaData {
    pub number: FileNumber,
    pub size: u64,
    pub smallest: InternalKey,
    pub largest: InternalKey,
    /// Value files referenced by entries of this table.
    pub value_files: Vec<FileNumber>,
    /// Lookups this file may still cause before it is compacted.
    #[serde(skip)]
    allowed_seeks: AtomicI64,
}

impl FileMetaData {
    pub fn new(
        number: FileNumber,
        size: u64,
        smallest: InternalKey,
        largest: InternalKey,
        value_files: Vec<FileNumber>,
    ) -> Self {
        let allowed_seeks = ((size / BYTES_PER_SEEK) as i64).max(MIN_ALLOWED_SEEKS);
        Self {
            number,
            size,
            smallest,
            largest,
            value_files,
            allowed_seeks: AtomicI64::new(allowed_seeks),
        }
    }

    pub fn from_built(built: &BuiltTable) -> Self {
        Self::new(
            built.number,
            built.size,
            built.smallest.clone(),
            built.largest.clone(),
            built.value_files.iter().copied().collect(),
        )
    }

    /// Whether the file's user key range intersects `[begin, end]`; `None` is unbounded.
    pub fn overlaps(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> bool {
        let before = end.is_some_and(|end| self.smallest.user_key.as_slice() > end);
        let after = begin.is_some_and(|begin| self.largest.user_key.as_slice() < begin);
        !(before || after)
    }
}

impl Clone for FileMetaData {
    fn clone(&self) -> Self {
        Self::new(
            self.number,
            self.size,
            self.smallest.clone(),
            self.largest.clone(),
            self.value_files.clone(),
        )
    }
}

impl fmt::Debug for FileMetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} ({} bytes) [{:?} .. {:?}]",
            self.number, self.size, self.smallest, self.largest
        )
    }
}

/// Table charged for a lookup that had to consult more than one file.
#[derive(Debug, Clone)]
pub struct SeekCharge {
    pub level: usize,
    pub file: Arc<FileMetaData>,
}

/// Result of a version lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionLookup {
    Found(ValueRecord),
    Deleted,
    Missing,
}

pub struct Version {
    pub(crate) files: Vec<Vec<Arc<FileMetaData>>>,
    /// Level most in need of compaction and its score (>= 1 means needed).
    pub(crate) compaction_level: usize,
    pub(crate) compaction_score: f64,
    /// Set once a file used up its seek budget.
    file_to_compact: Mutex<Option<(usize, Arc<FileMetaData>)>>,
}

impl Version {
    pub fn new() -> Self {
        Self {
            files: vec![Vec::new(); NUM_LEVELS],
            compaction_level: 0,
            compaction_score: 0.0,
            file_to_compact: Mutex::new(None),
        }
    }

    pub fn files(&self, level: usize) -> &[Arc<FileMetaData>] {
        &self.files[level]
    }

    pub fn num_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    pub fn level_bytes(&self, level: usize) -> u64 {
        self.files[level].iter().map(|f| f.size).sum()
    }

    pub fn all_files(&self) -> impl Iterator<Item = (usize, &Arc<FileMetaData>)> {
        self.files
            .iter()
            .enumerate()
            .flat_map(|(level, files)| files.iter().map(move |f| (level, f)))
    }

    pub fn file_to_compact(&self) -> Option<(usize, Arc<FileMetaData>)> {
        self.file_to_compact.lock().clone()
    }

    pub fn needs_compaction(&self) -> bool {
        self.compaction_score >= 1.0 || self.file_to_compact.lock().is_some()
    }

    /// Value files referenced by any table of this version.
    pub fn value_files(&self) -> BTreeSet<FileNumber> {
        self.all_files()
            .flat_map(|(_, f)| f.value_files.iter().copied())
            .collect()
    }

    /// Newest version of `lookup.user_key` visible at `lookup.sequence`.
    ///
    /// Level-0 files may overlap, so all of them are checked and the highest
    /// sequence wins. Deeper levels hold at most one candidate file each: the
    /// first whose largest key is not below `lookup`.
    pub fn get(
        &self,
        lookup: &InternalKey,
        tables: &TableCache,
    ) -> Result<(VersionLookup, Option<SeekCharge>)> {
        let user_key = lookup.user_key.as_slice();
        let mut first_consulted: Option<SeekCharge> = None;
        let mut consulted = 0usize;
        let mut best: Option<(InternalKey, ValueRecord)> = None;

        for file in &self.files[0] {
            if !file.overlaps(Some(user_key), Some(user_key)) {
                continue;
            }
            consulted += 1;
            if first_consulted.is_none() {
                first_consulted = Some(SeekCharge {
                    level: 0,
                    file: Arc::clone(file),
                });
            }
            if let Some((key, value)) = tables.get(file.number, lookup)? {
                if best.as_ref().map_or(true, |(b, _)| key.sequence > b.sequence) {
                    best = Some((key, value));
                }
            }
        }

        if best.is_none() {
            for level in 1..NUM_LEVELS {
                let files = &self.files[level];
                // By internal key: versions of one user key may span two files.
                let index = files.partition_point(|f| f.largest < *lookup);
                let Some(file) = files.get(index) else {
                    continue;
                };
                if file.smallest.user_key.as_slice() > user_key {
                    continue;
                }
                consulted += 1;
                if first_consulted.is_none() {
                    first_consulted = Some(SeekCharge {
                        level,
                        file: Arc::clone(file),
                    });
                }
                if let Some(found) = tables.get(file.number, lookup)? {
                    best = Some(found);
                    break;
                }
            }
        }

        let charge = if consulted > 1 { first_consulted } else { None };
        let result = match best {
            Some((key, value)) => match key.kind {
                ValueKind::Put => VersionLookup::Found(value),
                ValueKind::Delete => VersionLookup::Deleted,
            },
            None => VersionLookup::Missing,
        };
        Ok((result, charge))
    }

    /// Charge a seek; returns true when the file just ran out of budget.
    pub fn update_stats(&self, charge: &SeekCharge) -> bool {
        let left = charge.file.allowed_seeks.fetch_sub(1, Ordering::Relaxed) - 1;
        if left > 0 {
            return false;
        }
        let mut slot = self.file_to_compact.lock();
        if slot.is_none() {
            log::debug!("Table {} exhausted its seek budget", charge.file.number);
            *slot = Some((charge.level, Arc::clone(&charge.file)));
            return true;
        }
        false
    }

    /// Files of `level` overlapping `[begin, end]`. On level 0 the range grows
    /// to cover every overlapping file, since their ranges may intersect.
    pub fn overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Vec<Arc<FileMetaData>> {
        let mut begin = begin.map(|b| b.to_vec());
        let mut end = end.map(|e| e.to_vec());
        'restart: loop {
            let mut inputs = Vec::new();
            for file in &self.files[level] {
                if !file.overlaps(begin.as_deref(), end.as_deref()) {
                    continue;
                }
                if level == 0 {
                    let small = &file.smallest.user_key;
                    let large = &file.largest.user_key;
                    if begin.as_ref().is_some_and(|b| small < b) {
                        begin = Some(small.clone());
                        continue 'restart;
                    }
                    if end.as_ref().is_some_and(|e| large > e) {
                        end = Some(large.clone());
                        continue 'restart;
                    }
                }
                inputs.push(Arc::clone(file));
            }
            return inputs;
        }
    }

    pub fn overlaps_level(&self, level: usize, begin: Option<&[u8]>, end: Option<&[u8]>) -> bool {
        self.files[level].iter().any(|f| f.overlaps(begin, end))
    }

    /// One iterator per level-0 file plus one concatenating iterator per deeper level.
    pub fn iterators(&self, tables: &Arc<TableCache>) -> Result<Vec<Box<dyn InternalIterator>>> {
        let mut iters: Vec<Box<dyn InternalIterator>> = Vec::new();
        for file in &self.files[0] {
            iters.push(Box::new(tables.iter(file.number)?));
        }
        for level in 1..NUM_LEVELS {
            if !self.files[level].is_empty() {
                iters.push(Box::new(LevelIterator::new(
                    self.files[level].clone(),
                    Arc::clone(tables),
                )));
            }
        }
        Ok(iters)
    }

    /// `files[ 0 1 0 0 0 0 0 ]`-style summary.
    pub fn level_summary(&self) -> String {
        let counts: Vec<String> = self.files.iter().map(|f| f.len().to_string()).collect();
        format!("files[ {} ]", counts.join(" "))
    }
}

impl Default for Version {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterates the sorted, disjoint files of one level, opening one table at a time.
pub struct LevelIterator {
    files: Vec<Arc<FileMetaData>>,
    tables: Arc<TableCache>,
    index: usize,
    current: Option<TableIterator>,
}

impl LevelIterator {
    pub fn new(files: Vec<Arc<FileMetaData>>, tables: Arc<TableCache>) -> Self {
        let index = files.len();
        Self {
            files,
            tables,
            index,
            current: None,
        }
    }

    fn open(&mut self, index: usize) -> Result<()> {
        self.index = index;
        self.current = match self.files.get(index) {
            Some(file) => Some(self.tables.iter(file.number)?),
            None => None,
        };
        Ok(())
    }

    fn skip_empty_files(&mut self) -> Result<()> {
        while self.current.as_ref().is_some_and(|it| !it.valid()) {
            self.open(self.index + 1)?;
            if let Some(it) = self.current.as_mut() {
                it.seek_to_first()?;
            }
        }
        Ok(())
    }
}

impl InternalIterator for LevelIterator {
    fn valid(&self) -> bool {
        self.current.as_ref().is_some_and(|it| it.valid())
    }

    fn seek_to_first(&mut self) -> Result<()> {
        self.open(0)?;
        if let Some(it) = self.current.as_mut() {
            it.seek_to_first()?;
        }
        self.skip_empty_files()
    }

    fn seek(&mut self, target: &InternalKey) -> Result<()> {
        let index = self.files.partition_point(|f| f.largest < *target);
        self.open(index)?;
        if let Some(it) = self.current.as_mut() {
            it.seek(target)?;
        }
        self.skip_empty_files()
    }

    fn next(&mut self) -> Result<()> {
        if let Some(it) = self.current.as_mut() {
            it.next()?;
        }
        self.skip_empty_files()
    }

    fn key(&self) -> &InternalKey {
        match &self.current {
            Some(it) => it.key(),
            None => panic!("LevelIterator::key on an invalid iterator"),
        }
    }

    fn value(&self) -> &ValueRecord {
        match &self.current {
            Some(it) => it.value(),
            None => panic!("LevelIterator::value on an invalid iterator"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(number: u64, smallest: &str, largest: &str) -> Arc<FileMetaData> {
        Arc::new(FileMetaData::new(
            number,
            1000,
            InternalKey::new(smallest.as_bytes().to_vec(), 10, ValueKind::Put),
            InternalKey::new(largest.as_bytes().to_vec(), 5, ValueKind::Put),
            Vec::new(),
        ))
    }

    #[test]
    fn test_overlap_check() {
        let file = meta(1, "c", "f");
        assert!(file.overlaps(Some(b"a"), Some(b"c")));
        assert!(file.overlaps(Some(b"f"), None));
        assert!(file.overlaps(None, None));
        assert!(!file.overlaps(Some(b"g"), None));
        assert!(!file.overlaps(None, Some(b"b")));
    }

    #[test]
    fn test_level0_inputs_expand() {
        let mut version = Version::new();
        version.files[0] = vec![meta(1, "a", "d"), meta(2, "c", "h"), meta(3, "x", "z")];
        let inputs = version.overlapping_inputs(0, Some(b"b"), Some(b"b"));
        let numbers: Vec<u64> = inputs.iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![1, 2]);
        version.files[1] = vec![meta(4, "a", "b"), meta(5, "e", "g")];
        assert_eq!(version.overlapping_inputs(1, Some(b"c"), Some(b"d")).len(), 0);
        assert_eq!(version.overlapping_inputs(1, None, None).len(), 2);
        assert_eq!(version.level_summary(), "files[ 3 2 0 0 0 0 0 ]");
    }

    #[test]
    fn test_seek_budget() {
        let version = Version::new();
        let file = meta(9, "a", "b");
        let charge = SeekCharge { level: 1, file };
        let mut exhausted = false;
        for _ in 0..MIN_ALLOWED_SEEKS {
            exhausted |= version.update_stats(&charge);
        }
        assert!(exhausted);
        assert!(version.needs_compaction());
        assert_eq!(version.file_to_compact().unwrap().1.number, 9);
    }

    #[test]
    fn test_file_numbers() {
        let numbers = FileNumbers::new(5);
        assert_eq!(numbers.next(), 5);
        numbers.mark_used(10);
        assert_eq!(numbers.next(), 11);
        assert_eq!(numbers.peek(), 12);
    }
}
