//! zonekv - MemTable (In-Memory Sorted Map)
//! The MemTable is the write-buffer of the LSM-Tree.
//! All writes go here first before being flushed to sorted files in the zoned store.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;
use crate::types::{InternalKey, SequenceNumber, ValueKind, ValueRecord, ValueReference};

use super::batch::WriteBatch;
use super::iterator::InternalIterator;

/// Outcome of a MemTable point lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemLookup {
    /// Newest visible version is a put.
    Found(ValueRecord),
    /// Newest visible version is a deletion.
    Deleted,
}

/// In-memory sorted map keyed by InternalKey, so every version of a key is kept.
/// Shared through `Arc` between the write path, readers and the flush.
pub struct MemTable {
    /// Sorted versions; the newest version of a key sorts first.
    entries: RwLock<BTreeMap<InternalKey, ValueRecord>>,
    /// Approximate memory usage in bytes.
    size_bytes: AtomicUsize,
    /// Approximate size of the sorted file this MemTable flushes into; values at
    /// or above the threshold only count as a reference.
    table_bytes: AtomicUsize,
    value_threshold: usize,
}

impl MemTable {
    /// Create a new, empty MemTable.
    pub fn new(value_threshold: usize) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            size_bytes: AtomicUsize::new(0),
            table_bytes: AtomicUsize::new(0),
            value_threshold,
        }
    }

    /// Returns the approximate size of the MemTable in bytes.
    pub fn size(&self) -> usize {
        self.size_bytes.load(Ordering::Relaxed)
    }

    /// Returns the approximate size of the sorted file it will flush into.
    pub fn table_size(&self) -> usize {
        self.table_bytes.load(Ordering::Relaxed)
    }

    /// Returns the number of versions in the MemTable.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if the MemTable is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Insert one version.
    pub fn insert(&self, key: InternalKey, value: ValueRecord) {
        let key_size = key.encoded_len();
        let value_size = value.encoded_len();
        let table_value = match &value {
            ValueRecord::Inline(bytes) if bytes.len() >= self.value_threshold => {
                1 + ValueReference::ENCODED_LEN
            }
            _ => value_size,
        };
        self.size_bytes
            .fetch_add(key_size + value_size, Ordering::Relaxed);
        self.table_bytes
            .fetch_add(key_size + table_value, Ordering::Relaxed);
        self.entries.write().insert(key, value);
    }

    /// Apply every entry of `batch`, numbering them from the batch's sequence.
    pub fn apply(&self, batch: &WriteBatch) {
        let mut sequence = batch.sequence();
        for entry in batch.entries() {
            let key = InternalKey::new(entry.key.clone(), sequence, entry.kind);
            let value = match entry.kind {
                ValueKind::Put => entry.value.clone(),
                ValueKind::Delete => ValueRecord::empty(),
            };
            self.insert(key, value);
            sequence += 1;
        }
    }

    /// Newest version of `user_key` not newer than `sequence`.
    pub fn get(&self, user_key: &[u8], sequence: SequenceNumber) -> Option<MemLookup> {
        let lookup = InternalKey::lookup(user_key, sequence);
        let entries = self.entries.read();
        let (key, value) = entries.range(lookup..).next()?;
        if key.user_key != user_key {
            return None;
        }
        Some(match key.kind {
            ValueKind::Put => MemLookup::Found(value.clone()),
            ValueKind::Delete => MemLookup::Deleted,
        })
    }

    /// Clone of every version in order.
    pub fn entries(&self) -> Vec<(InternalKey, ValueRecord)> {
        self.entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn first_at_or_after(&self, bound: Bound<&InternalKey>) -> Option<(InternalKey, ValueRecord)> {
        self.entries
            .read()
            .range((bound, Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()))
    }
}

/// Cursor over a shared MemTable.
///
/// Each step re-seeks past the current key instead of holding the lock, so
/// concurrent inserts are allowed while the iterator lives.
pub struct MemTableIterator {
    table: Arc<MemTable>,
    current: Option<(InternalKey, ValueRecord)>,
}

impl MemTableIterator {
    pub fn new(table: Arc<MemTable>) -> Self {
        Self {
            table,
            current: None,
        }
    }
}

impl InternalIterator for MemTableIterator {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) -> Result<()> {
        self.current = self.table.first_at_or_after(Bound::Unbounded);
        Ok(())
    }

    fn seek(&mut self, target: &InternalKey) -> Result<()> {
        self.current = self.table.first_at_or_after(Bound::Included(target));
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        if let Some((key, _)) = self.current.take() {
            self.current = self.table.first_at_or_after(Bound::Excluded(&key));
        }
        Ok(())
    }

    fn key(&self) -> &InternalKey {
        match &self.current {
            Some((key, _)) => key,
            None => panic!("MemTableIterator::key on an invalid iterator"),
        }
    }

    fn value(&self) -> &ValueRecord {
        match &self.current {
            Some((_, value)) => value,
            None => panic!("MemTableIterator::value on an invalid iterator"),
        }
    }
}
