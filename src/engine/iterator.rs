//! zonekv - Iterators
//! Internal iterators over InternalKey-ordered sources, the merging iterator
//! that combines them, and the user-facing iterator that hides old versions
//! and deletions.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::Result;
use crate::types::{InternalKey, Key, SequenceNumber, Value, ValueKind, ValueRecord};

use super::value::cache::ValueFileCache;

/// A cursor over `(InternalKey, ValueRecord)` pairs in InternalKey order.
pub trait InternalIterator: Send {
    fn valid(&self) -> bool;

    fn seek_to_first(&mut self) -> Result<()>;

    /// Position at the first entry not less than `target`.
    fn seek(&mut self, target: &InternalKey) -> Result<()>;

    fn next(&mut self) -> Result<()>;

    /// Requires `valid()`.
    fn key(&self) -> &InternalKey;

    /// Requires `valid()`.
    fn value(&self) -> &ValueRecord;
}

/// Iterator over an in-memory sorted vector. Used for split compaction outputs
/// and tests.
pub struct VecIterator {
    entries: Vec<(InternalKey, ValueRecord)>,
    pos: usize,
}

impl VecIterator {
    pub fn new(entries: Vec<(InternalKey, ValueRecord)>) -> Self {
        let pos = entries.len();
        Self { entries, pos }
    }
}

impl InternalIterator for VecIterator {
    fn valid(&self) -> bool {
        self.pos < self.entries.len()
    }

    fn seek_to_first(&mut self) -> Result<()> {
        self.pos = 0;
        Ok(())
    }

    fn seek(&mut self, target: &InternalKey) -> Result<()> {
        self.pos = self.entries.partition_point(|(key, _)| key < target);
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        self.pos += 1;
        Ok(())
    }

    fn key(&self) -> &InternalKey {
        &self.entries[self.pos].0
    }

    fn value(&self) -> &ValueRecord {
        &self.entries[self.pos].1
    }
}

/// Merges several iterators into one InternalKey-ordered stream.
///
/// Equal keys cannot occur across children: a sequence number is never reused.
pub struct MergingIterator {
    children: Vec<Box<dyn InternalIterator>>,
    current: Option<usize>,
}

impl MergingIterator {
    pub fn new(children: Vec<Box<dyn InternalIterator>>) -> Self {
        Self {
            children,
            current: None,
        }
    }

    fn find_smallest(&mut self) {
        let mut smallest: Option<usize> = None;
        for (index, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            smallest = match smallest {
                Some(best) if self.children[best].key().cmp(child.key()) != Ordering::Greater => {
                    Some(best)
                }
                _ => Some(index),
            };
        }
        self.current = smallest;
    }
}

impl InternalIterator for MergingIterator {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) -> Result<()> {
        for child in &mut self.children {
            child.seek_to_first()?;
        }
        self.find_smallest();
        Ok(())
    }

    fn seek(&mut self, target: &InternalKey) -> Result<()> {
        for child in &mut self.children {
            child.seek(target)?;
        }
        self.find_smallest();
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        if let Some(index) = self.current {
            self.children[index].next()?;
        }
        self.find_smallest();
        Ok(())
    }

    fn key(&self) -> &InternalKey {
        let index = self.current.unwrap_or_default();
        self.children[index].key()
    }

    fn value(&self) -> &ValueRecord {
        let index = self.current.unwrap_or_default();
        self.children[index].value()
    }
}

/// User-facing iterator at a fixed sequence number.
///
/// Yields each user key once with its newest visible value, skips deleted keys
/// and resolves external values through the value cache. Holds whatever the
/// children pin (memtables, version) until dropped.
pub struct DbIterator {
    inner: MergingIterator,
    sequence: SequenceNumber,
    values: Arc<ValueFileCache>,
    current: Option<(Key, Value)>,
    _pins: Vec<Arc<dyn Send + Sync>>,
}

impl DbIterator {
    pub(crate) fn new(
        inner: MergingIterator,
        sequence: SequenceNumber,
        values: Arc<ValueFileCache>,
        pins: Vec<Arc<dyn Send + Sync>>,
    ) -> Self {
        Self {
            inner,
            sequence,
            values,
            current: None,
            _pins: pins,
        }
    }

    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    pub fn seek_to_first(&mut self) -> Result<()> {
        self.inner.seek_to_first()?;
        self.settle(None)
    }

    /// Position at the first user key not less than `key`.
    pub fn seek(&mut self, key: &[u8]) -> Result<()> {
        self.inner.seek(&InternalKey::lookup(key, self.sequence))?;
        self.settle(None)
    }

    /// Move to the next user key.
    pub fn advance(&mut self) -> Result<()> {
        let skip = self.current.take().map(|(key, _)| key);
        self.settle(skip)
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|(key, _)| key.as_slice())
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|(_, value)| value.as_slice())
    }

    /// Advance to the next user key after `skip` that has a visible live value.
    fn settle(&mut self, mut skip: Option<Key>) -> Result<()> {
        while self.inner.valid() {
            let key = self.inner.key();
            if key.sequence > self.sequence || skip.as_deref() == Some(key.user_key.as_slice()) {
                self.inner.next()?;
                continue;
            }
            let user_key = key.user_key.clone();
            match key.kind {
                ValueKind::Delete => {
                    skip = Some(user_key);
                    self.inner.next()?;
                }
                ValueKind::Put => {
                    let value = self.values.resolve(self.inner.value())?;
                    self.current = Some((user_key, value));
                    return Ok(());
                }
            }
        }
        self.current = None;
        Ok(())
    }
}

impl Iterator for DbIterator {
    type Item = Result<(Key, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.current.clone()?;
        if let Err(err) = self.advance() {
            self.current = None;
            return Some(Err(err));
        }
        Some(Ok(item))
    }
}
