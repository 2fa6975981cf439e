//! zonekv - Snapshots
//! A snapshot pins a sequence number. Reads through it ignore newer writes and
//! compaction keeps every version a live snapshot can still see.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::types::SequenceNumber;

/// Registered snapshot sequences with their handle counts.
#[derive(Debug, Default)]
pub struct SnapshotList {
    active: Mutex<BTreeMap<SequenceNumber, usize>>,
}

impl SnapshotList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a snapshot at `sequence`. It stays registered until the
    /// returned handle is dropped.
    pub fn acquire(self: &Arc<Self>, sequence: SequenceNumber) -> Snapshot {
        *self.active.lock().entry(sequence).or_default() += 1;
        Snapshot {
            sequence,
            list: Arc::clone(self),
        }
    }

    fn release(&self, sequence: SequenceNumber) {
        let mut active = self.active.lock();
        if let Some(count) = active.get_mut(&sequence) {
            *count -= 1;
            if *count == 0 {
                active.remove(&sequence);
            }
        }
    }

    /// Oldest sequence any live snapshot reads at.
    pub fn oldest(&self) -> Option<SequenceNumber> {
        self.active.lock().keys().next().copied()
    }

    pub fn len(&self) -> usize {
        self.active.lock().values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.active.lock().is_empty()
    }
}

/// Read view of the database as of one sequence number.
pub struct Snapshot {
    sequence: SequenceNumber,
    list: Arc<SnapshotList>,
}

impl Snapshot {
    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.list.release(self.sequence);
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Snapshot@{}", self.sequence)
    }
}
