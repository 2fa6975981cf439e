//! Value deleter: batches the value records a compaction drops.

use std::collections::BTreeMap;

use crate::engine::version::VersionEdit;
use crate::types::{FileNumber, ValueReference};

/// Deleted-record counts gathered while a compaction runs. Nothing reaches the
/// catalog until [`ValueDeleter::commit_to`] adds the counts to the
/// compaction's edit, so a failed compaction marks nothing deleted.
#[derive(Debug, Default)]
pub struct ValueDeleter {
    pending: BTreeMap<FileNumber, u64>,
}

impl ValueDeleter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count the record `reference` points at as deleted.
    pub fn mark(&mut self, reference: &ValueReference) {
        *self.pending.entry(reference.file_number).or_default() += 1;
    }

    pub fn pending(&self, file_number: FileNumber) -> u64 {
        self.pending.get(&file_number).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn files(&self) -> impl Iterator<Item = FileNumber> + '_ {
        self.pending.keys().copied()
    }

    /// Move the counts into `edit`.
    pub fn commit_to(self, edit: &mut VersionEdit) {
        edit.value_records_deleted.extend(self.pending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_per_file() {
        let mut deleter = ValueDeleter::new();
        for (file, offset) in [(3, 0), (3, 10), (8, 0)] {
            deleter.mark(&ValueReference {
                file_number: file,
                offset,
                length: 10,
            });
        }
        assert_eq!(deleter.pending(3), 2);
        assert_eq!(deleter.pending(5), 0);
        let mut edit = VersionEdit::default();
        deleter.commit_to(&mut edit);
        assert_eq!(edit.value_records_deleted, vec![(3, 2), (8, 1)]);
    }
}
