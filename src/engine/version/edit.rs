//! Catalog deltas recorded in the manifest.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{FileNumber, InternalKey, SequenceNumber};

use super::FileMetaData;

/// One change of the catalog. The manifest is a log of bincode-encoded edits;
/// replaying them in order rebuilds the current version and value file counts.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct VersionEdit {
    /// Logs below this number are fully flushed.
    pub log_number: Option<FileNumber>,
    pub next_file_number: Option<FileNumber>,
    pub last_sequence: Option<SequenceNumber>,
    pub compact_pointers: Vec<(usize, InternalKey)>,
    pub deleted_files: Vec<(usize, FileNumber)>,
    pub new_files: Vec<(usize, FileMetaData)>,
    /// Records written to value files by a flush.
    pub value_records_added: Vec<(FileNumber, u64)>,
    /// Records a compaction dropped, per value file.
    pub value_records_deleted: Vec<(FileNumber, u64)>,
    /// Value files taken out of the catalog for reclamation.
    pub obsolete_value_files: Vec<FileNumber>,
}

impl VersionEdit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&mut self, level: usize, file: FileMetaData) {
        self.new_files.push((level, file));
    }

    pub fn delete_file(&mut self, level: usize, number: FileNumber) {
        self.deleted_files.push((level, number));
    }

    pub fn is_empty(&self) -> bool {
        self.log_number.is_none()
            && self.next_file_number.is_none()
            && self.last_sequence.is_none()
            && self.compact_pointers.is_empty()
            && self.deleted_files.is_empty()
            && self.new_files.is_empty()
            && self.value_records_added.is_empty()
            && self.value_records_deleted.is_empty()
            && self.obsolete_value_files.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ValueKind;

    #[test]
    fn test_edit_codec_keeps_every_field() {
        let mut edit = VersionEdit::new();
        assert!(edit.is_empty());
        edit.log_number = Some(4);
        edit.next_file_number = Some(20);
        edit.last_sequence = Some(999);
        edit.compact_pointers
            .push((1, InternalKey::new(b"m".to_vec(), 3, ValueKind::Put)));
        edit.delete_file(1, 7);
        edit.add_file(
            2,
            FileMetaData::new(
                12,
                4096,
                InternalKey::new(b"a".to_vec(), 1, ValueKind::Put),
                InternalKey::new(b"z".to_vec(), 2, ValueKind::Delete),
                vec![5],
            ),
        );
        edit.value_records_added.push((5, 10));
        edit.value_records_deleted.push((5, 3));
        edit.obsolete_value_files.push(2);

        let decoded = VersionEdit::decode(&edit.encode().unwrap()).unwrap();
        assert_eq!(decoded.log_number, Some(4));
        assert_eq!(decoded.next_file_number, Some(20));
        assert_eq!(decoded.last_sequence, Some(999));
        assert_eq!(decoded.compact_pointers, edit.compact_pointers);
        assert_eq!(decoded.deleted_files, vec![(1, 7)]);
        let (level, file) = &decoded.new_files[0];
        assert_eq!(*level, 2);
        assert_eq!(file.number, 12);
        assert_eq!(file.largest.kind, ValueKind::Delete);
        assert_eq!(file.value_files, vec![5]);
        assert_eq!(decoded.value_records_added, vec![(5, 10)]);
        assert_eq!(decoded.value_records_deleted, vec![(5, 3)]);
        assert_eq!(decoded.obsolete_value_files, vec![2]);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(VersionEdit::decode(&[0xff; 3]).is_err());
    }
}
