//! Open value file handles.
//!
//! Writers are kept open between flushes so a value file grows until its zone
//! is full instead of one file per flush. Each writer has at most one user at
//! a time; a reader for a file with a cached writer is only handed out after
//! that writer was synced.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::types::{FileNumber, Value, ValueRecord, ValueReference};
use crate::zoned::{FileId, ZonedStore};

/// Cached readers kept per cache.
const MAX_READABLE: usize = 10;

/// Read access to one value file.
pub struct ValueFileReader {
    store: Arc<ZonedStore>,
    id: FileId,
}

impl ValueFileReader {
    pub fn number(&self) -> FileNumber {
        self.id.number
    }

    pub fn read(&self, reference: &ValueReference) -> Result<Value> {
        if reference.file_number != self.id.number {
            return Err(Error::InvalidArgument(format!(
                "reference to file {} read through {:?}",
                reference.file_number, self.id
            )));
        }
        let mut value = vec![0u8; reference.length as usize];
        self.store.read(self.id, reference.offset, &mut value)?;
        Ok(value)
    }
}

#[derive(Default)]
struct CacheState {
    /// Open writers; `true` while lent out.
    writable: BTreeMap<FileNumber, bool>,
    readable: HashMap<FileNumber, Arc<ValueFileReader>>,
    /// Reader access order, oldest first.
    access: VecDeque<FileNumber>,
}

pub struct ValueFileCache {
    store: Arc<ZonedStore>,
    state: Mutex<CacheState>,
}

impl ValueFileCache {
    pub fn new(store: Arc<ZonedStore>) -> Self {
        Self {
            store,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn store(&self) -> &Arc<ZonedStore> {
        &self.store
    }

    /// Lend an idle cached writer, or create value file `file_hint` when every
    /// cached writer is busy. Fails with `NoSpaceAvailable` when no empty zone
    /// is left for a new file.
    pub fn get_writable(self: &Arc<Self>, file_hint: FileNumber) -> Result<WritableValueFile> {
        let mut state = self.state.lock();
        let idle = state
            .writable
            .iter()
            .find(|(_, in_use)| !**in_use)
            .map(|(number, _)| *number);
        let number = match idle {
            Some(number) => number,
            None => {
                if self.store.free_zones() == 0 {
                    return Err(Error::NoSpaceAvailable(
                        "no empty zone left for a new value file".into(),
                    ));
                }
                self.store.allocate(FileId::value(file_hint))?;
                log::debug!("Created value file {}", file_hint);
                file_hint
            }
        };
        state.writable.insert(number, true);
        Ok(WritableValueFile {
            cache: Arc::clone(self),
            id: FileId::value(number),
        })
    }

    /// Reader for `file_number`, syncing its cached writer first.
    pub fn get_readable(&self, file_number: FileNumber) -> Result<Arc<ValueFileReader>> {
        let mut state = self.state.lock();
        let id = FileId::value(file_number);
        if state.writable.contains_key(&file_number) {
            self.store.sync(id)?;
        }
        if let Some(reader) = state.readable.get(&file_number) {
            let reader = Arc::clone(reader);
            state.access.retain(|n| *n != file_number);
            state.access.push_back(file_number);
            return Ok(reader);
        }
        if !self.store.exists(id) {
            return Err(Error::Corruption(format!("value file {} is missing", file_number)));
        }
        let reader = Arc::new(ValueFileReader {
            store: Arc::clone(&self.store),
            id,
        });
        state.readable.insert(file_number, Arc::clone(&reader));
        state.access.push_back(file_number);
        while state.readable.len() > MAX_READABLE {
            match state.access.pop_front() {
                Some(oldest) => {
                    state.readable.remove(&oldest);
                }
                None => break,
            }
        }
        Ok(reader)
    }

    /// Close and forget the writer of `file_number`; it is never reused.
    pub fn remove_writable(&self, file_number: FileNumber) {
        let removed = self.state.lock().writable.remove(&file_number).is_some();
        if removed {
            if let Err(err) = self.store.close(FileId::value(file_number)) {
                log::warn!("Failed to close value file {}: {}", file_number, err);
            }
        }
    }

    pub fn remove_readable(&self, file_number: FileNumber) {
        let mut state = self.state.lock();
        state.readable.remove(&file_number);
        state.access.retain(|n| *n != file_number);
    }

    pub fn is_writable(&self, file_number: FileNumber) -> bool {
        self.state.lock().writable.contains_key(&file_number)
    }

    pub fn writable_files(&self) -> Vec<FileNumber> {
        self.state.lock().writable.keys().copied().collect()
    }

    /// Value bytes of a record, reading external values from their file.
    pub fn resolve(&self, record: &ValueRecord) -> Result<Value> {
        match record {
            ValueRecord::Inline(value) => Ok(value.clone()),
            ValueRecord::External(reference) => {
                self.get_readable(reference.file_number)?.read(reference)
            }
        }
    }

    /// Close every cached writer.
    pub fn close_all(&self) {
        for number in self.writable_files() {
            self.remove_writable(number);
        }
    }

    fn release(&self, file_number: FileNumber) {
        if let Some(in_use) = self.state.lock().writable.get_mut(&file_number) {
            *in_use = false;
        }
    }
}

/// Exclusive use of a cached value file writer. Dropping it returns the writer
/// to the cache.
pub struct WritableValueFile {
    cache: Arc<ValueFileCache>,
    id: FileId,
}

impl WritableValueFile {
    pub fn number(&self) -> FileNumber {
        self.id.number
    }

    /// Append `data` and return the offset it starts at.
    pub fn append(&self, data: &[u8]) -> Result<u64> {
        self.cache.store.append(self.id, data)
    }

    pub fn size(&self) -> Result<u64> {
        self.cache.store.size(self.id)
    }

    pub fn space_left(&self) -> Result<u64> {
        self.cache.store.space_left(self.id)
    }

    pub fn sync(&self) -> Result<()> {
        self.cache.store.sync(self.id)
    }

    /// Close the file for good, e.g. when it is full or its state is unknown.
    /// Its zone is finished so no later append can land behind the last section.
    pub fn retire(self) {
        if let Err(err) = self.cache.store.finish(self.id) {
            log::warn!("Failed to finish the zone of value file {}: {}", self.id.number, err);
        }
        self.cache.remove_writable(self.id.number);
    }
}

impl Drop for WritableValueFile {
    fn drop(&mut self) {
        self.cache.release(self.id.number);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zoned::MemoryZonedDevice;

    fn cache(zones: u32) -> Arc<ValueFileCache> {
        let device = MemoryZonedDevice::new(4096, zones);
        let store = Arc::new(ZonedStore::open(Arc::new(device)).unwrap());
        Arc::new(ValueFileCache::new(store))
    }

    #[test]
    fn test_writer_is_exclusive_and_reused() {
        let cache = cache(8);
        let first = cache.get_writable(10).unwrap();
        let second = cache.get_writable(11).unwrap();
        assert_ne!(first.number(), second.number());
        drop(first);
        let again = cache.get_writable(12).unwrap();
        assert_eq!(again.number(), 10);
        assert!(cache.is_writable(10));
        again.retire();
        assert!(!cache.is_writable(10));
        assert_eq!(cache.writable_files(), vec![11]);
    }

    #[test]
    fn test_reader_sees_writer_data() {
        let cache = cache(8);
        let writer = cache.get_writable(3).unwrap();
        let offset = writer.append(b"hello value").unwrap();
        let reference = ValueReference {
            file_number: 3,
            offset,
            length: 11,
        };
        let value = cache.resolve(&ValueRecord::External(reference)).unwrap();
        assert_eq!(value, b"hello value".to_vec());
        assert_eq!(
            cache.resolve(&ValueRecord::Inline(b"x".to_vec())).unwrap(),
            b"x".to_vec()
        );
        cache.remove_readable(3);
        assert!(cache.get_readable(99).is_err());
    }

    #[test]
    fn test_no_space_is_reported() {
        // 3 superblock zones + 2 data zones.
        let cache = cache(5);
        let a = cache.get_writable(1).unwrap();
        let b = cache.get_writable(2).unwrap();
        a.append(b"a").unwrap();
        b.append(b"b").unwrap();
        let err = cache.get_writable(3).err().unwrap();
        assert!(err.is_no_space());
    }
}
