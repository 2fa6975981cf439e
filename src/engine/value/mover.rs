//! Value mover: empties a sparsely referenced value file.
//!
//! Every record still indexed by the file is offered back to the engine as a
//! conditional rewrite. The engine only rewrites a key whose newest value is
//! still exactly that reference, so stale records cost nothing. Once the old
//! references are compacted away the file reaches deleted == total and is
//! reclaimed like any other.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::{FileNumber, ValueReference};
use crate::zoned::FileId;

use super::cache::ValueFileCache;
use super::section::{read_footers, read_index};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MoveStats {
    /// Records rewritten by the engine.
    pub moved: u64,
    /// Records whose key no longer points at this file.
    pub stale: u64,
}

pub struct ValueMover {
    cache: Arc<ValueFileCache>,
    file_number: FileNumber,
}

impl ValueMover {
    pub fn new(cache: Arc<ValueFileCache>, file_number: FileNumber) -> Self {
        Self { cache, file_number }
    }

    /// Walk the sections back to front and call `rewrite` for each indexed
    /// record. `rewrite` returns whether the record was still live and moved.
    pub fn run<F>(&self, shutdown: &AtomicBool, mut rewrite: F) -> Result<MoveStats>
    where
        F: FnMut(&[u8], &ValueReference) -> Result<bool>,
    {
        if self.cache.is_writable(self.file_number) {
            return Err(Error::InvalidArgument(format!(
                "value file {} is still open for writing",
                self.file_number
            )));
        }
        log::info!("Defragmenting value file {}", self.file_number);
        let id = FileId::value(self.file_number);
        let store = self.cache.store();
        let mut stats = MoveStats::default();
        for footer in read_footers(store, id)? {
            for (key, reference) in read_index(store, id, &footer)? {
                if shutdown.load(Ordering::Acquire) {
                    return Err(Error::ShuttingDown);
                }
                if rewrite(&key, &reference)? {
                    stats.moved += 1;
                } else {
                    stats.stale += 1;
                }
            }
        }
        log::info!(
            "Value file {} defragmented: {} moved, {} stale",
            self.file_number,
            stats.moved,
            stats.stale
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::value::ValueBuilder;
    use crate::engine::version::FileNumbers;
    use crate::zoned::{MemoryZonedDevice, ZonedStore};

    #[test]
    fn test_offers_every_record() {
        let device = MemoryZonedDevice::new(64 * 1024, 8);
        let store = Arc::new(ZonedStore::open(Arc::new(device)).unwrap());
        let cache = Arc::new(ValueFileCache::new(store));
        let mut builder =
            ValueBuilder::new(cache.clone(), Arc::new(FileNumbers::new(7)), 64, 4096);
        let mut live = Vec::new();
        for i in 0..12u8 {
            let reference = builder.add(&[b'k', i], &[i; 100]).unwrap();
            if i % 3 == 0 {
                live.push(reference);
            }
        }
        builder.finish().unwrap();
        cache.remove_writable(7);

        let shutdown = AtomicBool::new(false);
        let mut seen = 0;
        let stats = ValueMover::new(cache.clone(), 7)
            .run(&shutdown, |key, reference| {
                seen += 1;
                let value = cache.get_readable(7)?.read(reference)?;
                assert_eq!(value, vec![key[1]; 100]);
                Ok(live.contains(reference))
            })
            .unwrap();
        assert_eq!(seen, 12);
        assert_eq!(stats, MoveStats { moved: 4, stale: 8 });
    }

    #[test]
    fn test_refuses_open_writer_and_stops_on_shutdown() {
        let device = MemoryZonedDevice::new(64 * 1024, 8);
        let store = Arc::new(ZonedStore::open(Arc::new(device)).unwrap());
        let cache = Arc::new(ValueFileCache::new(store));
        let mut builder =
            ValueBuilder::new(cache.clone(), Arc::new(FileNumbers::new(2)), 1024, 4096);
        builder.add(b"a", &[1u8; 10]).unwrap();
        builder.finish().unwrap();

        let shutdown = AtomicBool::new(false);
        let mover = ValueMover::new(cache.clone(), 2);
        assert!(mover.run(&shutdown, |_, _| Ok(true)).is_err());

        cache.remove_writable(2);
        shutdown.store(true, Ordering::Release);
        assert!(matches!(
            mover.run(&shutdown, |_, _| Ok(true)),
            Err(Error::ShuttingDown)
        ));
    }
}
