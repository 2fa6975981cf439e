//! Bounded cache of open sorted files.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::types::{FileNumber, InternalKey, ValueRecord};
use crate::zoned::ZonedStore;

use super::reader::{Table, TableIterator};

struct Slot {
    table: Arc<Table>,
    last_used: u64,
}

struct Inner {
    tables: HashMap<FileNumber, Slot>,
    tick: u64,
}

/// Keeps parsed index and filter blocks of recently used tables. Evicts the
/// least recently used entry when full; evicted tables stay alive for as long
/// as an iterator holds them.
pub struct TableCache {
    store: Arc<ZonedStore>,
    capacity: usize,
    inner: Mutex<Inner>,
}

impl TableCache {
    pub fn new(store: Arc<ZonedStore>, capacity: usize) -> Self {
        Self {
            store,
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                tables: HashMap::new(),
                tick: 0,
            }),
        }
    }

    pub fn table(&self, number: FileNumber) -> Result<Arc<Table>> {
        {
            let mut inner = self.inner.lock();
            inner.tick += 1;
            let tick = inner.tick;
            if let Some(slot) = inner.tables.get_mut(&number) {
                slot.last_used = tick;
                return Ok(Arc::clone(&slot.table));
            }
        }
        let table = Arc::new(Table::open(Arc::clone(&self.store), number)?);
        let mut inner = self.inner.lock();
        if inner.tables.len() >= self.capacity {
            let oldest = inner
                .tables
                .iter()
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(number, _)| *number);
            if let Some(oldest) = oldest {
                inner.tables.remove(&oldest);
            }
        }
        let tick = inner.tick;
        inner.tables.insert(
            number,
            Slot {
                table: Arc::clone(&table),
                last_used: tick,
            },
        );
        Ok(table)
    }

    pub fn get(
        &self,
        number: FileNumber,
        lookup: &InternalKey,
    ) -> Result<Option<(InternalKey, ValueRecord)>> {
        self.table(number)?.get(lookup)
    }

    pub fn iter(&self, number: FileNumber) -> Result<TableIterator> {
        Ok(self.table(number)?.iter())
    }

    /// Drop a deleted table.
    pub fn evict(&self, number: FileNumber) {
        self.inner.lock().tables.remove(&number);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().tables.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sstable::TableBuilder;
    use crate::types::ValueKind;
    use crate::zoned::MemoryZonedDevice;

    #[test]
    fn test_cache_evicts_least_recently_used() {
        let device = MemoryZonedDevice::new(64 * 1024, 16);
        let store = Arc::new(ZonedStore::open(Arc::new(device)).unwrap());
        for number in 1..=3 {
            let mut builder = TableBuilder::create(store.clone(), number, 4096, 10).unwrap();
            builder
                .add(
                    &InternalKey::new(format!("k{}", number).into_bytes(), number, ValueKind::Put),
                    &ValueRecord::Inline(b"v".to_vec()),
                )
                .unwrap();
            builder.finish().unwrap();
        }
        let cache = TableCache::new(store, 2);
        cache.table(1).unwrap();
        cache.table(2).unwrap();
        cache.table(1).unwrap();
        cache.table(3).unwrap();
        assert_eq!(cache.len(), 2);
        let inner = cache.inner.lock();
        assert!(inner.tables.contains_key(&1));
        assert!(!inner.tables.contains_key(&2));
        drop(inner);

        let found = cache.get(3, &InternalKey::lookup(b"k3", 10)).unwrap();
        assert!(found.is_some());
        cache.evict(3);
        assert_eq!(cache.len(), 1);
    }
}
