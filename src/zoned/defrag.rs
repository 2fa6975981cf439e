//! Table zone defragmentation.
//!
//! Copy-forward then reset: the live extents of a fragmented zone are copied to
//! other zones, every affected file's extent list is swapped and the superblock
//! persisted, and only then is the source zone reset. A crash at any point
//! before the persist leaves the original extents in place.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::MutexGuard;

use super::device::ZoneId;
use super::store::{Meta, ZoneOwner, ZonedStore};
use super::{Extent, FileId, ZoneClass};
use crate::error::{Error, Result};

/// Zones moved per pass at most.
const MAX_ZONES_PER_PASS: usize = 2;

impl ZonedStore {
    /// Reclaim the least-live fragmented table zones.
    ///
    /// Returns the number of zones reset, `NotAttempted` when fewer than two
    /// zones are fragmented, and `Corruption` when fewer than two superblock
    /// copies are good.
    pub fn defragment(&self, live_ratio: f64, shutdown: &AtomicBool) -> Result<usize> {
        if self.good_superblocks() < 2 {
            return Err(Error::Corruption(
                "refusing to defragment with fewer than two good superblocks".into(),
            ));
        }
        let candidates = self.fragmented_table_zones(live_ratio);
        if candidates.len() < 2 {
            return Err(Error::NotAttempted(format!(
                "{} fragmented zone(s)",
                candidates.len()
            )));
        }

        let mut reclaimed = 0;
        for zone in candidates.into_iter().take(MAX_ZONES_PER_PASS) {
            if shutdown.load(Ordering::Acquire) {
                log::info!("Defragmentation interrupted by shutdown");
                break;
            }
            if self.defragment_zone(zone)? {
                reclaimed += 1;
            }
        }
        log::info!("Defragmentation reclaimed {} zone(s)", reclaimed);
        Ok(reclaimed)
    }

    fn defragment_zone(&self, zone: ZoneId) -> Result<bool> {
        let mut meta = self.meta.lock();
        {
            let state = &meta.zones[zone as usize];
            if state.owner.is_some() || state.defragging || state.class != Some(ZoneClass::Table) {
                return Ok(false);
            }
        }
        meta.zones[zone as usize].defragging = true;

        let moving: Vec<(FileId, Extent)> = meta
            .files
            .iter()
            .flat_map(|(id, entry)| {
                entry
                    .extents
                    .iter()
                    .filter(|e| e.zone == zone)
                    .map(move |e| (*id, *e))
            })
            .collect();
        log::debug!("Defragmenting zone {}: {} extent(s)", zone, moving.len());

        let mut target: Option<ZoneId> = None;
        let mut moved: Vec<(FileId, Extent, Vec<Extent>)> = Vec::with_capacity(moving.len());
        let copied = self.copy_extents(&mut meta, &moving, &mut target, &mut moved);
        if let Some(target) = target {
            meta.zones[target as usize].owner = None;
            if let Err(err) = self.device.close_zone(target) {
                log::warn!("Closing zone {} after defragmentation failed: {}", target, err);
            }
        }
        if let Err(err) = copied {
            meta.zones[zone as usize].defragging = false;
            self.changed.notify_all();
            if let Some(target) = target {
                self.reclaim_zone(&mut meta, target)?;
            }
            log::warn!("Defragmentation of zone {} abandoned: {}", zone, err);
            return Err(err);
        }

        let meta_ref = &mut *meta;
        for (id, old, replacement) in moved {
            let Some(entry) = meta_ref.files.get_mut(&id) else {
                continue;
            };
            let Some(index) = entry.extents.iter().position(|e| *e == old) else {
                continue;
            };
            for extent in &replacement {
                meta_ref.zones[extent.zone as usize].live += extent.length;
            }
            meta_ref.zones[zone as usize].live =
                meta_ref.zones[zone as usize].live.saturating_sub(old.length);
            entry.extents.splice(index..index + 1, replacement);
        }
        let persisted = self.persist(&mut meta);
        meta.zones[zone as usize].defragging = false;
        self.changed.notify_all();
        persisted?;
        self.reclaim_zone(&mut meta, zone)?;
        Ok(meta.zones[zone as usize].write_pointer == 0)
    }

    /// Copy every extent in `moving` to zones owned by the defragmenter.
    fn copy_extents(
        &self,
        meta: &mut MutexGuard<'_, Meta>,
        moving: &[(FileId, Extent)],
        target: &mut Option<ZoneId>,
        moved: &mut Vec<(FileId, Extent, Vec<Extent>)>,
    ) -> Result<()> {
        for (id, extent) in moving {
            let mut data = vec![0u8; extent.length as usize];
            MutexGuard::unlocked(meta, || self.device.read(extent.zone, extent.offset, &mut data))?;

            let mut replacement: Vec<Extent> = Vec::new();
            let mut written = 0usize;
            while written < data.len() {
                let zone = match *target {
                    Some(zone) if meta.zones[zone as usize].write_pointer < self.zone_size => zone,
                    _ => {
                        if let Some(full) = target.take() {
                            meta.zones[full as usize].owner = None;
                            self.device.close_zone(full)?;
                        }
                        let zone = self.pick_zone(meta, ZoneClass::Table).ok_or_else(|| {
                            Error::NoSpaceAvailable("no zone to defragment into".into())
                        })?;
                        self.device.open_zone(zone)?;
                        let state = &mut meta.zones[zone as usize];
                        state.owner = Some(ZoneOwner::Defrag);
                        state.class = Some(ZoneClass::Table);
                        *target = Some(zone);
                        zone
                    }
                };
                let room = self.zone_size - meta.zones[zone as usize].write_pointer;
                let len = (data.len() - written).min(room as usize);
                let chunk = &data[written..written + len];
                let offset = MutexGuard::unlocked(meta, || self.device.append(zone, chunk))?;
                meta.zones[zone as usize].write_pointer = offset + len as u64;
                match replacement.last_mut() {
                    Some(last) if last.zone == zone && last.end() == offset => {
                        last.length += len as u64;
                    }
                    _ => replacement.push(Extent {
                        zone,
                        offset,
                        length: len as u64,
                    }),
                }
                written += len;
            }
            moved.push((*id, *extent, replacement));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zoned::memory::MemoryZonedDevice;
    use crate::zoned::superblock::SUPERBLOCK_COPIES;
    use std::collections::HashMap;
    use std::sync::Arc;

    const ZONE: u64 = 1024;

    fn live_by_zone(store: &ZonedStore) -> HashMap<ZoneId, u64> {
        let meta = store.meta.lock();
        meta.zones
            .iter()
            .enumerate()
            .filter(|(_, z)| z.live > 0)
            .map(|(zone, z)| (zone as ZoneId, z.live))
            .collect()
    }

    fn fragmented_store() -> (MemoryZonedDevice, ZonedStore, Vec<FileId>) {
        let device = MemoryZonedDevice::new(ZONE, 16);
        let store = ZonedStore::open(Arc::new(device.clone())).unwrap();
        let mut keep = Vec::new();
        // Fill four zones with 256-byte tables, then drop three of every four.
        for number in 0..16u64 {
            let id = FileId::table(number);
            store.allocate(id).unwrap();
            store.append(id, &vec![number as u8; 256]).unwrap();
            store.close(id).unwrap();
            if number % 4 == 0 {
                keep.push(id);
            }
        }
        for number in 0..16u64 {
            if number % 4 != 0 {
                store.delete(FileId::table(number)).unwrap();
            }
        }
        (device, store, keep)
    }

    #[test]
    fn test_not_attempted_without_fragmentation() {
        let device = MemoryZonedDevice::new(ZONE, 8);
        let store = ZonedStore::open(Arc::new(device)).unwrap();
        let shutdown = AtomicBool::new(false);
        assert!(store.defragment(0.5, &shutdown).unwrap_err().is_not_attempted());
    }

    #[test]
    fn test_defragment_preserves_data_and_frees_zones() {
        let (_, store, keep) = fragmented_store();
        let before = store.capacity();
        assert_eq!(store.fragmented_table_zones(0.5).len(), 4);
        let shutdown = AtomicBool::new(false);

        let reclaimed = store.defragment(0.5, &shutdown).unwrap();
        assert_eq!(reclaimed, 2);
        let after = store.capacity();
        assert!(after.used_zones <= before.used_zones);
        assert_eq!(after.used, before.used);
        for id in &keep {
            assert_eq!(store.read_all(*id).unwrap(), vec![id.number as u8; 256]);
        }
        let live: u64 = live_by_zone(&store).values().sum();
        assert_eq!(live, 4 * 256);
    }

    #[test]
    fn test_defragmentation_survives_reopen() {
        let (device, store, keep) = fragmented_store();
        let shutdown = AtomicBool::new(false);
        store.defragment(0.5, &shutdown).unwrap();
        drop(store);
        let store = ZonedStore::open(Arc::new(device)).unwrap();
        for id in &keep {
            assert_eq!(store.read_all(*id).unwrap(), vec![id.number as u8; 256]);
        }
    }

    #[test]
    fn test_shutdown_stops_between_zones() {
        let (_, store, _) = fragmented_store();
        let shutdown = AtomicBool::new(true);
        assert_eq!(store.defragment(0.5, &shutdown).unwrap(), 0);
    }

    #[test]
    fn test_interrupted_move_does_not_grow_closed_file() {
        let (device, store, _) = fragmented_store();
        let small = FileId::table(100);
        store.allocate(small).unwrap();
        store.append(small, &[9u8; 100]).unwrap();
        store.close(small).unwrap();

        // The move copies into the zone `small` left open for packing, then
        // cannot record the new extents.
        for copy in 0..SUPERBLOCK_COPIES {
            device.fail_zone(copy, true);
        }
        let shutdown = AtomicBool::new(false);
        assert!(store.defragment(0.5, &shutdown).is_err());
        for copy in 0..SUPERBLOCK_COPIES {
            device.fail_zone(copy, false);
        }
        drop(store);

        let store = ZonedStore::open(Arc::new(device)).unwrap();
        assert_eq!(store.read_all(small).unwrap(), vec![9u8; 100]);
    }

    #[test]
    fn test_refuses_with_degraded_superblocks() {
        let (device, store, _) = fragmented_store();
        device.fail_zone(0, true);
        device.fail_zone(1, true);
        store.set_current(1).unwrap();
        let shutdown = AtomicBool::new(false);
        assert!(matches!(
            store.defragment(0.5, &shutdown),
            Err(Error::Corruption(_))
        ));
    }
}
