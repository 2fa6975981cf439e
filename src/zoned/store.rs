//! zonekv - Zoned Store
//! A small file system over a zoned device.
//!
//! ## Crash safety
//! The file table lives in the superblock and is persisted on every structural
//! change: a file taking a new zone, a delete, a defragmentation move, and a
//! CURRENT update. Appends inside a zone the file already owns are not persisted.
//! Instead the snapshot lists each zone's current writer, and on load that
//! writer's last extent is extended to the zone's write pointer. Bytes past a
//! torn record are discarded by the format readers above.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::device::{ZoneFilter, ZoneId, ZonedDevice};
use super::superblock::{FileRecord, Snapshot, Superblocks, SUPERBLOCK_COPIES};
use super::{Extent, FileId, FileKind, ZoneClass};
use crate::error::{Error, Result};
use crate::types::FileNumber;

/// Who currently appends to a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ZoneOwner {
    File(FileId),
    Defrag,
}

#[derive(Debug, Default)]
pub(super) struct ZoneState {
    pub class: Option<ZoneClass>,
    pub owner: Option<ZoneOwner>,
    pub write_pointer: u64,
    /// Bytes of this zone referenced by some file extent.
    pub live: u64,
    /// Readers currently copying out of this zone.
    pub pins: usize,
    pub defragging: bool,
}

#[derive(Debug, Default)]
pub(super) struct FileEntry {
    pub extents: Vec<Extent>,
    pub size: u64,
    pub writer: Option<ZoneId>,
}

pub(super) struct Meta {
    pub files: BTreeMap<FileId, FileEntry>,
    pub zones: Vec<ZoneState>,
    pub current: Option<FileNumber>,
    pub superblocks: Superblocks,
    pub degraded: Option<Error>,
    pub fatal: Option<Error>,
}

impl Meta {
    fn file(&self, id: FileId) -> Result<&FileEntry> {
        self.files
            .get(&id)
            .ok_or_else(|| Error::InvalidArgument(format!("no such file {:?}", id)))
    }

    fn file_mut(&mut self, id: FileId) -> Result<&mut FileEntry> {
        self.files
            .get_mut(&id)
            .ok_or_else(|| Error::InvalidArgument(format!("no such file {:?}", id)))
    }

    fn check_fatal(&self) -> Result<()> {
        match &self.fatal {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            files: self
                .files
                .iter()
                .map(|(id, entry)| FileRecord {
                    id: *id,
                    extents: entry.extents.clone(),
                })
                .collect(),
            current: self.current,
            open_tails: self
                .zones
                .iter()
                .enumerate()
                .filter_map(|(zone, state)| match state.owner {
                    Some(ZoneOwner::File(id)) => Some((zone as ZoneId, id)),
                    _ => None,
                })
                .collect(),
        }
    }

    fn is_data_zone(zone: ZoneId) -> bool {
        zone >= SUPERBLOCK_COPIES
    }
}

/// Space accounting over the data zones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub total: u64,
    pub used: u64,
    pub free_zones: u32,
    pub used_zones: u32,
}

pub struct ZonedStore {
    pub(super) device: Arc<dyn ZonedDevice>,
    pub(super) zone_size: u64,
    pub(super) meta: Mutex<Meta>,
    pub(super) changed: Condvar,
}

impl ZonedStore {
    /// Load the file table from the superblock, or format a fresh device.
    pub fn open(device: Arc<dyn ZonedDevice>) -> Result<Self> {
        let zone_count = device.zone_count();
        if zone_count <= SUPERBLOCK_COPIES + 1 {
            return Err(Error::InvalidArgument(format!(
                "device with {} zones is too small",
                zone_count
            )));
        }
        let zone_size = device.zone_size();
        let (superblocks, snapshot) = Superblocks::load(device.as_ref())?;

        let mut zones: Vec<ZoneState> = (0..zone_count).map(|_| ZoneState::default()).collect();
        for info in device.report_zones(ZoneFilter::All)? {
            if let Some(state) = zones.get_mut(info.id as usize) {
                state.write_pointer = info.write_pointer;
            }
        }

        let fresh = snapshot.is_none();
        if fresh
            && zones
                .iter()
                .enumerate()
                .any(|(zone, state)| Meta::is_data_zone(zone as ZoneId) && state.write_pointer > 0)
        {
            return Err(Error::FatalCorruption(
                "device holds data but no valid superblock".into(),
            ));
        }
        let snapshot = snapshot.unwrap_or_default();

        let mut files: BTreeMap<FileId, FileEntry> = snapshot
            .files
            .into_iter()
            .map(|record| {
                let entry = FileEntry {
                    size: record.extents.iter().map(|e| e.length).sum(),
                    extents: record.extents,
                    writer: None,
                };
                (record.id, entry)
            })
            .collect();

        // Recover appends that landed after the last snapshot.
        for (zone, id) in &snapshot.open_tails {
            let zone_end = zones
                .get(*zone as usize)
                .map_or(0, |state| state.write_pointer);
            let highest = files
                .values()
                .flat_map(|entry| entry.extents.iter())
                .filter(|e| e.zone == *zone)
                .map(|e| e.end())
                .max()
                .unwrap_or(0);
            if let Some(entry) = files.get_mut(id) {
                let tail = entry.extents.iter().rposition(|e| e.zone == *zone);
                if let Some(index) = tail {
                    let last = &mut entry.extents[index];
                    if last.end() == highest && zone_end > last.end() {
                        let grown = zone_end - last.end();
                        last.length += grown;
                        entry.size += grown;
                        log::debug!("Recovered {} unsynced bytes of {:?}", grown, id);
                    }
                }
            }
        }
        for entry in files.values_mut() {
            entry.extents.retain(|e| e.length > 0);
        }

        for (id, entry) in &files {
            for extent in &entry.extents {
                let state = &mut zones[extent.zone as usize];
                state.live += extent.length;
                state.class = Some(id.kind.class());
            }
        }

        let mut meta = Meta {
            files,
            zones,
            current: snapshot.current,
            superblocks,
            degraded: None,
            fatal: None,
        };

        // Zones nothing points at only hold torn or deleted data.
        for zone in SUPERBLOCK_COPIES..zone_count {
            let state = &mut meta.zones[zone as usize];
            if state.live == 0 && state.write_pointer > 0 {
                device.reset_write_pointer(zone)?;
                state.write_pointer = 0;
                state.class = None;
            }
        }

        let store = Self {
            device,
            zone_size,
            meta: Mutex::new(meta),
            changed: Condvar::new(),
        };
        {
            let mut meta = store.meta.lock();
            if fresh {
                log::info!(
                    "Formatting zoned store: {} zones of {} bytes",
                    zone_count,
                    zone_size
                );
            }
            store.persist(&mut meta)?;
            log::info!(
                "Zoned store opened: {} files, {} good superblocks",
                meta.files.len(),
                meta.superblocks.good_count()
            );
        }
        Ok(store)
    }

    /// Write the file table to every superblock copy. A degraded superblock is
    /// remembered and reported through [`ZonedStore::superblock_status`].
    pub(super) fn persist(&self, meta: &mut Meta) -> Result<()> {
        meta.check_fatal()?;
        let snapshot = meta.snapshot();
        match meta.superblocks.persist(self.device.as_ref(), &snapshot) {
            Ok(()) => {
                meta.degraded = None;
                Ok(())
            }
            Err(err @ Error::SuperblockIo(_)) => {
                meta.degraded = Some(err);
                Ok(())
            }
            Err(err) => {
                log::error!("Zoned store lost every superblock copy: {}", err);
                meta.fatal = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Register a new empty file.
    pub fn allocate(&self, id: FileId) -> Result<()> {
        let mut meta = self.meta.lock();
        meta.check_fatal()?;
        if meta.files.contains_key(&id) {
            return Err(Error::InvalidArgument(format!("file {:?} already exists", id)));
        }
        meta.files.insert(id, FileEntry::default());
        Ok(())
    }

    pub fn exists(&self, id: FileId) -> bool {
        self.meta.lock().files.contains_key(&id)
    }

    /// Append `data` to the end of the file and return the file offset it starts at.
    pub fn append(&self, id: FileId, data: &[u8]) -> Result<u64> {
        let mut meta = self.meta.lock();
        meta.check_fatal()?;
        let start = meta.file(id)?.size;
        let mut written = 0usize;
        while written < data.len() {
            // Defragmentation of any zone the file lives in blocks the append.
            while meta
                .file(id)?
                .extents
                .iter()
                .any(|e| meta.zones[e.zone as usize].defragging)
            {
                self.changed.wait(&mut meta);
            }

            let zone = self.writer_zone(&mut meta, id)?;
            let room = self.zone_size - meta.zones[zone as usize].write_pointer;
            if id.kind == FileKind::Value && (data.len() - written) as u64 > room {
                return Err(Error::NoSpaceAvailable(format!(
                    "{} bytes do not fit in value file {:?}",
                    data.len() - written,
                    id
                )));
            }
            let len = (data.len() - written).min(room as usize);
            let chunk = &data[written..written + len];
            let offset = MutexGuard::unlocked(&mut meta, || self.device.append(zone, chunk))?;

            let zone_size = self.zone_size;
            let meta = &mut *meta;
            let state = &mut meta.zones[zone as usize];
            state.write_pointer = offset + len as u64;
            state.live += len as u64;
            let full = state.write_pointer >= zone_size;
            if full {
                state.owner = None;
            }
            let entry = meta.file_mut(id)?;
            match entry.extents.last_mut() {
                Some(last) if last.zone == zone && last.end() == offset => last.length += len as u64,
                _ => entry.extents.push(Extent {
                    zone,
                    offset,
                    length: len as u64,
                }),
            }
            entry.size += len as u64;
            if full {
                entry.writer = None;
            }
            written += len;
        }
        Ok(start)
    }

    /// Zone the file currently appends to, taking a new one if needed.
    fn writer_zone(&self, meta: &mut MutexGuard<'_, Meta>, id: FileId) -> Result<ZoneId> {
        let entry = meta.file(id)?;
        if let Some(zone) = entry.writer {
            if meta.zones[zone as usize].write_pointer < self.zone_size {
                return Ok(zone);
            }
        }
        let class = id.kind.class();
        if class == ZoneClass::Value && !entry.extents.is_empty() {
            return Err(Error::NoSpaceAvailable(format!(
                "value file {:?} filled its zone",
                id
            )));
        }
        let zone = self.pick_zone(meta, class).ok_or_else(|| {
            Error::NoSpaceAvailable(format!("no zone available for {:?}", id))
        })?;
        self.device.open_zone(zone)?;
        let write_pointer = meta.zones[zone as usize].write_pointer;
        {
            let state = &mut meta.zones[zone as usize];
            state.owner = Some(ZoneOwner::File(id));
            state.class = Some(class);
        }
        let entry = meta.file_mut(id)?;
        entry.writer = Some(zone);
        entry.extents.push(Extent {
            zone,
            offset: write_pointer,
            length: 0,
        });
        log::debug!("{:?} takes zone {} at {}", id, zone, write_pointer);
        self.persist(meta)?;
        Ok(zone)
    }

    /// Prefer a partly written zone of the same class, then an empty zone.
    pub(super) fn pick_zone(&self, meta: &Meta, class: ZoneClass) -> Option<ZoneId> {
        let usable = |state: &ZoneState| {
            state.owner.is_none() && !state.defragging && state.write_pointer < self.zone_size
        };
        let shared = if class == ZoneClass::Value {
            None
        } else {
            meta.zones
                .iter()
                .enumerate()
                .skip(SUPERBLOCK_COPIES as usize)
                .find(|(_, state)| state.class == Some(class) && usable(state))
                .map(|(zone, _)| zone as ZoneId)
        };
        shared.or_else(|| {
            meta.zones
                .iter()
                .enumerate()
                .skip(SUPERBLOCK_COPIES as usize)
                .find(|(_, state)| state.class.is_none() && state.write_pointer == 0 && usable(state))
                .map(|(zone, _)| zone as ZoneId)
        })
    }

    /// Make every completed append durable.
    pub fn sync(&self, id: FileId) -> Result<()> {
        {
            let meta = self.meta.lock();
            meta.check_fatal()?;
            meta.file(id)?;
        }
        self.device.sync()
    }

    /// Give up the file's writer zone so other files can pack into it.
    ///
    /// The release is persisted: a superblock still naming the file as the
    /// zone's writer would let recovery extend the file over bytes others
    /// append there later.
    pub fn close(&self, id: FileId) -> Result<()> {
        let mut meta = self.meta.lock();
        let zone = match meta.files.get_mut(&id) {
            Some(entry) => entry.writer.take(),
            None => None,
        };
        let Some(zone) = zone else {
            return Ok(());
        };
        meta.zones[zone as usize].owner = None;
        self.persist(&mut meta)?;
        self.device.close_zone(zone)
    }

    /// Close the file for good and finish its writer zone, so nothing is
    /// appended there again. Meant for value files, which own their zone.
    pub fn finish(&self, id: FileId) -> Result<()> {
        let mut meta = self.meta.lock();
        meta.check_fatal()?;
        let Some(zone) = meta.file(id)?.writer else {
            return Ok(());
        };
        self.device.finish_zone(zone)?;
        {
            let state = &mut meta.zones[zone as usize];
            state.owner = None;
            state.write_pointer = self.zone_size;
        }
        meta.file_mut(id)?.writer = None;
        log::debug!("Finished zone {} of {:?}", zone, id);
        self.persist(&mut meta)
    }

    /// Close every zone the device still reports open. Called on shutdown.
    pub fn close_zones(&self) -> Result<()> {
        let _meta = self.meta.lock();
        for info in self.device.report_zones(ZoneFilter::Open)? {
            self.device.close_zone(info.id)?;
        }
        Ok(())
    }

    /// Remove the file. Zones left without live data are reset.
    pub fn delete(&self, id: FileId) -> Result<()> {
        let mut meta = self.meta.lock();
        meta.check_fatal()?;
        let entry = meta
            .files
            .remove(&id)
            .ok_or_else(|| Error::InvalidArgument(format!("no such file {:?}", id)))?;
        if let Some(zone) = entry.writer {
            meta.zones[zone as usize].owner = None;
            self.device.close_zone(zone)?;
        }
        let mut touched = HashSet::new();
        for extent in &entry.extents {
            let state = &mut meta.zones[extent.zone as usize];
            state.live = state.live.saturating_sub(extent.length);
            touched.insert(extent.zone);
        }
        self.persist(&mut meta)?;
        for zone in touched {
            self.reclaim_zone(&mut meta, zone)?;
        }
        log::debug!("Deleted {:?}", id);
        Ok(())
    }

    /// Reset `zone` if nothing references or writes it, once readers drain.
    pub(super) fn reclaim_zone(&self, meta: &mut MutexGuard<'_, Meta>, zone: ZoneId) -> Result<()> {
        loop {
            let state = &meta.zones[zone as usize];
            if !Meta::is_data_zone(zone)
                || state.live > 0
                || state.owner.is_some()
                || state.defragging
                || state.write_pointer == 0
            {
                return Ok(());
            }
            if state.pins > 0 {
                self.changed.wait(meta);
                continue;
            }
            self.device.reset_write_pointer(zone)?;
            let state = &mut meta.zones[zone as usize];
            state.write_pointer = 0;
            state.class = None;
            log::debug!("Reset zone {}", zone);
            self.changed.notify_all();
            return Ok(());
        }
    }

    /// Read `buf.len()` bytes at file offset `offset`.
    pub fn read(&self, id: FileId, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut meta = self.meta.lock();
        let entry = meta.file(id)?;
        if offset + buf.len() as u64 > entry.size {
            return Err(Error::InvalidArgument(format!(
                "read of {} bytes at {} beyond end of {:?} ({} bytes)",
                buf.len(),
                offset,
                id,
                entry.size
            )));
        }
        let mut segments = Vec::new();
        let mut skip = offset;
        let mut wanted = buf.len() as u64;
        for extent in &entry.extents {
            if wanted == 0 {
                break;
            }
            if skip >= extent.length {
                skip -= extent.length;
                continue;
            }
            let len = (extent.length - skip).min(wanted);
            segments.push((extent.zone, extent.offset + skip, len as usize));
            wanted -= len;
            skip = 0;
        }
        for (zone, _, _) in &segments {
            meta.zones[*zone as usize].pins += 1;
        }
        let result = MutexGuard::unlocked(&mut meta, || {
            let mut pos = 0;
            for (zone, zone_offset, len) in &segments {
                self.device
                    .read(*zone, *zone_offset, &mut buf[pos..pos + *len])?;
                pos += *len;
            }
            Ok(())
        });
        for (zone, _, _) in &segments {
            meta.zones[*zone as usize].pins -= 1;
        }
        self.changed.notify_all();
        result
    }

    pub fn read_all(&self, id: FileId) -> Result<Vec<u8>> {
        let size = self.size(id)?;
        let mut buf = vec![0u8; size as usize];
        self.read(id, 0, &mut buf)?;
        Ok(buf)
    }

    pub fn size(&self, id: FileId) -> Result<u64> {
        Ok(self.meta.lock().file(id)?.size)
    }

    /// Bytes the file can still append without taking a new zone.
    pub fn space_left(&self, id: FileId) -> Result<u64> {
        let meta = self.meta.lock();
        let entry = meta.file(id)?;
        Ok(match entry.writer {
            Some(zone) => self.zone_size - meta.zones[zone as usize].write_pointer,
            None if id.kind == FileKind::Value && entry.extents.is_empty() => self.zone_size,
            None if id.kind == FileKind::Value => 0,
            None => self.zone_size,
        })
    }

    pub fn zone_size(&self) -> u64 {
        self.zone_size
    }

    pub fn list_files(&self, kind: FileKind) -> Vec<FileNumber> {
        self.meta
            .lock()
            .files
            .keys()
            .filter(|id| id.kind == kind)
            .map(|id| id.number)
            .collect()
    }

    /// Record the live manifest.
    pub fn set_current(&self, manifest: FileNumber) -> Result<()> {
        let mut meta = self.meta.lock();
        meta.current = Some(manifest);
        self.persist(&mut meta)
    }

    pub fn current(&self) -> Option<FileNumber> {
        self.meta.lock().current
    }

    pub fn capacity(&self) -> Capacity {
        let meta = self.meta.lock();
        let data_zones = &meta.zones[SUPERBLOCK_COPIES as usize..];
        let free_zones = data_zones.iter().filter(|z| z.write_pointer == 0).count() as u32;
        Capacity {
            total: data_zones.len() as u64 * self.zone_size,
            used: data_zones.iter().map(|z| z.live).sum(),
            free_zones,
            used_zones: data_zones.len() as u32 - free_zones,
        }
    }

    pub fn free_zones(&self) -> u32 {
        self.capacity().free_zones
    }

    /// True when the used fraction of data zones exceeds `ratio`.
    pub fn is_high_disk_usage(&self, ratio: f64) -> bool {
        let capacity = self.capacity();
        let zones = capacity.free_zones + capacity.used_zones;
        zones > 0 && capacity.used_zones as f64 > ratio * zones as f64
    }

    /// Idle table zones whose live fraction of written bytes is below `ratio`,
    /// least live first.
    pub fn fragmented_table_zones(&self, ratio: f64) -> Vec<ZoneId> {
        let meta = self.meta.lock();
        let mut zones: Vec<(u64, ZoneId)> = meta
            .zones
            .iter()
            .enumerate()
            .skip(SUPERBLOCK_COPIES as usize)
            .filter(|(_, z)| {
                z.class == Some(ZoneClass::Table)
                    && z.owner.is_none()
                    && !z.defragging
                    && z.write_pointer > 0
                    && (z.live as f64) < ratio * z.write_pointer as f64
            })
            .map(|(zone, z)| (z.live, zone as ZoneId))
            .collect();
        zones.sort();
        zones.into_iter().map(|(_, zone)| zone).collect()
    }

    /// Whether `bytes` of table data can be written without new free zones
    /// running out.
    pub fn has_space_for(&self, bytes: u64) -> bool {
        let meta = self.meta.lock();
        let available: u64 = meta
            .zones
            .iter()
            .skip(SUPERBLOCK_COPIES as usize)
            .filter(|z| {
                z.owner.is_none()
                    && !z.defragging
                    && (z.class.is_none() || z.class == Some(ZoneClass::Table))
            })
            .map(|z| self.zone_size - z.write_pointer.min(self.zone_size))
            .sum();
        available >= bytes
    }

    pub fn good_superblocks(&self) -> usize {
        self.meta.lock().superblocks.good_count()
    }

    /// `SuperblockIo` while some copy is degraded, `FatalCorruption` once none is left.
    pub fn superblock_status(&self) -> Result<()> {
        let meta = self.meta.lock();
        meta.check_fatal()?;
        match &meta.degraded {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// One line per non-empty data zone, for diagnostics.
    pub fn describe_zones(&self) -> String {
        let meta = self.meta.lock();
        let mut out = String::new();
        for (zone, state) in meta.zones.iter().enumerate().skip(SUPERBLOCK_COPIES as usize) {
            if state.write_pointer == 0 {
                continue;
            }
            out.push_str(&format!(
                "zone {:>4} {:<6} wp {:>10} live {:>10}{}\n",
                zone,
                match state.class {
                    Some(ZoneClass::Meta) => "meta",
                    Some(ZoneClass::Table) => "table",
                    Some(ZoneClass::Value) => "value",
                    None => "-",
                },
                state.write_pointer,
                state.live,
                if state.owner.is_some() { " (open)" } else { "" }
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zoned::device::ZoneCondition;
    use crate::zoned::memory::MemoryZonedDevice;

    fn store(zone_size: u64, zones: u32) -> (MemoryZonedDevice, ZonedStore) {
        let device = MemoryZonedDevice::new(zone_size, zones);
        let store = ZonedStore::open(Arc::new(device.clone())).unwrap();
        (device, store)
    }

    #[test]
    fn test_append_read_across_zones() {
        let (_, store) = store(1024, 10);
        let id = FileId::table(1);
        store.allocate(id).unwrap();
        let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(store.append(id, &data[..100]).unwrap(), 0);
        assert_eq!(store.append(id, &data[100..]).unwrap(), 100);
        assert_eq!(store.size(id).unwrap(), 3000);
        assert_eq!(store.read_all(id).unwrap(), data);
        let mut buf = vec![0u8; 50];
        store.read(id, 1000, &mut buf).unwrap();
        assert_eq!(&buf[..], &data[1000..1050]);
    }

    #[test]
    fn test_value_file_cannot_span_zones() {
        let (_, store) = store(1024, 10);
        let id = FileId::value(2);
        store.allocate(id).unwrap();
        store.append(id, &[1u8; 1000]).unwrap();
        assert_eq!(store.space_left(id).unwrap(), 24);
        assert!(store.append(id, &[2u8; 100]).unwrap_err().is_no_space());
        assert_eq!(store.size(id).unwrap(), 1000);
    }

    #[test]
    fn test_delete_resets_empty_zone() {
        let (_, store) = store(1024, 10);
        let before = store.free_zones();
        let id = FileId::table(3);
        store.allocate(id).unwrap();
        store.append(id, &[7u8; 2000]).unwrap();
        store.close(id).unwrap();
        assert_eq!(store.free_zones(), before - 2);
        store.delete(id).unwrap();
        assert_eq!(store.free_zones(), before);
        assert!(store.read_all(id).is_err());
    }

    #[test]
    fn test_files_pack_into_shared_zone() {
        let (_, store) = store(4096, 10);
        let a = FileId::table(1);
        let b = FileId::table(2);
        store.allocate(a).unwrap();
        store.append(a, &[1u8; 100]).unwrap();
        store.close(a).unwrap();
        store.allocate(b).unwrap();
        store.append(b, &[2u8; 100]).unwrap();
        store.close(b).unwrap();
        assert_eq!(store.capacity().used_zones, 1);
        store.delete(a).unwrap();
        assert_eq!(store.capacity().used_zones, 1);
        assert_eq!(store.read_all(b).unwrap(), vec![2u8; 100]);
    }

    #[test]
    fn test_unsynced_tail_survives_reopen() {
        let (device, store) = store(4096, 10);
        let log = FileId::log(4);
        store.set_current(9).unwrap();
        store.allocate(log).unwrap();
        store.append(log, b"first").unwrap();
        store.append(log, b"second").unwrap();
        drop(store);

        let store = ZonedStore::open(Arc::new(device)).unwrap();
        assert_eq!(store.current(), Some(9));
        assert_eq!(store.read_all(log).unwrap(), b"firstsecond".to_vec());
    }

    #[test]
    fn test_deleted_tail_is_not_resurrected() {
        let (device, store) = store(4096, 10);
        let a = FileId::table(1);
        let b = FileId::table(2);
        store.allocate(a).unwrap();
        store.append(a, &[1u8; 10]).unwrap();
        store.close(a).unwrap();
        store.allocate(b).unwrap();
        store.append(b, &[2u8; 10]).unwrap();
        store.delete(b).unwrap();
        drop(store);

        let store = ZonedStore::open(Arc::new(device)).unwrap();
        assert_eq!(store.size(a).unwrap(), 10);
        assert!(!store.exists(b));
    }

    #[test]
    fn test_degraded_superblock_is_reported() {
        let (device, store) = store(4096, 10);
        device.fail_zone(1, true);
        store.set_current(1).unwrap();
        assert!(matches!(store.superblock_status(), Err(Error::SuperblockIo(_))));
        assert_eq!(store.good_superblocks(), 2);
        device.fail_zone(1, false);
        store.set_current(2).unwrap();
        assert!(store.superblock_status().is_ok());
    }

    #[test]
    fn test_fatal_when_no_copy_left() {
        let (device, store) = store(4096, 10);
        for copy in 0..SUPERBLOCK_COPIES {
            device.fail_zone(copy, true);
        }
        assert!(matches!(store.set_current(1), Err(Error::FatalCorruption(_))));
        let id = FileId::log(1);
        assert!(matches!(store.allocate(id), Err(Error::FatalCorruption(_))));
    }

    fn condition(device: &MemoryZonedDevice, zone: ZoneId) -> ZoneCondition {
        device
            .report_zones(ZoneFilter::All)
            .unwrap()
            .into_iter()
            .find(|info| info.id == zone)
            .map(|info| info.condition)
            .unwrap()
    }

    fn first_zone(store: &ZonedStore, id: FileId) -> ZoneId {
        store.meta.lock().files[&id].extents[0].zone
    }

    #[test]
    fn test_zone_conditions_follow_writers() {
        let (device, store) = store(4096, 10);
        let table = FileId::table(1);
        store.allocate(table).unwrap();
        store.append(table, &[1u8; 100]).unwrap();
        let zone = first_zone(&store, table);
        assert_eq!(condition(&device, zone), ZoneCondition::ExplicitOpen);
        store.close(table).unwrap();
        assert_eq!(condition(&device, zone), ZoneCondition::Closed);

        let value = FileId::value(2);
        store.allocate(value).unwrap();
        store.append(value, &[2u8; 100]).unwrap();
        let zone = first_zone(&store, value);
        assert_ne!(zone, first_zone(&store, table));
        store.finish(value).unwrap();
        assert_eq!(condition(&device, zone), ZoneCondition::Full);
        assert_eq!(store.read_all(value).unwrap(), vec![2u8; 100]);
        assert!(store.append(value, &[3u8; 1]).unwrap_err().is_no_space());

        let log = FileId::log(3);
        store.allocate(log).unwrap();
        store.append(log, b"record").unwrap();
        let zone = first_zone(&store, log);
        store.close_zones().unwrap();
        assert_eq!(condition(&device, zone), ZoneCondition::Closed);
        assert!(device.report_zones(ZoneFilter::Open).unwrap().is_empty());
    }

    #[test]
    fn test_closed_writer_is_not_extended_on_reopen() {
        let (device, store) = store(4096, 10);
        let a = FileId::table(1);
        store.allocate(a).unwrap();
        store.append(a, &[1u8; 10]).unwrap();
        store.close(a).unwrap();
        let zone = first_zone(&store, a);
        // Bytes appended to the zone without any file claiming them.
        device.append(zone, &[0u8; 20]).unwrap();
        drop(store);

        let store = ZonedStore::open(Arc::new(device)).unwrap();
        assert_eq!(store.size(a).unwrap(), 10);
    }

    #[test]
    fn test_out_of_zones() {
        let (_, store) = store(1024, 6);
        let id = FileId::table(1);
        store.allocate(id).unwrap();
        store.append(id, &[0u8; 3072]).unwrap();
        assert!(store.append(id, &[0u8; 1]).unwrap_err().is_no_space());
        assert!(!store.has_space_for(1));
    }
}
