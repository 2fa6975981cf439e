//! Redundant superblock copies.
//!
//! Each copy zone is a log of framed snapshots:
//!
//! ```text
//! [magic: u64][sequence: u64][len: u32][crc32: u32][bincode snapshot: len bytes]
//! ```
//!
//! A new snapshot is appended to every copy. A copy zone that runs out of room
//! is reset and rewritten on its own, so the other copies always hold the
//! previous snapshot while it happens. Loading takes the valid record with the
//! highest sequence across all copies.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use super::device::{ZoneId, ZonedDevice};
use super::{Extent, FileId};
use crate::error::{Error, Result};
use crate::types::FileNumber;

/// Number of zones reserved for superblock copies, starting at zone 0.
pub const SUPERBLOCK_COPIES: u32 = 3;

const MAGIC: u64 = 0x7a6f_6e65_6b76_5342;
const HEADER_SIZE: usize = 8 + 8 + 4 + 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FileRecord {
    pub id: FileId,
    pub extents: Vec<Extent>,
}

/// Everything the store needs to rebuild its file table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Snapshot {
    pub files: Vec<FileRecord>,
    pub current: Option<FileNumber>,
    /// `(zone, file)` pairs whose last extent may have grown past the snapshot.
    pub open_tails: Vec<(ZoneId, FileId)>,
}

pub(crate) struct Superblocks {
    sequence: u64,
    good: Vec<bool>,
}

impl Superblocks {
    /// Read every copy. Returns `None` as the snapshot when no copy holds a
    /// valid record, which is the case for a freshly formatted device.
    pub fn load(device: &dyn ZonedDevice) -> Result<(Self, Option<Snapshot>)> {
        let mut best: Option<(u64, Snapshot)> = None;
        let mut latest = vec![None; SUPERBLOCK_COPIES as usize];

        for copy in 0..SUPERBLOCK_COPIES {
            let data = match read_zone(device, copy) {
                Ok(data) => data,
                Err(err) => {
                    log::warn!("Cannot read superblock copy {}: {}", copy, err);
                    continue;
                }
            };
            let mut cursor = &data[..];
            while let Some((sequence, payload)) = next_record(&mut cursor) {
                let snapshot: Snapshot = match bincode::deserialize(payload) {
                    Ok(snapshot) => snapshot,
                    Err(_) => break,
                };
                latest[copy as usize] = Some(sequence);
                if best.as_ref().map_or(true, |(seq, _)| sequence > *seq) {
                    best = Some((sequence, snapshot));
                }
            }
        }

        let sequence = best.as_ref().map_or(0, |(seq, _)| *seq);
        let good: Vec<bool> = latest.iter().map(|s| *s == Some(sequence)).collect();
        if best.is_some() {
            let count = good.iter().filter(|g| **g).count();
            if count < SUPERBLOCK_COPIES as usize {
                log::warn!(
                    "Only {} of {} superblock copies are current",
                    count,
                    SUPERBLOCK_COPIES
                );
            }
        }
        Ok((Self { sequence, good }, best.map(|(_, snapshot)| snapshot)))
    }

    /// Append `snapshot` to every copy.
    ///
    /// Returns `SuperblockIo` when at least one copy took the write but some did
    /// not, and `FatalCorruption` when none did.
    pub fn persist(&mut self, device: &dyn ZonedDevice, snapshot: &Snapshot) -> Result<()> {
        let payload = bincode::serialize(snapshot)?;
        self.sequence += 1;
        let mut record = Vec::with_capacity(HEADER_SIZE + payload.len());
        record.put_u64_le(MAGIC);
        record.put_u64_le(self.sequence);
        record.put_u32_le(payload.len() as u32);
        record.put_u32_le(crc32fast::hash(&payload));
        record.put_slice(&payload);

        let mut last_error = None;
        for copy in 0..SUPERBLOCK_COPIES {
            let index = copy as usize;
            let result = if self.good[index] {
                match device.append(copy, &record) {
                    Err(err) if err.is_no_space() => rewrite(device, copy, &record),
                    other => other.map(|_| ()),
                }
            } else {
                rewrite(device, copy, &record)
            };
            match result {
                Ok(()) => {
                    if !self.good[index] {
                        log::info!("Superblock copy {} is good again", copy);
                    }
                    self.good[index] = true;
                }
                Err(err) => {
                    if self.good[index] {
                        log::warn!("Superblock copy {} failed: {}", copy, err);
                    }
                    self.good[index] = false;
                    last_error = Some(err);
                }
            }
        }

        let good = self.good_count();
        if good == 0 {
            return Err(Error::FatalCorruption(format!(
                "no superblock copy accepted snapshot {}: {}",
                self.sequence,
                last_error.map_or_else(String::new, |e| e.to_string())
            )));
        }
        if good < SUPERBLOCK_COPIES as usize {
            return Err(Error::SuperblockIo(format!(
                "{} of {} superblock copies are good",
                good, SUPERBLOCK_COPIES
            )));
        }
        Ok(())
    }

    pub fn good_count(&self) -> usize {
        self.good.iter().filter(|g| **g).count()
    }
}

fn rewrite(device: &dyn ZonedDevice, copy: ZoneId, record: &[u8]) -> Result<()> {
    device.reset_write_pointer(copy)?;
    device.append(copy, record)?;
    Ok(())
}

fn read_zone(device: &dyn ZonedDevice, zone: ZoneId) -> Result<Vec<u8>> {
    let report = device.report_zones(super::device::ZoneFilter::All)?;
    let write_pointer = report
        .iter()
        .find(|info| info.id == zone)
        .map_or(0, |info| info.write_pointer);
    let mut data = vec![0u8; write_pointer as usize];
    device.read(zone, 0, &mut data)?;
    Ok(data)
}

/// Decode the next framed record, or `None` at the end of the valid prefix.
fn next_record<'a>(cursor: &mut &'a [u8]) -> Option<(u64, &'a [u8])> {
    if cursor.len() < HEADER_SIZE {
        return None;
    }
    let mut header = &cursor[..HEADER_SIZE];
    if header.get_u64_le() != MAGIC {
        return None;
    }
    let sequence = header.get_u64_le();
    let len = header.get_u32_le() as usize;
    let crc = header.get_u32_le();
    if cursor.len() < HEADER_SIZE + len {
        return None;
    }
    let payload = &cursor[HEADER_SIZE..HEADER_SIZE + len];
    if crc32fast::hash(payload) != crc {
        return None;
    }
    *cursor = &cursor[HEADER_SIZE + len..];
    Some((sequence, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zoned::memory::MemoryZonedDevice;
    use crate::zoned::FileKind;

    fn snapshot(current: u64) -> Snapshot {
        Snapshot {
            files: vec![FileRecord {
                id: FileId::new(FileKind::Table, 7),
                extents: vec![Extent {
                    zone: 5,
                    offset: 0,
                    length: 100,
                }],
            }],
            current: Some(current),
            open_tails: vec![],
        }
    }

    #[test]
    fn test_fresh_device_has_no_snapshot() {
        let device = MemoryZonedDevice::new(4096, 8);
        let (blocks, snapshot) = Superblocks::load(&device).unwrap();
        assert!(snapshot.is_none());
        assert_eq!(blocks.good_count(), 0);
    }

    #[test]
    fn test_latest_snapshot_wins() {
        let device = MemoryZonedDevice::new(4096, 8);
        let (mut blocks, _) = Superblocks::load(&device).unwrap();
        blocks.persist(&device, &snapshot(1)).unwrap();
        blocks.persist(&device, &snapshot(2)).unwrap();
        let (blocks, loaded) = Superblocks::load(&device).unwrap();
        assert_eq!(loaded.unwrap().current, Some(2));
        assert_eq!(blocks.good_count(), SUPERBLOCK_COPIES as usize);
    }

    #[test]
    fn test_full_copy_is_rewritten() {
        let device = MemoryZonedDevice::new(512, 8);
        let (mut blocks, _) = Superblocks::load(&device).unwrap();
        for current in 0..20 {
            blocks.persist(&device, &snapshot(current)).unwrap();
        }
        let (_, loaded) = Superblocks::load(&device).unwrap();
        assert_eq!(loaded.unwrap().current, Some(19));
    }

    #[test]
    fn test_degraded_and_fatal() {
        let device = MemoryZonedDevice::new(4096, 8);
        let (mut blocks, _) = Superblocks::load(&device).unwrap();
        device.fail_zone(0, true);
        assert!(matches!(
            blocks.persist(&device, &snapshot(1)),
            Err(Error::SuperblockIo(_))
        ));
        assert_eq!(blocks.good_count(), 2);
        device.fail_zone(1, true);
        device.fail_zone(2, true);
        assert!(matches!(
            blocks.persist(&device, &snapshot(2)),
            Err(Error::FatalCorruption(_))
        ));
        device.fail_zone(0, false);
        assert!(matches!(
            blocks.persist(&device, &snapshot(3)),
            Err(Error::SuperblockIo(_))
        ));
        assert_eq!(blocks.good_count(), 1);
    }

    #[test]
    fn test_torn_record_is_ignored() {
        let device = MemoryZonedDevice::new(4096, 8);
        let (mut blocks, _) = Superblocks::load(&device).unwrap();
        blocks.persist(&device, &snapshot(1)).unwrap();
        for copy in 0..SUPERBLOCK_COPIES {
            device.append(copy, &MAGIC.to_le_bytes()).unwrap();
        }
        let (_, loaded) = Superblocks::load(&device).unwrap();
        assert_eq!(loaded.unwrap().current, Some(1));
    }
}
