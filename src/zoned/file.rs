//! File-backed zoned device: one regular file per zone.
//!
//! A zone file's length is the zone's write pointer, so appends are plain
//! appends and a reset truncates the file. The geometry is recorded in a
//! small `GEOMETRY` file next to the zones.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::device::{ZoneCursor, ZoneFilter, ZoneId, ZoneInfo, ZonedDevice};
use crate::error::{Error, Result};

const GEOMETRY_FILE: &str = "GEOMETRY";

struct ZoneSlot {
    cursor: ZoneCursor,
    file: File,
}

pub struct FileZonedDevice {
    dir: PathBuf,
    zone_size: u64,
    zones: Vec<Mutex<ZoneSlot>>,
}

impl FileZonedDevice {
    /// Open the device under `dir`, creating it with the given geometry when
    /// `create_if_missing` is set and no device exists yet.
    pub fn open(
        dir: impl AsRef<Path>,
        zone_size: u64,
        zone_count: u32,
        create_if_missing: bool,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let geometry_path = dir.join(GEOMETRY_FILE);
        let (zone_size, zone_count) = if geometry_path.exists() {
            Self::read_geometry(&geometry_path)?
        } else if create_if_missing {
            fs::create_dir_all(&dir)?;
            let mut file = File::create(&geometry_path)?;
            writeln!(file, "{} {}", zone_size, zone_count)?;
            file.sync_all()?;
            (zone_size, zone_count)
        } else {
            return Err(Error::InvalidArgument(format!(
                "no zoned device at {:?}",
                dir
            )));
        };

        let mut zones = Vec::with_capacity(zone_count as usize);
        for id in 0..zone_count {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(Self::zone_path(&dir, id))?;
            let write_pointer = file.metadata()?.len();
            zones.push(Mutex::new(ZoneSlot {
                cursor: ZoneCursor::from_write_pointer(write_pointer, zone_size),
                file,
            }));
        }
        log::debug!(
            "Opened file zoned device at {:?}: {} zones of {} bytes",
            dir,
            zone_count,
            zone_size
        );
        Ok(Self {
            dir,
            zone_size,
            zones,
        })
    }

    fn read_geometry(path: &Path) -> Result<(u64, u32)> {
        let text = fs::read_to_string(path)?;
        let mut parts = text.split_whitespace();
        let zone_size = parts.next().and_then(|s| s.parse::<u64>().ok());
        let zone_count = parts.next().and_then(|s| s.parse::<u32>().ok());
        match (zone_size, zone_count) {
            (Some(size), Some(count)) => Ok((size, count)),
            _ => Err(Error::Corruption(format!("bad geometry file {:?}", path))),
        }
    }

    fn zone_path(dir: &Path, zone: ZoneId) -> PathBuf {
        dir.join(format!("zone-{:05}", zone))
    }

    fn slot(&self, zone: ZoneId) -> Result<&Mutex<ZoneSlot>> {
        self.zones
            .get(zone as usize)
            .ok_or_else(|| Error::InvalidArgument(format!("zone {} out of range", zone)))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ZonedDevice for FileZonedDevice {
    fn zone_size(&self) -> u64 {
        self.zone_size
    }

    fn zone_count(&self) -> u32 {
        self.zones.len() as u32
    }

    fn report_zones(&self, filter: ZoneFilter) -> Result<Vec<ZoneInfo>> {
        let mut report = Vec::new();
        for (id, slot) in self.zones.iter().enumerate() {
            let slot = slot.lock();
            if filter.matches(slot.cursor.condition) {
                report.push(ZoneInfo {
                    id: id as ZoneId,
                    condition: slot.cursor.condition,
                    write_pointer: slot.cursor.write_pointer,
                    length: self.zone_size,
                });
            }
        }
        Ok(report)
    }

    fn open_zone(&self, zone: ZoneId) -> Result<()> {
        self.slot(zone)?.lock().cursor.open()
    }

    fn close_zone(&self, zone: ZoneId) -> Result<()> {
        self.slot(zone)?.lock().cursor.close();
        Ok(())
    }

    fn finish_zone(&self, zone: ZoneId) -> Result<()> {
        let mut slot = self.slot(zone)?.lock();
        slot.file.set_len(self.zone_size)?;
        slot.cursor.finish(self.zone_size);
        Ok(())
    }

    fn reset_write_pointer(&self, zone: ZoneId) -> Result<()> {
        let mut slot = self.slot(zone)?.lock();
        slot.file.set_len(0)?;
        slot.file.sync_all()?;
        slot.cursor.reset();
        Ok(())
    }

    fn append(&self, zone: ZoneId, data: &[u8]) -> Result<u64> {
        let mut slot = self.slot(zone)?.lock();
        slot.cursor
            .check_append(zone, data.len() as u64, self.zone_size)?;
        let offset = slot.cursor.write_pointer;
        slot.file.write_all(data)?;
        slot.cursor.advance(data.len() as u64, self.zone_size);
        Ok(offset)
    }

    fn read(&self, zone: ZoneId, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut slot = self.slot(zone)?.lock();
        slot.cursor.check_read(zone, offset, buf.len() as u64)?;
        slot.file.seek(SeekFrom::Start(offset))?;
        slot.file.read_exact(buf)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        for slot in &self.zones {
            let slot = slot.lock();
            if slot.cursor.condition.is_open() {
                slot.file.sync_data()?;
            }
        }
        Ok(())
    }
}
