//! In-memory zoned device.
//!
//! Clones share the same zones, so a test can drop an engine and reopen a new
//! one on the same "disk" to simulate a process crash.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use super::device::{ZoneCursor, ZoneFilter, ZoneId, ZoneInfo, ZonedDevice};
use crate::error::{Error, Result};

struct MemZone {
    cursor: ZoneCursor,
    data: Vec<u8>,
}

struct Inner {
    zones: Vec<MemZone>,
    failing: HashSet<ZoneId>,
}

#[derive(Clone)]
pub struct MemoryZonedDevice {
    zone_size: u64,
    inner: Arc<Mutex<Inner>>,
}

impl MemoryZonedDevice {
    pub fn new(zone_size: u64, zone_count: u32) -> Self {
        let zones = (0..zone_count)
            .map(|_| MemZone {
                cursor: ZoneCursor::from_write_pointer(0, zone_size),
                data: Vec::new(),
            })
            .collect();
        Self {
            zone_size,
            inner: Arc::new(Mutex::new(Inner {
                zones,
                failing: HashSet::new(),
            })),
        }
    }

    /// Make every append and reset to `zone` fail with an I/O error.
    pub fn fail_zone(&self, zone: ZoneId, failing: bool) {
        let mut inner = self.inner.lock();
        if failing {
            inner.failing.insert(zone);
        } else {
            inner.failing.remove(&zone);
        }
    }

    /// Overwrite bytes below the write pointer, bypassing the zone rules.
    /// Only meant for corrupting data in tests.
    pub fn corrupt(&self, zone: ZoneId, offset: u64, bytes: &[u8]) {
        let mut inner = self.inner.lock();
        let data = &mut inner.zones[zone as usize].data;
        let start = offset as usize;
        let end = (start + bytes.len()).min(data.len());
        if start < end {
            data[start..end].copy_from_slice(&bytes[..end - start]);
        }
    }

    fn check_zone(&self, inner: &Inner, zone: ZoneId) -> Result<()> {
        if zone as usize >= inner.zones.len() {
            return Err(Error::InvalidArgument(format!("zone {} out of range", zone)));
        }
        if inner.failing.contains(&zone) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("injected failure on zone {}", zone),
            )
            .into());
        }
        Ok(())
    }
}

impl ZonedDevice for MemoryZonedDevice {
    fn zone_size(&self) -> u64 {
        self.zone_size
    }

    fn zone_count(&self) -> u32 {
        self.inner.lock().zones.len() as u32
    }

    fn report_zones(&self, filter: ZoneFilter) -> Result<Vec<ZoneInfo>> {
        let inner = self.inner.lock();
        Ok(inner
            .zones
            .iter()
            .enumerate()
            .filter(|(_, zone)| filter.matches(zone.cursor.condition))
            .map(|(id, zone)| ZoneInfo {
                id: id as ZoneId,
                condition: zone.cursor.condition,
                write_pointer: zone.cursor.write_pointer,
                length: self.zone_size,
            })
            .collect())
    }

    fn open_zone(&self, zone: ZoneId) -> Result<()> {
        let mut inner = self.inner.lock();
        self.check_zone(&inner, zone)?;
        inner.zones[zone as usize].cursor.open()
    }

    fn close_zone(&self, zone: ZoneId) -> Result<()> {
        let mut inner = self.inner.lock();
        self.check_zone(&inner, zone)?;
        inner.zones[zone as usize].cursor.close();
        Ok(())
    }

    fn finish_zone(&self, zone: ZoneId) -> Result<()> {
        let mut inner = self.inner.lock();
        self.check_zone(&inner, zone)?;
        let slot = &mut inner.zones[zone as usize];
        slot.cursor.finish(self.zone_size);
        slot.data.resize(self.zone_size as usize, 0);
        Ok(())
    }

    fn reset_write_pointer(&self, zone: ZoneId) -> Result<()> {
        let mut inner = self.inner.lock();
        self.check_zone(&inner, zone)?;
        let slot = &mut inner.zones[zone as usize];
        slot.cursor.reset();
        slot.data = Vec::new();
        Ok(())
    }

    fn append(&self, zone: ZoneId, data: &[u8]) -> Result<u64> {
        let mut inner = self.inner.lock();
        self.check_zone(&inner, zone)?;
        let slot = &mut inner.zones[zone as usize];
        slot.cursor.check_append(zone, data.len() as u64, self.zone_size)?;
        let offset = slot.cursor.write_pointer;
        slot.data.extend_from_slice(data);
        slot.cursor.advance(data.len() as u64, self.zone_size);
        Ok(offset)
    }

    fn read(&self, zone: ZoneId, offset: u64, buf: &mut [u8]) -> Result<()> {
        let inner = self.inner.lock();
        if zone as usize >= inner.zones.len() {
            return Err(Error::InvalidArgument(format!("zone {} out of range", zone)));
        }
        let slot = &inner.zones[zone as usize];
        slot.cursor.check_read(zone, offset, buf.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&slot.data[start..start + buf.len()]);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zoned::device::ZoneCondition;

    #[test]
    fn test_append_and_read() {
        let device = MemoryZonedDevice::new(1024, 4);
        assert_eq!(device.append(1, b"hello").unwrap(), 0);
        assert_eq!(device.append(1, b"world").unwrap(), 5);
        let mut buf = [0u8; 10];
        device.read(1, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"helloworld");
        assert!(device.read(1, 8, &mut [0u8; 4]).is_err());
    }

    #[test]
    fn test_full_zone_rejects_append() {
        let device = MemoryZonedDevice::new(8, 2);
        device.append(0, b"12345678").unwrap();
        let report = device.report_zones(ZoneFilter::Full).unwrap();
        assert_eq!(report.len(), 1);
        assert!(matches!(
            device.append(0, b"x"),
            Err(Error::NoSpaceAvailable(_))
        ));
        device.reset_write_pointer(0).unwrap();
        assert_eq!(device.append(0, b"x").unwrap(), 0);
    }

    #[test]
    fn test_clones_share_zones() {
        let device = MemoryZonedDevice::new(64, 2);
        let clone = device.clone();
        device.append(0, b"abc").unwrap();
        let report = clone.report_zones(ZoneFilter::NotEmpty).unwrap();
        assert_eq!(report[0].write_pointer, 3);
        assert_eq!(report[0].condition, ZoneCondition::ImplicitOpen);
    }

    #[test]
    fn test_injected_failure() {
        let device = MemoryZonedDevice::new(64, 2);
        device.fail_zone(1, true);
        assert!(matches!(device.append(1, b"x"), Err(Error::Io(_))));
        device.fail_zone(1, false);
        assert!(device.append(1, b"x").is_ok());
    }
}
