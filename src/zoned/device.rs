//! Abstract zoned block device.
//!
//! A zone accepts writes only at its write pointer and is reclaimed only by a
//! reset, which discards everything in it. This trait is the whole contract the
//! store needs from the device command layer.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Zone identifier.
pub type ZoneId = u32;

/// Zone condition as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZoneCondition {
    Empty,
    ImplicitOpen,
    ExplicitOpen,
    Closed,
    Full,
}

impl ZoneCondition {
    pub fn is_open(self) -> bool {
        matches!(self, ZoneCondition::ImplicitOpen | ZoneCondition::ExplicitOpen)
    }
}

/// One row of a zone report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneInfo {
    pub id: ZoneId,
    pub condition: ZoneCondition,
    pub write_pointer: u64,
    pub length: u64,
}

/// Selects which zones a report returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneFilter {
    All,
    Empty,
    Open,
    Closed,
    Full,
    NotEmpty,
}

impl ZoneFilter {
    pub fn matches(self, condition: ZoneCondition) -> bool {
        match self {
            ZoneFilter::All => true,
            ZoneFilter::Empty => condition == ZoneCondition::Empty,
            ZoneFilter::Open => condition.is_open(),
            ZoneFilter::Closed => condition == ZoneCondition::Closed,
            ZoneFilter::Full => condition == ZoneCondition::Full,
            ZoneFilter::NotEmpty => condition != ZoneCondition::Empty,
        }
    }
}

/// Command surface of a host-managed zoned device.
pub trait ZonedDevice: Send + Sync {
    fn zone_size(&self) -> u64;

    fn zone_count(&self) -> u32;

    fn report_zones(&self, filter: ZoneFilter) -> Result<Vec<ZoneInfo>>;

    fn open_zone(&self, zone: ZoneId) -> Result<()>;

    fn close_zone(&self, zone: ZoneId) -> Result<()>;

    /// Moves the write pointer to the end of the zone.
    fn finish_zone(&self, zone: ZoneId) -> Result<()>;

    /// Returns the zone to `Empty`, discarding its content.
    fn reset_write_pointer(&self, zone: ZoneId) -> Result<()>;

    /// Writes `data` at the write pointer and returns the offset it landed at.
    fn append(&self, zone: ZoneId, data: &[u8]) -> Result<u64>;

    /// Reads `buf.len()` bytes at `offset`; the range must lie below the write pointer.
    fn read(&self, zone: ZoneId, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Makes every completed append durable.
    fn sync(&self) -> Result<()>;
}

/// State machine shared by the device implementations.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ZoneCursor {
    pub condition: ZoneCondition,
    pub write_pointer: u64,
}

impl ZoneCursor {
    pub fn from_write_pointer(write_pointer: u64, length: u64) -> Self {
        let condition = if write_pointer == 0 {
            ZoneCondition::Empty
        } else if write_pointer >= length {
            ZoneCondition::Full
        } else {
            ZoneCondition::Closed
        };
        Self {
            condition,
            write_pointer,
        }
    }

    pub fn check_append(&self, zone: ZoneId, len: u64, length: u64) -> Result<()> {
        if self.condition == ZoneCondition::Full || self.write_pointer + len > length {
            return Err(Error::NoSpaceAvailable(format!(
                "zone {} cannot take {} bytes at write pointer {}",
                zone, len, self.write_pointer
            )));
        }
        Ok(())
    }

    pub fn advance(&mut self, len: u64, length: u64) {
        self.write_pointer += len;
        if self.write_pointer >= length {
            self.condition = ZoneCondition::Full;
        } else if self.condition != ZoneCondition::ExplicitOpen {
            self.condition = ZoneCondition::ImplicitOpen;
        }
    }

    pub fn check_read(&self, zone: ZoneId, offset: u64, len: u64) -> Result<()> {
        if offset + len > self.write_pointer {
            return Err(Error::InvalidArgument(format!(
                "read of {} bytes at {} beyond write pointer {} of zone {}",
                len, offset, self.write_pointer, zone
            )));
        }
        Ok(())
    }

    pub fn open(&mut self) -> Result<()> {
        if self.condition == ZoneCondition::Full {
            return Err(Error::InvalidArgument("cannot open a full zone".into()));
        }
        self.condition = ZoneCondition::ExplicitOpen;
        Ok(())
    }

    pub fn close(&mut self) {
        if self.condition.is_open() {
            self.condition = if self.write_pointer == 0 {
                ZoneCondition::Empty
            } else {
                ZoneCondition::Closed
            };
        }
    }

    pub fn finish(&mut self, length: u64) {
        self.write_pointer = length;
        self.condition = ZoneCondition::Full;
    }

    pub fn reset(&mut self) {
        self.write_pointer = 0;
        self.condition = ZoneCondition::Empty;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_transitions() {
        let mut cursor = ZoneCursor::from_write_pointer(0, 100);
        assert_eq!(cursor.condition, ZoneCondition::Empty);
        cursor.advance(40, 100);
        assert_eq!(cursor.condition, ZoneCondition::ImplicitOpen);
        cursor.close();
        assert_eq!(cursor.condition, ZoneCondition::Closed);
        assert!(cursor.check_append(1, 61, 100).is_err());
        cursor.advance(60, 100);
        assert_eq!(cursor.condition, ZoneCondition::Full);
        cursor.reset();
        assert_eq!(cursor.condition, ZoneCondition::Empty);
        assert_eq!(cursor.write_pointer, 0);
    }

    #[test]
    fn test_filter_matches() {
        assert!(ZoneFilter::Open.matches(ZoneCondition::ExplicitOpen));
        assert!(ZoneFilter::NotEmpty.matches(ZoneCondition::Closed));
        assert!(!ZoneFilter::Empty.matches(ZoneCondition::Full));
    }
}
