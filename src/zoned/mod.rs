//! zonekv - Zoned Storage
//! Logical append-only files packed into the zones of a zoned device.
//!
//! ## Layout
//! - Zones `0..SUPERBLOCK_COPIES` hold redundant superblock copies
//! - Meta files (WAL, manifest) and sorted tables share packed zones
//! - Every value file owns exactly one zone
//!
//! The store never writes below a zone's write pointer. Space is reclaimed by
//! resetting a zone once no file references it, either because every file in it
//! was deleted or because defragmentation copied the live extents elsewhere.

mod defrag;
pub mod device;
pub mod file;
pub mod memory;
pub mod store;
mod superblock;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::FileNumber;

pub use self::device::{ZoneCondition, ZoneFilter, ZoneId, ZoneInfo, ZonedDevice};
pub use self::file::FileZonedDevice;
pub use self::memory::MemoryZonedDevice;
pub use self::store::{Capacity, ZonedStore};
pub use self::superblock::SUPERBLOCK_COPIES;

/// What a logical file holds. Decides which zones it may be placed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FileKind {
    Log,
    Manifest,
    Table,
    Value,
}

impl FileKind {
    pub fn class(self) -> ZoneClass {
        match self {
            FileKind::Log | FileKind::Manifest => ZoneClass::Meta,
            FileKind::Table => ZoneClass::Table,
            FileKind::Value => ZoneClass::Value,
        }
    }
}

/// Files of one class never share a zone with files of another class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ZoneClass {
    Meta,
    Table,
    Value,
}

/// Name of a logical file in the store.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId {
    pub kind: FileKind,
    pub number: FileNumber,
}

impl FileId {
    pub fn new(kind: FileKind, number: FileNumber) -> Self {
        Self { kind, number }
    }

    pub fn log(number: FileNumber) -> Self {
        Self::new(FileKind::Log, number)
    }

    pub fn manifest(number: FileNumber) -> Self {
        Self::new(FileKind::Manifest, number)
    }

    pub fn table(number: FileNumber) -> Self {
        Self::new(FileKind::Table, number)
    }

    pub fn value(number: FileNumber) -> Self {
        Self::new(FileKind::Value, number)
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = match self.kind {
            FileKind::Log => "log",
            FileKind::Manifest => "manifest",
            FileKind::Table => "sst",
            FileKind::Value => "val",
        };
        write!(f, "{:06}.{}", self.number, suffix)
    }
}

/// A contiguous run of a file's bytes inside one zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub zone: ZoneId,
    pub offset: u64,
    pub length: u64,
}

impl Extent {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}
