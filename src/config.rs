//! zonekv - Engine Configuration
//! Defines tunable parameters for the storage engine and the file-backed zoned device.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Section footer plus the fixed part of one key index entry, rounded up.
const VALUE_SECTION_OVERHEAD: u64 = 128;

/// Configuration for the zonekv storage engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the zone files of a file-backed device.
    pub data_dir: PathBuf,

    /// Format an empty device on open instead of failing.
    pub create_if_missing: bool,

    /// Maximum size of the active MemTable in bytes before it is frozen.
    pub write_buffer_size: usize,

    /// Target size of one sorted file; also caps the table bytes a MemTable may hold.
    pub max_file_size: u64,

    /// Uncompressed size of a sorted-file data block.
    pub block_size: usize,

    /// Bloom filter bits per key (0 disables the filter block).
    pub bloom_bits_per_key: usize,

    /// Values of at least this many bytes are moved into value files on flush.
    pub value_threshold: usize,

    /// Largest key accepted by writes.
    pub max_key_size: usize,

    /// Largest value accepted by `put`.
    pub max_value_size: usize,

    /// A value-file section is closed once its key index grows beyond this size.
    pub value_section_index_limit: usize,

    /// Below this much zone space left, the value builder checks whether the next
    /// value still fits and rotates to a fresh value file if it does not.
    pub value_rotation_reserve: u64,

    /// Number of level-0 files that triggers a compaction.
    pub l0_compaction_trigger: usize,

    /// Number of level-0 files at which each write is delayed.
    pub l0_slowdown_trigger: usize,

    /// Number of level-0 files at which writes stop until compaction catches up.
    pub l0_stop_trigger: usize,

    /// Maximum bytes of level 1; each deeper level gets ten times more.
    pub max_bytes_for_level_base: u64,

    /// Upper bound on the size of a coalesced group-commit batch.
    pub max_coalesced_write: usize,

    /// Fail recovery on any corrupt or torn WAL/manifest record.
    pub paranoid_checks: bool,

    /// Durability of the convenience `put`/`delete` calls.
    pub sync_writes: bool,

    /// A zone (or value file) whose live fraction drops below this is fragmented.
    pub defrag_live_ratio: f64,

    /// Fraction of used zones above which the disk counts as highly used.
    pub high_disk_usage_ratio: f64,

    /// The engine counts as idle when no write arrived for this long.
    pub idle_after: Duration,

    /// Period of the scheduler tick driving idle-time work.
    pub background_tick: Duration,

    /// A manifest larger than this is rotated on the next catalog change.
    pub max_manifest_size: u64,

    /// Zone size of a newly created file-backed device.
    pub zone_size: u64,

    /// Zone count of a newly created file-backed device.
    pub zone_count: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            create_if_missing: true,
            write_buffer_size: 4 * 1024 * 1024, // 4 MB
            max_file_size: 2 * 1024 * 1024,
            block_size: 4096,
            bloom_bits_per_key: 10,
            value_threshold: 32 * 1024,
            max_key_size: 16 * 1024,
            max_value_size: 1024 * 1024,
            value_section_index_limit: 512 * 1000,
            value_rotation_reserve: 3 * 1000 * 1000,
            l0_compaction_trigger: 4,
            l0_slowdown_trigger: 8,
            l0_stop_trigger: 12,
            max_bytes_for_level_base: 10 * 1024 * 1024,
            max_coalesced_write: 1 << 20,
            paranoid_checks: false,
            sync_writes: true,
            defrag_live_ratio: 0.5,
            high_disk_usage_ratio: 0.85,
            idle_after: Duration::from_secs(2),
            background_tick: Duration::from_millis(100),
            max_manifest_size: 4 * 1024 * 1024,
            zone_size: 256 * 1024 * 1024,
            zone_count: 64,
        }
    }
}

impl Config {
    /// Create a new Config with a custom data directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// A small geometry suited to tests: 1 MB zones, small buffers and files.
    pub fn small(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            write_buffer_size: 64 * 1024,
            max_file_size: 64 * 1024,
            max_value_size: 400 * 1024,
            value_section_index_limit: 16 * 1024,
            value_rotation_reserve: 512 * 1024,
            max_bytes_for_level_base: 256 * 1024,
            max_manifest_size: 256 * 1024,
            zone_size: 1024 * 1024,
            zone_count: 96,
            ..Default::default()
        }
    }

    /// Set the maximum MemTable size before it is frozen.
    pub fn with_write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    /// Set the value size at which values move to value files.
    pub fn with_value_threshold(mut self, size: usize) -> Self {
        self.value_threshold = size;
        self
    }

    /// Set the default durability of `put` and `delete`.
    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    /// Enable strict checking of WAL and manifest records during recovery.
    pub fn with_paranoid_checks(mut self, strict: bool) -> Self {
        self.paranoid_checks = strict;
        self
    }

    /// Set the geometry used when a file-backed device is created.
    pub fn with_geometry(mut self, zone_size: u64, zone_count: u32) -> Self {
        self.zone_size = zone_size;
        self.zone_count = zone_count;
        self
    }

    /// Set the level-0 compaction, slowdown and stop triggers.
    pub fn with_l0_triggers(mut self, compaction: usize, slowdown: usize, stop: usize) -> Self {
        self.l0_compaction_trigger = compaction;
        self.l0_slowdown_trigger = slowdown;
        self.l0_stop_trigger = stop;
        self
    }

    /// Set how long the engine must go without writes before it counts as idle.
    pub fn with_idle_after(mut self, idle_after: Duration) -> Self {
        self.idle_after = idle_after;
        self
    }

    /// Ensure the data directory exists.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.write_buffer_size == 0 || self.block_size == 0 || self.max_file_size == 0 {
            return Err(Error::InvalidArgument(
                "buffer, block and file sizes must be positive".into(),
            ));
        }
        if self.value_threshold == 0 {
            return Err(Error::InvalidArgument("value_threshold must be positive".into()));
        }
        if !(self.l0_compaction_trigger <= self.l0_slowdown_trigger
            && self.l0_slowdown_trigger <= self.l0_stop_trigger)
        {
            return Err(Error::InvalidArgument(
                "level-0 triggers must satisfy compaction <= slowdown <= stop".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.defrag_live_ratio)
            || !(0.0..=1.0).contains(&self.high_disk_usage_ratio)
        {
            return Err(Error::InvalidArgument("ratios must be within [0, 1]".into()));
        }
        if self.zone_size == 0 || self.zone_count < 8 {
            return Err(Error::InvalidArgument(
                "a device needs a positive zone size and at least 8 zones".into(),
            ));
        }
        Ok(())
    }

    /// Reject a device whose zones cannot hold the largest value together
    /// with a full section index. Such a value could never be flushed.
    pub fn validate_zone_size(&self, zone_size: u64) -> Result<()> {
        let section = self.max_value_size as u64
            + self.max_key_size as u64
            + self.value_section_index_limit as u64
            + VALUE_SECTION_OVERHEAD;
        if section > self.value_rotation_reserve {
            return Err(Error::InvalidArgument(format!(
                "value_rotation_reserve of {} bytes cannot hold a {} byte value section",
                self.value_rotation_reserve, section
            )));
        }
        if self.value_rotation_reserve > zone_size {
            return Err(Error::InvalidArgument(format!(
                "value_rotation_reserve of {} bytes exceeds the {} byte zone",
                self.value_rotation_reserve, zone_size
            )));
        }
        Ok(())
    }
}
