//! zonekv - LSM-Tree Key-Value Storage Engine for Zoned Devices
//!
//! A crash-recoverable storage engine whose files live on zoned, append-only
//! storage: every zone is written sequentially and only reclaimed by a reset.
//!
//! ## Features
//! - **Zoned store**: logical files over zones, redundant superblocks, zone defragmentation
//! - **Write-Ahead Log (WAL)**: group commit, CRC32-checked records, crash recovery
//! - **MemTable**: in-memory sorted map of every key version
//! - **Sorted files**: block-based tables with Bloom filters, seven levels
//! - **Value files**: large values stored once, outside the sorted files
//! - **Compaction**: leveled, with snapshots, trivial moves and out-of-space splitting
//! - **Metrics**: lock-free atomic counters for observability
//!
//! ## Example
//! ```no_run
//! use zonekv::{Config, ZoneKv};
//!
//! let db = ZoneKv::open(Config::new("./data")).unwrap();
//! db.put(b"key".to_vec(), b"value".to_vec(), true).unwrap();
//! assert_eq!(db.get(b"key").unwrap(), Some(b"value".to_vec()));
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod types;
pub mod zoned;

pub use config::Config;
pub use engine::batch::WriteBatch;
pub use engine::iterator::DbIterator;
pub use engine::snapshot::Snapshot;
pub use engine::ZoneKv;
pub use error::{Error, Result};
pub use zoned::{FileZonedDevice, MemoryZonedDevice, ZonedDevice};
