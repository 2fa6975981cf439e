//! zonekv - Sorted Files
//! Immutable files of InternalKey-ordered entries, written once by a flush or
//! a compaction and deleted once no version references them.
//!
//! ## File layout
//! ```text
//! [data block 0] ... [data block N]
//! [filter block]      (optional, bloom filter over user keys)
//! [meta-index block]  name -> handle
//! [index block]       last key of each data block -> handle
//! [footer]            fixed size, see `block::Footer`
//! ```

pub mod block;
pub mod bloom;
pub mod builder;
pub mod cache;
pub mod reader;

pub use self::builder::{BuiltTable, TableBuilder};
pub use self::cache::TableCache;
pub use self::reader::{Table, TableIterator};

/// Meta-index entry naming the bloom filter block.
pub(crate) const FILTER_BLOCK_NAME: &str = "filter.bloom";
