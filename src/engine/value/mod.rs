//! zonekv - Value Separation
//! Values at or above the configured threshold live in append-only value
//! files; sorted files only keep a `ValueReference` to them.
//!
//! A value file owns one zone and holds a sequence of sections, see
//! [`section`]. Its record counts live in the catalog: flushes add to
//! `records_total`, compactions add to `records_deleted`, and the file is
//! reclaimed once both are equal and no cached writer holds it.

pub mod builder;
pub mod cache;
pub mod deleter;
pub mod mover;
pub mod section;

pub use self::builder::ValueBuilder;
pub use self::cache::{ValueFileCache, ValueFileReader, WritableValueFile};
pub use self::deleter::ValueDeleter;
pub use self::mover::{MoveStats, ValueMover};
