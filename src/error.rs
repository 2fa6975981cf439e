//! zonekv - Error Types
//! Defines the error hierarchy for the storage engine and its zoned store.

use std::sync::Arc;

use thiserror::Error;

/// Custom Result type for the zonekv engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the zonekv storage engine.
///
/// The type is `Clone` so that a single group-commit result can be handed
/// to every writer that was coalesced into the batch.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Device or file operation failed.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// Checksum or format mismatch.
    #[error("Data corruption detected: {0}")]
    Corruption(String),

    /// No free zone or value-file space left.
    #[error("No space available: {0}")]
    NoSpaceAvailable(String),

    /// Caller misuse.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation is not supported by this device or engine.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Operation was skipped because there was nothing to do.
    #[error("Not attempted: {0}")]
    NotAttempted(String),

    /// A redundant superblock copy could not be written; the store is degraded
    /// but still operable.
    #[error("Superblock degraded: {0}")]
    SuperblockIo(String),

    /// No valid superblock copy remains; the engine refuses further writes.
    #[error("Fatal corruption: {0}")]
    FatalCorruption(String),

    /// Catalog (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The engine is shutting down.
    #[error("Engine is shutting down")]
    ShuttingDown,
}

impl Error {
    /// True for the "skipped by design" outcome, which callers treat as a no-op.
    pub fn is_not_attempted(&self) -> bool {
        matches!(self, Error::NotAttempted(_))
    }

    pub fn is_no_space(&self) -> bool {
        matches!(self, Error::NoSpaceAvailable(_))
    }

    /// Whether recording this error as the background error stops all further
    /// flush, compaction and defragmentation scheduling.
    pub fn halts_background(&self) -> bool {
        !matches!(
            self,
            Error::NotAttempted(_) | Error::SuperblockIo(_) | Error::NoSpaceAvailable(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_halting_classification() {
        assert!(!Error::NotAttempted("x".into()).halts_background());
        assert!(!Error::SuperblockIo("x".into()).halts_background());
        assert!(!Error::NoSpaceAvailable("x".into()).halts_background());
        assert!(Error::Corruption("x".into()).halts_background());
        assert!(Error::FatalCorruption("x".into()).halts_background());
        let io: Error = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert!(io.halts_background());
    }

    #[test]
    fn test_clone_keeps_message() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
        assert!(copy.to_string().contains("boom"));
    }
}
