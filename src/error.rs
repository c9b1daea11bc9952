//! Error types for recorder operations

use thiserror_no_std::Error;

use crate::storage::StorageError;

/// Errors surfaced by the recorder and its persistence layer
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecorderError {
    /// The key-value backend failed
    #[error("Storage backend error: {0}")]
    Storage(StorageError),

    /// No space left and no block was old enough to evict
    #[error("Storage full while writing block {key}")]
    StorageFull {
        /// Key of the block that could not be written
        key: u32,
    },

    /// The requested history index is not present in storage
    #[error("No data point at index {0}")]
    NotFound(u16),

    /// Legacy history metadata could not be interpreted
    #[error("Malformed legacy data: {0}")]
    MalformedLegacyData(&'static str),

    /// A block was written by an unknown format version
    #[error("Unsupported block format version {0}")]
    UnsupportedVersion(u8),

    /// A block's length or record count is inconsistent
    #[error("Corrupt block at key {0}")]
    CorruptBlock(u32),

    /// A persisted structure could not be encoded or decoded
    #[error("Serialization failed")]
    Serialization,

    /// The foreground process gave up waiting on the worker
    #[error("Cross-process request timed out after {polls} polls")]
    CrossProcessTimeout {
        /// Number of mailbox polls made before giving up
        polls: u32,
    },

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

impl From<StorageError> for RecorderError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err)
    }
}

impl From<postcard::Error> for RecorderError {
    fn from(err: postcard::Error) -> Self {
        log::debug!("postcard: {:?}", err);
        Self::Serialization
    }
}

impl From<core::fmt::Error> for RecorderError {
    fn from(_: core::fmt::Error) -> Self {
        Self::Serialization
    }
}
