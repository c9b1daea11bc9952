//! Persistence layer
//!
//! History is kept in a small key-value store whose values are capped at
//! [`MAX_VALUE_LEN`] bytes. Observations are packed five bytes apiece into
//! fixed-size blocks, one block per key, written in ascending key order.
//!
//! Key map:
//! - [`LEGACY_DATA_KEY`] and up: history in the pre-block format (migrated once)
//! - [`MAILBOX_LOCK_KEY`] / [`MAILBOX_PAYLOAD_KEY`]: snapshot handshake
//! - [`ALERTS_KEY`]: persisted alert thresholds
//! - [`RECORD_LIFE_KEY`]: longest observed run time
//! - [`PERSIST_DATA_KEY`]: pointer to the block currently being filled
//! - [`FIRST_BLOCK_KEY`] and up: data blocks

pub mod block;
pub mod block_store;
pub mod memory;
pub mod record;

#[cfg(feature = "sd-card")]
pub mod sd_card;

pub use block::{BLOCK_CAPACITY, BLOCK_SIZE, Block};
pub use block_store::BlockStore;
pub use memory::MemoryStorage;
pub use record::Observation;

use thiserror_no_std::Error;

/// Key in the backing key-value store
pub type Key = u32;

/// First key of the legacy (pre-block) history format
pub const LEGACY_DATA_KEY: Key = 100;
/// Held by the worker while a snapshot chunk awaits pickup
pub const MAILBOX_LOCK_KEY: Key = 995;
/// Carries the current snapshot chunk
pub const MAILBOX_PAYLOAD_KEY: Key = 996;
pub const ALERTS_KEY: Key = 998;
pub const RECORD_LIFE_KEY: Key = 999;
/// Holds the key of the block currently being filled
pub const PERSIST_DATA_KEY: Key = 1000;
pub const FIRST_BLOCK_KEY: Key = PERSIST_DATA_KEY + 1;

/// Largest value the backend accepts
pub const MAX_VALUE_LEN: usize = 256;

/// Errors reported by a storage backend
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// The backend has no room left for the write
    #[error("No space left in storage")]
    NoSpace,

    /// The value exceeds the per-key size limit
    #[error("Value of {0} bytes exceeds the per-key limit")]
    TooLarge(usize),

    /// Any other device failure
    #[error("Storage device failure")]
    Device,
}

/// Key-value persistence used by the recorder.
///
/// Implementations are expected to be synchronous: the recorder runs on a
/// single worker and every write either lands or fails before returning.
pub trait Storage {
    fn exists(&self, key: Key) -> bool;

    /// Read the value for `key` into `buf`, returning the number of bytes
    /// copied, or `None` when the key is absent.
    fn read(&self, key: Key, buf: &mut [u8]) -> Result<Option<usize>, StorageError>;

    fn write(&mut self, key: Key, data: &[u8]) -> Result<(), StorageError>;

    /// Remove `key`. Deleting a missing key is not an error.
    fn delete(&mut self, key: Key) -> Result<(), StorageError>;

    fn read_i32(&self, key: Key) -> Result<Option<i32>, StorageError> {
        let mut buf = [0u8; 4];
        match self.read(key, &mut buf)? {
            Some(4) => Ok(Some(i32::from_le_bytes(buf))),
            Some(_) => Err(StorageError::Device),
            None => Ok(None),
        }
    }

    fn write_i32(&mut self, key: Key, value: i32) -> Result<(), StorageError> {
        self.write(key, &value.to_le_bytes())
    }
}
