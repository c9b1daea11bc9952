//! Block store
//!
//! Maps the logical record index space (0 = newest) onto data blocks at
//! ascending keys. The block at the persisted pointer is the only one that
//! may be partially filled; every older block holds [`BLOCK_CAPACITY`]
//! records.

use alloc::vec::Vec;

use log::{debug, error, warn};

use super::block::{BLOCK_CAPACITY, BLOCK_SIZE, Block};
use super::record::Observation;
use super::{FIRST_BLOCK_KEY, Key, PERSIST_DATA_KEY, Storage, StorageError};
use crate::error::RecorderError;

/// Blocks nearest the newest that eviction never touches
pub const EVICTION_GUARD: Key = 3;

/// Result of a successful append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Key the record was written to
    pub key: Key,
    /// Old blocks deleted to make room
    pub evicted: u32,
}

/// Blocks covering a requested index range, newest block first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockRange {
    /// Logical index of the newest record of the first block
    pub head_index: u16,
    pub blocks: Vec<Block>,
}

impl BlockRange {
    pub fn record_count(&self) -> usize {
        self.blocks.iter().map(Block::len).sum()
    }
}

pub struct BlockStore<S> {
    storage: S,
}

impl<S: Storage> BlockStore<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn into_inner(self) -> S {
        self.storage
    }

    /// Whether the block pointer has been written (false on first launch)
    pub fn is_initialized(&self) -> bool {
        self.storage.exists(PERSIST_DATA_KEY)
    }

    pub fn init(&mut self) -> Result<(), RecorderError> {
        self.storage
            .write_i32(PERSIST_DATA_KEY, FIRST_BLOCK_KEY as i32)?;
        Ok(())
    }

    /// Key of the block currently being filled
    pub fn next_key(&self) -> Result<Key, RecorderError> {
        let key = self.storage.read_i32(PERSIST_DATA_KEY)?;
        Ok(match key {
            Some(key) if key > PERSIST_DATA_KEY as i32 => key as Key,
            _ => FIRST_BLOCK_KEY,
        })
    }

    /// Key of the newest block that holds data
    pub fn newest_key(&self) -> Result<Option<Key>, RecorderError> {
        let mut key = self.next_key()?;
        if !self.storage.exists(key) {
            key -= 1;
        }
        if key < FIRST_BLOCK_KEY || !self.storage.exists(key) {
            return Ok(None);
        }
        Ok(Some(key))
    }

    /// Oldest surviving key in the unbroken run that ends at `key`
    pub fn oldest_key(&self, key: Key) -> Key {
        let mut oldest = key;
        while oldest > FIRST_BLOCK_KEY && self.storage.exists(oldest - 1) {
            oldest -= 1;
        }
        oldest
    }

    pub fn read_block(&self, key: Key) -> Result<Option<Block>, RecorderError> {
        let mut buf = [0u8; BLOCK_SIZE];
        match self.storage.read(key, &mut buf)? {
            Some(len) => Block::from_bytes(key, &buf[..len]).map(Some),
            None => Ok(None),
        }
    }

    /// Append one observation to the newest block.
    ///
    /// `charge_rate` seeds the header when this record opens a new block.
    /// When the backend runs out of space the oldest blocks are evicted one at
    /// a time, never touching the [`EVICTION_GUARD`] blocks before the one
    /// being written. If that is not enough the record is dropped and
    /// [`RecorderError::StorageFull`] is returned.
    pub fn append(
        &mut self,
        obs: Observation,
        charge_rate: i32,
    ) -> Result<AppendOutcome, RecorderError> {
        let mut key = self.next_key()?;
        let mut block = self
            .read_block(key)?
            .unwrap_or_else(|| Block::new(charge_rate));

        // The pointer write after the last fill failed; roll over now
        if block.is_full() {
            key += 1;
            debug!("Block {} already full, rolling to {}", key - 1, key);
            self.storage.write_i32(PERSIST_DATA_KEY, key as i32)?;
            block = Block::new(charge_rate);
        }

        block
            .push(obs)
            .map_err(|_| RecorderError::CorruptBlock(key))?;
        let bytes = block.to_bytes();

        let mut oldest = self.oldest_key(key);
        let mut evicted = 0;
        loop {
            match self.storage.write(key, &bytes) {
                Ok(()) => break,
                Err(StorageError::NoSpace) if oldest + EVICTION_GUARD < key => {
                    warn!("Storage full, evicting block {}", oldest);
                    self.storage.delete(oldest)?;
                    oldest += 1;
                    evicted += 1;
                }
                Err(StorageError::NoSpace) => {
                    error!("Storage full at block {}, no block left to evict", key);
                    return Err(RecorderError::StorageFull { key });
                }
                Err(err) => return Err(err.into()),
            }
        }

        if block.len() >= BLOCK_CAPACITY {
            debug!("Block {} full, next block is {}", key, key + 1);
            if let Err(err) = self.storage.write_i32(PERSIST_DATA_KEY, key as i32 + 1) {
                warn!("Failed to advance block pointer: {}", err);
            }
        }

        Ok(AppendOutcome { key, evicted })
    }

    /// Read the blocks holding logical `index` and older, until at least
    /// `count` records are collected or history runs out.
    pub fn read_range(&self, index: u16, count: usize) -> Result<BlockRange, RecorderError> {
        let mut range = BlockRange {
            head_index: index,
            blocks: Vec::new(),
        };

        let Some(newest) = self.newest_key()? else {
            return Ok(range);
        };
        let Some(newest_block) = self.read_block(newest)? else {
            return Ok(range);
        };

        let newest_len = newest_block.len();
        let index = index as usize;
        let mut key = if index < newest_len {
            range.head_index = 0;
            newest
        } else {
            let back = (index - newest_len) / BLOCK_CAPACITY;
            range.head_index = (newest_len + back * BLOCK_CAPACITY) as u16;
            match newest.checked_sub(1 + back as Key) {
                Some(key) => key,
                None => return Ok(range),
            }
        };

        if key == newest {
            range.blocks.push(newest_block);
            key -= 1;
        }

        while key >= FIRST_BLOCK_KEY && range.record_count() < count {
            match self.read_block(key)? {
                Some(block) => range.blocks.push(block),
                None => break,
            }
            key -= 1;
        }

        debug!(
            "Read {} blocks from index {}",
            range.blocks.len(),
            range.head_index
        );
        Ok(range)
    }
}
