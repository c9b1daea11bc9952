//! In-memory storage backend
//!
//! Stands in for flash on the host: tests and the simulator use it, and
//! fault injection lets them exercise the eviction path.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::cell::RefCell;

use super::{Key, MAX_VALUE_LEN, Storage, StorageError};

/// BTreeMap-backed key-value store with an optional byte budget
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    entries: BTreeMap<Key, Vec<u8>>,
    capacity: Option<usize>,
    failing_writes: u32,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that rejects writes once `capacity` value bytes are held
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    /// Make the next `count` writes fail with [`StorageError::NoSpace`]
    pub fn fail_next_writes(&mut self, count: u32) {
        self.failing_writes = count;
    }

    /// Total bytes held across all keys
    pub fn used_bytes(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn keys(&self) -> impl Iterator<Item = Key> + '_ {
        self.entries.keys().copied()
    }
}

impl Storage for MemoryStorage {
    fn exists(&self, key: Key) -> bool {
        self.entries.contains_key(&key)
    }

    fn read(&self, key: Key, buf: &mut [u8]) -> Result<Option<usize>, StorageError> {
        Ok(self.entries.get(&key).map(|value| {
            let len = value.len().min(buf.len());
            buf[..len].copy_from_slice(&value[..len]);
            len
        }))
    }

    fn write(&mut self, key: Key, data: &[u8]) -> Result<(), StorageError> {
        if data.len() > MAX_VALUE_LEN {
            return Err(StorageError::TooLarge(data.len()));
        }
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(StorageError::NoSpace);
        }
        if let Some(capacity) = self.capacity {
            let replaced = self.entries.get(&key).map_or(0, Vec::len);
            if self.used_bytes() - replaced + data.len() > capacity {
                return Err(StorageError::NoSpace);
            }
        }

        self.entries.insert(key, data.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: Key) -> Result<(), StorageError> {
        self.entries.remove(&key);
        Ok(())
    }
}

/// Lets two owners (a worker and a foreground reader) share one store
impl<S: Storage> Storage for &RefCell<S> {
    fn exists(&self, key: Key) -> bool {
        self.borrow().exists(key)
    }

    fn read(&self, key: Key, buf: &mut [u8]) -> Result<Option<usize>, StorageError> {
        self.borrow().read(key, buf)
    }

    fn write(&mut self, key: Key, data: &[u8]) -> Result<(), StorageError> {
        self.borrow_mut().write(key, data)
    }

    fn delete(&mut self, key: Key) -> Result<(), StorageError> {
        self.borrow_mut().delete(key)
    }
}
