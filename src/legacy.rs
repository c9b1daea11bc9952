//! Import of history written by the pre-block storage format.
//!
//! The old format kept a circular buffer of 100 packed `u32` values:
//! - key 100: write index
//! - key 101: number of values written
//! - key 102: record life (discarded)
//! - keys 103..=119: the 400-byte value array in 24-byte chunks
//!
//! Each value packs a minute timestamp with a 10% resolution percent:
//! `value = minutes * 44 + (percent / 10) * 4 + charging * 2 + plugged`.

use log::{info, warn};

use crate::error::RecorderError;
use crate::storage::{Key, LEGACY_DATA_KEY, Observation, Storage};

pub const LEGACY_INDEX_KEY: Key = LEGACY_DATA_KEY;
pub const LEGACY_COUNT_KEY: Key = LEGACY_DATA_KEY + 1;
pub const LEGACY_RECORD_KEY: Key = LEGACY_DATA_KEY + 2;
pub const LEGACY_FIRST_CHUNK_KEY: Key = LEGACY_DATA_KEY + 3;

/// Zero point of legacy timestamps (2015-01-01T00:00:00Z)
pub const LEGACY_EPOCH_BASE: u32 = 1_420_070_400;

/// Values held by the legacy circular buffer
pub const LEGACY_CAPACITY: usize = 100;
const CHUNK_LEN: usize = 24;
const ARRAY_LEN: usize = LEGACY_CAPACITY * 4;
const CHUNK_COUNT: usize = ARRAY_LEN.div_ceil(CHUNK_LEN);

/// Last key used by the legacy format
pub const LEGACY_LAST_KEY: Key = LEGACY_FIRST_CHUNK_KEY + CHUNK_COUNT as Key - 1;

/// Upper bound on replayed entries, whatever the metadata claims
pub const MAX_ITERATIONS: usize = 999;

/// Outcome of a legacy import
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MigrationReport {
    /// Observations replayed into the new store
    pub imported: u32,
    /// Replay stopped before the metadata's end
    pub truncated: bool,
}

/// Decode one legacy value
pub fn decode_value(value: u32) -> Observation {
    let minutes = value / 44;
    let rest = value % 44;
    Observation {
        epoch: minutes.saturating_mul(60).saturating_add(LEGACY_EPOCH_BASE),
        percent: ((rest / 4) * 10) as u8,
        charging: (rest % 4) / 2 == 1,
        plugged: rest % 2 == 1,
        contiguous: true,
    }
}

/// Legacy history loaded into memory
#[derive(Debug, Clone)]
pub struct LegacyArchive {
    index: u16,
    count: u16,
    values: [u32; LEGACY_CAPACITY],
    /// Values actually present in storage, from the start of the array
    loaded: usize,
}

impl LegacyArchive {
    pub fn exists<S: Storage>(storage: &S) -> bool {
        storage.exists(LEGACY_INDEX_KEY)
    }

    /// Read the legacy keys and delete them.
    ///
    /// The keys are removed even when the archive turns out to be unreadable,
    /// so a bad archive is only ever seen once.
    pub fn take<S: Storage>(storage: &mut S) -> Result<Self, RecorderError> {
        let loaded = Self::load(storage);
        for key in LEGACY_INDEX_KEY..=LEGACY_LAST_KEY {
            storage.delete(key)?;
        }
        loaded
    }

    fn load<S: Storage>(storage: &S) -> Result<Self, RecorderError> {
        let index = storage
            .read_i32(LEGACY_INDEX_KEY)?
            .ok_or(RecorderError::MalformedLegacyData("missing write index"))?;
        let count = storage
            .read_i32(LEGACY_COUNT_KEY)?
            .ok_or(RecorderError::MalformedLegacyData("missing value count"))?;

        let index = u16::try_from(index)
            .map_err(|_| RecorderError::MalformedLegacyData("write index out of range"))?;
        let count = u16::try_from(count)
            .map_err(|_| RecorderError::MalformedLegacyData("value count out of range"))?;

        let mut array = [0u8; ARRAY_LEN];
        let mut loaded_bytes = 0;
        for (chunk, key) in (LEGACY_FIRST_CHUNK_KEY..=LEGACY_LAST_KEY).enumerate() {
            let start = chunk * CHUNK_LEN;
            let end = (start + CHUNK_LEN).min(ARRAY_LEN);
            match storage.read(key, &mut array[start..end])? {
                Some(len) if len == end - start => loaded_bytes = end,
                _ => break,
            }
        }

        let mut values = [0u32; LEGACY_CAPACITY];
        for (value, bytes) in values.iter_mut().zip(array.chunks_exact(4)) {
            *value = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        }

        Ok(Self {
            index,
            count,
            values,
            loaded: loaded_bytes / 4,
        })
    }

    /// Replay the archive oldest-first into `ingest`.
    ///
    /// A full buffer is read circularly starting just after the write index.
    /// Replay stops at the first value that was not loaded.
    pub fn replay<F>(&self, mut ingest: F) -> Result<MigrationReport, RecorderError>
    where
        F: FnMut(Observation) -> Result<(), RecorderError>,
    {
        let (start, len) = if self.count as usize >= LEGACY_CAPACITY {
            (self.index as usize + 1, LEGACY_CAPACITY)
        } else {
            (0, self.count as usize)
        };

        let mut report = MigrationReport::default();
        for step in 0..len.min(MAX_ITERATIONS) {
            let idx = if len == LEGACY_CAPACITY {
                (start + step) % LEGACY_CAPACITY
            } else {
                start + step
            };
            if self.index as usize >= LEGACY_CAPACITY || idx >= self.loaded {
                report.truncated = true;
                break;
            }

            ingest(decode_value(self.values[idx]))?;
            report.imported += 1;
        }

        if report.truncated {
            warn!(
                "Legacy history truncated after {} of {} values",
                report.imported, len
            );
        } else {
            info!("Imported {} legacy values", report.imported);
        }
        Ok(report)
    }
}
