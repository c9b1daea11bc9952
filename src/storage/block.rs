//! Fixed-size persisted block of observations.
//!
//! Binary format (256 bytes, little-endian):
//! - version: 1 byte
//! - initial_charge_rate: 3 bytes (i24, two's complement)
//! - count: 2 bytes (u16, record count in the top 6 bits)
//! - records: 250 bytes (50 x 5-byte packed observations)
//!
//! Short buffers are accepted on decode as long as they cover `count`
//! records, so partially written blocks from older firmware still load.

use heapless::Vec;

use super::record::{Observation, RECORD_SIZE};
use crate::error::RecorderError;

/// Observations per block
pub const BLOCK_CAPACITY: usize = 50;

/// Header length in bytes
pub const HEADER_SIZE: usize = 6;

/// Encoded block length in bytes
pub const BLOCK_SIZE: usize = HEADER_SIZE + BLOCK_CAPACITY * RECORD_SIZE;

/// Current block format version
pub const FORMAT_VERSION: u8 = 0;

const COUNT_SHIFT: u16 = 10;
const I24_MIN: i32 = -(1 << 23);
const I24_MAX: i32 = (1 << 23) - 1;

/// A decoded block
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Block {
    /// Charge rate in effect at the block's first record
    pub initial_charge_rate: i32,
    pub records: Vec<Observation, BLOCK_CAPACITY>,
}

impl Block {
    pub fn new(initial_charge_rate: i32) -> Self {
        Self {
            initial_charge_rate,
            records: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.records.is_full()
    }

    /// Append a record, handing it back if the block is full
    pub fn push(&mut self, obs: Observation) -> Result<(), Observation> {
        self.records.push(obs)
    }

    /// Encode to the persisted format.
    ///
    /// Rates outside the 24-bit range saturate.
    pub fn to_bytes(&self) -> [u8; BLOCK_SIZE] {
        let mut bytes = [0u8; BLOCK_SIZE];

        bytes[0] = FORMAT_VERSION;

        let rate = self.initial_charge_rate.clamp(I24_MIN, I24_MAX);
        bytes[1..4].copy_from_slice(&rate.to_le_bytes()[..3]);

        let count = (self.records.len() as u16) << COUNT_SHIFT;
        bytes[4..6].copy_from_slice(&count.to_le_bytes());

        for (i, obs) in self.records.iter().enumerate() {
            let offset = HEADER_SIZE + i * RECORD_SIZE;
            bytes[offset..offset + RECORD_SIZE].copy_from_slice(&obs.to_bytes());
        }

        bytes
    }

    /// Decode a block read from `key`
    pub fn from_bytes(key: u32, bytes: &[u8]) -> Result<Self, RecorderError> {
        if bytes.len() < HEADER_SIZE {
            return Err(RecorderError::CorruptBlock(key));
        }
        if bytes[0] != FORMAT_VERSION {
            return Err(RecorderError::UnsupportedVersion(bytes[0]));
        }

        let raw = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], 0]);
        let initial_charge_rate = ((raw << 8) as i32) >> 8;

        let count = (u16::from_le_bytes([bytes[4], bytes[5]]) >> COUNT_SHIFT) as usize;
        if count > BLOCK_CAPACITY || bytes.len() < HEADER_SIZE + count * RECORD_SIZE {
            return Err(RecorderError::CorruptBlock(key));
        }

        let mut records = Vec::new();
        for i in 0..count {
            let offset = HEADER_SIZE + i * RECORD_SIZE;
            let mut packed = [0u8; RECORD_SIZE];
            packed.copy_from_slice(&bytes[offset..offset + RECORD_SIZE]);
            records
                .push(Observation::from_bytes(&packed))
                .map_err(|_| RecorderError::CorruptBlock(key))?;
        }

        Ok(Self {
            initial_charge_rate,
            records,
        })
    }
}
