//! Packed battery observation.
//!
//! Binary format (5 bytes, little-endian u40):
//! - bits 0..30: seconds since [`EPOCH_BASE`]
//! - bits 30..37: charge percent (0..=100)
//! - bit 37: charging
//! - bit 38: plugged
//! - bit 39: contiguous with the previous observation

use core::fmt;

use serde::{Deserialize, Serialize};

/// 2015-01-01T00:00:00Z, the zero point of packed timestamps
pub const EPOCH_BASE: u32 = 1_420_070_400;

/// Size of one packed observation in bytes
pub const RECORD_SIZE: usize = 5;

const EPOCH_BITS: u32 = 30;
const EPOCH_MASK: u64 = (1 << EPOCH_BITS) - 1;
const PERCENT_SHIFT: u32 = 30;
const PERCENT_MASK: u64 = 0x7f;
const CHARGING_BIT: u32 = 37;
const PLUGGED_BIT: u32 = 38;
const CONTIGUOUS_BIT: u32 = 39;

/// A single battery observation
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Observation {
    /// Unix seconds
    pub epoch: u32,
    pub percent: u8,
    pub charging: bool,
    pub plugged: bool,
    /// Recorded without a power interruption since the previous observation
    pub contiguous: bool,
}

impl Observation {
    pub fn new(epoch: u32, percent: u8, charging: bool, plugged: bool, contiguous: bool) -> Self {
        Self {
            epoch,
            percent,
            charging,
            plugged,
            contiguous,
        }
    }

    /// Pack into the 5-byte storage format.
    ///
    /// Epochs clamp to the 30-bit range above [`EPOCH_BASE`] and
    /// percentages clamp to 100.
    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let offset = (self.epoch.saturating_sub(EPOCH_BASE) as u64).min(EPOCH_MASK);
        let percent = self.percent.min(100) as u64;

        let mut packed = offset | (percent << PERCENT_SHIFT);
        if self.charging {
            packed |= 1 << CHARGING_BIT;
        }
        if self.plugged {
            packed |= 1 << PLUGGED_BIT;
        }
        if self.contiguous {
            packed |= 1 << CONTIGUOUS_BIT;
        }

        let le = packed.to_le_bytes();
        let mut bytes = [0u8; RECORD_SIZE];
        bytes.copy_from_slice(&le[..RECORD_SIZE]);
        bytes
    }

    /// Unpack from the 5-byte storage format
    pub fn from_bytes(bytes: &[u8; RECORD_SIZE]) -> Self {
        let mut le = [0u8; 8];
        le[..RECORD_SIZE].copy_from_slice(bytes);
        let packed = u64::from_le_bytes(le);

        Self {
            epoch: (packed & EPOCH_MASK) as u32 + EPOCH_BASE,
            percent: ((packed >> PERCENT_SHIFT) & PERCENT_MASK) as u8,
            charging: packed & (1 << CHARGING_BIT) != 0,
            plugged: packed & (1 << PLUGGED_BIT) != 0,
            contiguous: packed & (1 << CONTIGUOUS_BIT) != 0,
        }
    }
}

impl fmt::Display for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}%", self.epoch, self.percent)?;
        if self.charging {
            write!(f, " charging")?;
        }
        if self.plugged {
            write!(f, " plugged")?;
        }
        if !self.contiguous {
            write!(f, " (gap)")?;
        }
        Ok(())
    }
}
