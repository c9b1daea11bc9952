//! Recorder configuration
//!
//! Every empirically chosen constant of the recorder lives here so it can be
//! calibrated against real device data without touching the algorithms.

use embassy_time::Duration;
use serde::{Deserialize, Serialize};

use crate::error::RecorderError;

pub const SEC_IN_MIN: i32 = 60;
pub const SEC_IN_HR: i32 = 3_600;
pub const SEC_IN_DAY: i32 = 86_400;

/// Hardware family, used to seed the charge rate before any history exists.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceProfile {
    /// Roughly 7% per day
    #[default]
    Standard,
    /// Larger battery, roughly 10% per day
    Steel,
    /// Small round battery, roughly 2% per day
    Round,
}

impl DeviceProfile {
    /// Default discharge rate in seconds per percent (always negative)
    pub const fn default_charge_rate(self) -> i32 {
        match self {
            Self::Steel => -10 * SEC_IN_DAY / 100,
            Self::Round => -2 * SEC_IN_DAY / 100,
            Self::Standard => -7 * SEC_IN_DAY / 100,
        }
    }
}

/// A fraction `num / den` applied with integer arithmetic.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fraction {
    pub num: i32,
    pub den: i32,
}

impl Fraction {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// Scale a value by this fraction. Returns 0 for a zero denominator.
    pub fn apply(self, value: i64) -> i64 {
        if self.den == 0 {
            return 0;
        }
        value * self.num as i64 / self.den as i64
    }
}

/// Parameters of the reboot-gap heuristic used when an observation is not
/// flagged contiguous.
///
/// A pair is still treated as contiguous when the new point arrives no later
/// than `projection_percent` points of discharge at the current rate would
/// predict, give or take `1 / tolerance_divisor` of the observed interval.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContiguityHeuristic {
    pub projection_percent: i32,
    pub tolerance_divisor: i32,
}

impl Default for ContiguityHeuristic {
    fn default() -> Self {
        Self {
            projection_percent: 10,
            tolerance_divisor: 2,
        }
    }
}

/// Minimum run durations used by the charge-cycle segmenter
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentThresholds {
    /// Charging shorter than this (seconds) is treated as a brief plug-in
    pub charging_min_secs: i32,
    /// Discharging shorter than this (seconds) is treated as a brief unplug
    pub discharging_min_secs: i32,
    /// Gaps shorter than this (seconds) do not split a cycle
    pub not_contiguous_min_secs: i32,
    /// Finished cycles that ran for less than this fraction of their own
    /// projected max life are dropped
    pub discharging_min_fraction: Fraction,
}

impl Default for SegmentThresholds {
    fn default() -> Self {
        Self {
            charging_min_secs: SEC_IN_MIN,
            discharging_min_secs: 5 * SEC_IN_MIN,
            not_contiguous_min_secs: 45,
            discharging_min_fraction: Fraction::new(1, 10),
        }
    }
}

/// Timing of the foreground snapshot request
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeConfig {
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
}

impl HandshakeConfig {
    /// Number of mailbox polls before the request is abandoned
    pub fn max_polls(&self) -> u32 {
        let interval = self.poll_interval.as_micros().max(1);
        (self.timeout.as_micros() / interval).clamp(1, u32::MAX as u64) as u32
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            timeout: Duration::from_secs(2),
        }
    }
}

/// Top-level recorder configuration
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecorderConfig {
    pub profile: DeviceProfile,
    /// Blocks loaded per cache reload
    pub cache_block_count: usize,
    /// Charge cycles kept after segmentation
    pub max_cycle_count: usize,
    pub thresholds: SegmentThresholds,
    pub contiguity: ContiguityHeuristic,
    /// Alerts created on first launch (seconds before empty)
    pub default_alerts: [i32; 2],
    pub handshake: HandshakeConfig,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            profile: DeviceProfile::Standard,
            cache_block_count: 3,
            max_cycle_count: 9,
            thresholds: SegmentThresholds::default(),
            contiguity: ContiguityHeuristic::default(),
            default_alerts: [4 * SEC_IN_HR, SEC_IN_DAY],
            handshake: HandshakeConfig::default(),
        }
    }
}

impl RecorderConfig {
    pub fn default_charge_rate(&self) -> i32 {
        self.profile.default_charge_rate()
    }

    /// Reject configurations the algorithms cannot run with
    pub fn validate(&self) -> Result<(), RecorderError> {
        if self.cache_block_count == 0 {
            return Err(RecorderError::InvalidConfig("cache_block_count must be at least 1"));
        }
        if self.max_cycle_count == 0 {
            return Err(RecorderError::InvalidConfig("max_cycle_count must be at least 1"));
        }
        if self.contiguity.tolerance_divisor <= 0 {
            return Err(RecorderError::InvalidConfig("tolerance_divisor must be positive"));
        }
        if self.thresholds.discharging_min_fraction.den <= 0 {
            return Err(RecorderError::InvalidConfig(
                "discharging_min_fraction denominator must be positive",
            ));
        }
        if self.handshake.poll_interval.as_micros() == 0 {
            return Err(RecorderError::InvalidConfig("poll_interval must be non-zero"));
        }
        Ok(())
    }
}

mod duration_ms {
    use embassy_time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
