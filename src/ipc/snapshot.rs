//! Read-only statistics snapshot handed to the foreground.
//!
//! Encoded as a version byte followed by the postcard serialization of
//! [`Snapshot`].

use alloc::vec::Vec;

use serde::{Deserialize, Serialize};

use crate::alerts::MAX_ALERTS;
use crate::error::RecorderError;

pub const SNAPSHOT_VERSION: u8 = 1;

/// Past cycles included in a snapshot
pub const SNAPSHOT_CYCLES: usize = 9;

/// History points included in a snapshot
pub const SNAPSHOT_POINTS: usize = 50;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SnapshotPoint {
    pub epoch: u32,
    pub percent: u8,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Snapshot {
    /// Current charge rate (seconds per percent)
    pub charge_rate: i32,
    /// Projected time of reaching 0%
    pub charge_by_time: i64,
    /// When the current run started, `None` while charging
    pub last_charged_time: Option<i64>,
    pub record_run_time: i64,
    pub alert_thresholds: heapless::Vec<i32, MAX_ALERTS>,
    /// Run times of past cycles, newest first
    pub run_times: heapless::Vec<Option<i64>, SNAPSHOT_CYCLES>,
    /// Max lives of past cycles, newest first
    pub max_lives: heapless::Vec<Option<i64>, SNAPSHOT_CYCLES>,
    /// History index of `points[0]`
    pub start_index: u16,
    pub points: heapless::Vec<SnapshotPoint, SNAPSHOT_POINTS>,
}

impl Snapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>, RecorderError> {
        let mut bytes = Vec::with_capacity(256);
        bytes.push(SNAPSHOT_VERSION);
        bytes.extend_from_slice(&postcard::to_allocvec(self)?);
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RecorderError> {
        match bytes.split_first() {
            Some((&SNAPSHOT_VERSION, body)) => Ok(postcard::from_bytes(body)?),
            Some((&version, _)) => Err(RecorderError::UnsupportedVersion(version)),
            None => Err(RecorderError::Serialization),
        }
    }
}
