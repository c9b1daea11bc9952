//! Low-battery alerts
//!
//! Alerts are thresholds of remaining battery life in seconds. They are kept
//! sorted ascending and persisted under [`ALERTS_KEY`]. While the recorder
//! runs, each threshold is armed as an absolute deadline derived from the
//! projected time to empty.

use heapless::Vec;
use log::info;
use serde::{Deserialize, Serialize};

use crate::error::RecorderError;
use crate::storage::{ALERTS_KEY, Storage};

/// Maximum number of alerts
pub const MAX_ALERTS: usize = 4;

/// Persisted alert thresholds, ascending
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct AlertData {
    pub thresholds: Vec<i32, MAX_ALERTS>,
}

impl AlertData {
    pub fn load<S: Storage>(storage: &S) -> Result<Self, RecorderError> {
        let mut buf = [0u8; 32];
        match storage.read(ALERTS_KEY, &mut buf)? {
            Some(len) => Ok(postcard::from_bytes(&buf[..len])?),
            None => Ok(Self::default()),
        }
    }

    pub fn save<S: Storage>(&self, storage: &mut S) -> Result<(), RecorderError> {
        let mut buf = [0u8; 32];
        let bytes = postcard::to_slice(self, &mut buf)?;
        storage.write(ALERTS_KEY, bytes)?;
        Ok(())
    }
}

/// Alert thresholds plus the deadline each one is armed for
#[derive(Debug, Default)]
pub struct AlertScheduler {
    data: AlertData,
    /// Unix time each alert fires at, by threshold index
    deadlines: [Option<i64>; MAX_ALERTS],
}

/// Indices of alerts that fired during one call
pub type FiredAlerts = Vec<u8, MAX_ALERTS>;

impl AlertScheduler {
    pub fn load<S: Storage>(storage: &S) -> Result<Self, RecorderError> {
        Ok(Self {
            data: AlertData::load(storage)?,
            deadlines: [None; MAX_ALERTS],
        })
    }

    pub fn thresholds(&self) -> &[i32] {
        &self.data.thresholds
    }

    pub fn count(&self) -> usize {
        self.data.thresholds.len()
    }

    pub fn deadline(&self, index: usize) -> Option<i64> {
        self.deadlines.get(index).copied().flatten()
    }

    /// Earliest armed deadline
    pub fn next_deadline(&self) -> Option<i64> {
        self.deadlines.iter().flatten().min().copied()
    }

    /// Add an alert at `seconds` remaining and return its index.
    ///
    /// When the list is full the largest threshold is dropped first.
    pub fn schedule<S: Storage>(
        &mut self,
        storage: &mut S,
        seconds: i32,
    ) -> Result<usize, RecorderError> {
        if self.data.thresholds.is_full() {
            self.remove(MAX_ALERTS - 1);
        }

        let index = self
            .data
            .thresholds
            .iter()
            .position(|&threshold| seconds < threshold)
            .unwrap_or(self.data.thresholds.len());

        self.data
            .thresholds
            .insert(index, seconds)
            .map_err(|_| RecorderError::Serialization)?;
        self.deadlines[index..].rotate_right(1);
        self.deadlines[index] = None;

        self.data.save(storage)?;
        Ok(index)
    }

    /// Remove the alert at `index`. Returns false if there was none.
    pub fn unschedule<S: Storage>(
        &mut self,
        storage: &mut S,
        index: usize,
    ) -> Result<bool, RecorderError> {
        if index >= self.data.thresholds.len() {
            return Ok(false);
        }
        self.remove(index);
        self.data.save(storage)?;
        Ok(true)
    }

    fn remove(&mut self, index: usize) {
        self.data.thresholds.remove(index);
        self.deadlines[index..].rotate_left(1);
        self.deadlines[MAX_ALERTS - 1] = None;
    }

    /// Re-arm every alert against a new projection of `remaining` seconds.
    ///
    /// Armed alerts whose deadline has moved into the past fire immediately.
    /// Unarmed alerts are armed only if their deadline is still ahead.
    pub fn refresh(&mut self, remaining: i64, now: i64) -> FiredAlerts {
        let mut fired = FiredAlerts::new();

        for (index, &threshold) in self.data.thresholds.iter().enumerate() {
            let delay = remaining - threshold as i64;
            let deadline = &mut self.deadlines[index];

            if delay > 0 {
                *deadline = Some(now + delay);
            } else if deadline.take().is_some() {
                info!("Alert {} fired at {}s remaining", index, remaining);
                let _ = fired.push(index as u8);
            }
        }

        fired
    }

    /// Fire every armed alert whose deadline has passed
    pub fn poll(&mut self, now: i64) -> FiredAlerts {
        let mut fired = FiredAlerts::new();

        for (index, deadline) in self.deadlines.iter_mut().enumerate() {
            if deadline.is_some_and(|at| at <= now) {
                *deadline = None;
                info!("Alert {} fired", index);
                let _ = fired.push(index as u8);
            }
        }

        fired
    }
}
