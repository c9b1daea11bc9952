//! Battery telemetry recorder core
//!
//! This crate contains the data library of a battery history recorder for a
//! small wearable: the bit-packed observation format, the block-oriented
//! persistence layer, the index-addressable history cache, the charge-rate
//! estimator and the charge-cycle segmenter, plus the alert scheduler and the
//! snapshot handshake used to hand statistics to a foreground process.
//!
//! It is `#![no_std]` with `extern crate alloc` so it compiles on both
//! embedded targets and desktop hosts (for the simulator and tests).

#![no_std]

extern crate alloc;

pub mod alerts;
pub mod config;
pub mod error;
pub mod export;
pub mod history;
pub mod ipc;
pub mod legacy;
pub mod recorder;
pub mod stats;
pub mod storage;

pub use config::RecorderConfig;
pub use error::RecorderError;
pub use recorder::{BatteryState, Platform, Recorder};
pub use storage::{Observation, Storage, StorageError};
