//! Statistics derived from the observation history

pub mod cycles;
pub mod estimator;

pub use cycles::{ChargeCycle, Segmenter};
