//! Charge-cycle segmentation
//!
//! Turns the observation history into discrete charge cycles. A cycle starts
//! when charging begins, its run starts when the battery is unplugged, and it
//! ends when the next charge begins.
//!
//! Segmentation runs in passes over the history:
//! 1. Walk newest-first, classifying every record against the one before it
//!    as charging, discharging or not contiguous (a gap in recording).
//! 2. Group consecutive records of the same kind into runs.
//! 3. Absorb runs shorter than their kind's minimum into the run before them,
//!    so a brief unplug does not split a charge.
//! 4. Fold the runs oldest-first into cycles and drop closed cycles that ran
//!    for only a small fraction of their projected max life.

use alloc::vec::Vec;
use core::fmt;

use log::debug;

use crate::config::{ContiguityHeuristic, RecorderConfig, SegmentThresholds};
use crate::error::RecorderError;
use crate::history::HistoryPoint;
use crate::stats::estimator;

/// One charge-then-discharge period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargeCycle {
    /// When charging began
    pub charge_epoch: u32,
    /// When discharging began
    pub discharge_epoch: u32,
    /// When the next charge began, `None` while the cycle is running
    pub end_epoch: Option<u32>,
    /// Mean charge rate while discharging
    pub avg_charge_rate: i32,
}

impl ChargeCycle {
    pub fn is_open(&self) -> bool {
        self.end_epoch.is_none()
    }

    /// Seconds spent discharging, measured up to `now` for an open cycle
    pub fn run_time(&self, now: u32) -> i64 {
        self.end_epoch.unwrap_or(now) as i64 - self.discharge_epoch as i64
    }

    pub fn max_life(&self) -> i64 {
        estimator::max_life(self.avg_charge_rate)
    }
}

impl fmt::Display for ChargeCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},\t{},\t{},\t{},",
            self.charge_epoch,
            self.discharge_epoch,
            self.end_epoch.unwrap_or(0),
            self.avg_charge_rate
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunKind {
    Charging,
    Discharging,
    NotContiguous,
}

/// Consecutive records of one kind
#[derive(Debug, Clone, Copy)]
struct Run {
    kind: RunKind,
    /// Epoch of the oldest record
    start: u32,
    /// Whether the oldest record was charging
    charging: bool,
    /// Charge rate at the oldest record
    opening_rate: i32,
    rate_sum: i64,
    rate_count: u32,
}

impl Run {
    fn new(kind: RunKind, point: &HistoryPoint) -> Self {
        let mut run = Self {
            kind,
            start: point.observation.epoch,
            charging: point.observation.charging,
            opening_rate: point.charge_rate,
            rate_sum: 0,
            rate_count: 0,
        };
        run.count_rate(point);
        run
    }

    /// Extend backwards in time with an older record
    fn extend_back(&mut self, point: &HistoryPoint) {
        self.start = point.observation.epoch;
        self.charging = point.observation.charging;
        self.opening_rate = point.charge_rate;
        self.count_rate(point);
    }

    fn count_rate(&mut self, point: &HistoryPoint) {
        if self.kind == RunKind::Discharging {
            self.rate_sum += point.charge_rate as i64;
            self.rate_count += 1;
        }
    }

    /// Take over a newer run's records
    fn absorb(&mut self, newer: &Run) {
        self.rate_sum += newer.rate_sum;
        self.rate_count += newer.rate_count;
    }
}

/// A cycle being assembled during the fold
struct OpenCycle {
    charge_epoch: u32,
    discharge_epoch: u32,
    opening_rate: i32,
    rate_sum: i64,
    rate_count: u32,
}

impl OpenCycle {
    fn open(charge_epoch: u32, run: &Run) -> Self {
        Self {
            charge_epoch,
            discharge_epoch: run.start,
            opening_rate: run.opening_rate,
            rate_sum: 0,
            rate_count: 0,
        }
    }

    fn add(&mut self, run: &Run) {
        self.rate_sum += run.rate_sum;
        self.rate_count += run.rate_count;
    }

    fn finish(self, end_epoch: Option<u32>) -> ChargeCycle {
        let avg_charge_rate = if self.rate_count > 0 {
            (self.rate_sum / self.rate_count as i64) as i32
        } else {
            self.opening_rate
        };
        ChargeCycle {
            charge_epoch: self.charge_epoch,
            discharge_epoch: self.discharge_epoch,
            end_epoch,
            avg_charge_rate,
        }
    }
}

/// Charge-cycle segmenter
#[derive(Debug, Clone, Copy)]
pub struct Segmenter {
    pub thresholds: SegmentThresholds,
    pub heuristic: ContiguityHeuristic,
    pub max_cycles: usize,
}

impl Segmenter {
    pub fn new(config: &RecorderConfig) -> Self {
        Self {
            thresholds: config.thresholds,
            heuristic: config.contiguity,
            max_cycles: config.max_cycle_count,
        }
    }

    fn min_duration(&self, kind: RunKind) -> u32 {
        let secs = match kind {
            RunKind::Charging => self.thresholds.charging_min_secs,
            RunKind::Discharging => self.thresholds.discharging_min_secs,
            RunKind::NotContiguous => self.thresholds.not_contiguous_min_secs,
        };
        secs.max(0) as u32
    }

    fn classify(&self, older: Option<&HistoryPoint>, point: &HistoryPoint) -> RunKind {
        if let Some(older) = older
            && !estimator::are_contiguous(
                &older.observation,
                &point.observation,
                older.charge_rate,
                &self.heuristic,
            )
        {
            return RunKind::NotContiguous;
        }
        if point.observation.charging {
            RunKind::Charging
        } else {
            RunKind::Discharging
        }
    }

    /// Segment a newest-first history into cycles, newest first.
    ///
    /// Reading stops early once enough charge boundaries are known. The
    /// newest cycle is kept regardless of its length unless `flush` is set.
    pub fn segment<I>(&self, points: I, flush: bool) -> Result<Vec<ChargeCycle>, RecorderError>
    where
        I: IntoIterator<Item = Result<HistoryPoint, RecorderError>>,
    {
        let runs = self.collect_runs(points)?;
        let runs = self.absorb_short_runs(runs);
        let mut cycles = Self::fold(&runs);

        cycles.reverse();

        let fraction = self.thresholds.discharging_min_fraction;
        let mut index = 0;
        cycles.retain(|cycle| {
            let exempt = index == 0 && !flush;
            index += 1;
            match cycle.end_epoch {
                Some(_) if !exempt => cycle.run_time(0) >= fraction.apply(cycle.max_life()),
                _ => true,
            }
        });
        cycles.truncate(self.max_cycles);

        debug!("Segmented {} runs into {} cycles", runs.len(), cycles.len());
        Ok(cycles)
    }

    /// Group the history into runs, returned oldest first
    fn collect_runs<I>(&self, points: I) -> Result<Vec<Run>, RecorderError>
    where
        I: IntoIterator<Item = Result<HistoryPoint, RecorderError>>,
    {
        let mut runs: Vec<Run> = Vec::new();
        let mut iter = points.into_iter();
        let Some(mut current) = iter.next().transpose()? else {
            return Ok(runs);
        };
        let mut charging_runs = 0;

        loop {
            let older = iter.next().transpose()?;
            let kind = self.classify(older.as_ref(), &current);

            match runs.last_mut() {
                Some(run) if run.kind == kind => run.extend_back(&current),
                _ => {
                    if kind == RunKind::Charging {
                        if charging_runs > self.max_cycles {
                            break;
                        }
                        charging_runs += 1;
                    }
                    runs.push(Run::new(kind, &current));
                }
            }

            match older {
                Some(point) => current = point,
                None => break,
            }
        }

        runs.reverse();
        Ok(runs)
    }

    /// Merge short runs into their predecessor. The newest run is still in
    /// progress and is never merged away.
    fn absorb_short_runs(&self, runs: Vec<Run>) -> Vec<Run> {
        let mut merged: Vec<Run> = Vec::with_capacity(runs.len());

        for (i, run) in runs.iter().enumerate() {
            let short = runs
                .get(i + 1)
                .is_some_and(|next| next.start.saturating_sub(run.start) < self.min_duration(run.kind));

            match merged.last_mut() {
                Some(last) if short || last.kind == run.kind => last.absorb(run),
                _ => merged.push(*run),
            }
        }

        merged
    }

    /// Fold oldest-first runs into cycles, oldest first
    fn fold(runs: &[Run]) -> Vec<ChargeCycle> {
        let mut cycles = Vec::new();
        let mut open: Option<OpenCycle> = None;
        let mut charge_start: Option<u32> = None;

        for run in runs {
            match run.kind {
                RunKind::Charging => Self::begin_charge(&mut cycles, &mut open, &mut charge_start, run),
                // Charger still attached after a gap: the charge goes on
                RunKind::NotContiguous if run.charging => {
                    Self::begin_charge(&mut cycles, &mut open, &mut charge_start, run)
                }
                RunKind::Discharging => {
                    open.get_or_insert_with(|| {
                        OpenCycle::open(charge_start.take().unwrap_or(run.start), run)
                    })
                    .add(run);
                }
                RunKind::NotContiguous => {
                    if let Some(cycle) = open.take() {
                        cycles.push(cycle.finish(Some(run.start)));
                    }
                    let mut cycle = OpenCycle::open(charge_start.take().unwrap_or(run.start), run);
                    cycle.add(run);
                    open = Some(cycle);
                }
            }
        }

        if let Some(cycle) = open {
            cycles.push(cycle.finish(None));
        }
        cycles
    }

    /// Close the running cycle at `run` and note when charging began.
    ///
    /// Back-to-back charging runs keep the earliest start.
    fn begin_charge(
        cycles: &mut Vec<ChargeCycle>,
        open: &mut Option<OpenCycle>,
        charge_start: &mut Option<u32>,
        run: &Run,
    ) {
        match open.take() {
            Some(cycle) => {
                cycles.push(cycle.finish(Some(run.start)));
                *charge_start = Some(run.start);
            }
            None => {
                charge_start.get_or_insert(run.start);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Observation;

    const B: u32 = 1_500_000_000;

    fn point(epoch: u32, percent: u8, charging: bool, rate: i32) -> HistoryPoint {
        HistoryPoint::new(Observation::new(epoch, percent, charging, charging, true), rate)
    }

    /// Feed chronological points to the segmenter newest-first
    fn segment(points: &[HistoryPoint], flush: bool) -> Vec<ChargeCycle> {
        let segmenter = Segmenter::new(&RecorderConfig::default());
        segmenter
            .segment(points.iter().rev().map(|p| Ok(*p)), flush)
            .unwrap()
    }

    #[test]
    fn test_single_cycle() {
        let points = [
            point(100, 40, true, -6048),
            point(200, 41, false, -6048),
            point(5000, 35, true, -6048),
        ];

        let cycles = segment(&points, false);
        assert_eq!(
            cycles,
            [ChargeCycle {
                charge_epoch: 100,
                discharge_epoch: 200,
                end_epoch: Some(5000),
                avg_charge_rate: -6048,
            }]
        );
    }

    #[test]
    fn test_flush_filters_newest_cycle() {
        let points = [
            point(100, 40, true, -6048),
            point(200, 41, false, -6048),
            point(5000, 35, true, -6048),
        ];
        assert!(segment(&points, true).is_empty());
    }

    #[test]
    fn test_brief_unplug_does_not_split_charge() {
        let points = [
            point(B, 20, true, -864),
            point(B + 1_000, 30, false, -864),
            point(B + 1_100, 30, true, -864),
            point(B + 2_000, 100, false, -864),
            point(B + 40_000, 60, false, -900),
            point(B + 90_000, 5, true, -900),
            point(B + 93_600, 60, false, -900),
        ];

        let cycles = segment(&points, false);
        assert_eq!(cycles.len(), 2);

        assert_eq!(cycles[0].charge_epoch, B + 90_000);
        assert_eq!(cycles[0].discharge_epoch, B + 93_600);
        assert!(cycles[0].is_open());

        assert_eq!(cycles[1].charge_epoch, B);
        assert_eq!(cycles[1].discharge_epoch, B + 2_000);
        assert_eq!(cycles[1].end_epoch, Some(B + 90_000));
        // The brief unplug belongs to the charge, so only the run's two
        // discharging records count
        assert_eq!(cycles[1].avg_charge_rate, (-864 - 900) / 2);
    }

    #[test]
    fn test_gap_splits_cycle() {
        let mut after_gap = point(B + 200_000, 50, false, -864);
        after_gap.observation.contiguous = false;
        let points = [
            point(B, 100, false, -864),
            point(B + 600, 99, false, -864),
            after_gap,
            point(B + 200_600, 49, false, -864),
        ];

        let cycles = segment(&points, false);
        assert_eq!(cycles.len(), 2);
        assert_eq!(cycles[0].discharge_epoch, B + 200_000);
        assert!(cycles[0].is_open());
        assert_eq!(cycles[1].discharge_epoch, B);
        assert_eq!(cycles[1].end_epoch, Some(B + 200_000));
    }

    #[test]
    fn test_charging_gap_continues_charge() {
        let mut after_restart = point(B + 43_660, 80, true, -864);
        after_restart.observation.contiguous = false;
        let points = [
            point(B, 100, false, -864),
            point(B + 40_000, 55, false, -864),
            point(B + 40_060, 55, true, -864),
            after_restart,
            point(B + 45_000, 100, true, -864),
            point(B + 46_000, 100, false, -864),
        ];

        let cycles = segment(&points, false);
        assert_eq!(cycles.len(), 2);
        assert_eq!(cycles[0].charge_epoch, B + 40_060);
        assert_eq!(cycles[0].discharge_epoch, B + 46_000);
        assert!(cycles[0].is_open());
        assert_eq!(cycles[1].discharge_epoch, B);
        assert_eq!(cycles[1].end_epoch, Some(B + 40_060));

        // Still on the charger: no cycle is running
        let cycles = segment(&points[..4], false);
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].end_epoch, Some(B + 40_060));
    }

    #[test]
    fn test_short_closed_cycles_are_dropped() {
        // At -864 s/% a full charge lasts 86400 s, so closed runs under
        // 8640 s are dropped
        let points = [
            point(B, 10, true, -864),
            point(B + 3_600, 100, false, -864),
            point(B + 53_600, 40, true, -864),
            point(B + 57_200, 100, false, -864),
            point(B + 59_200, 98, true, -864),
            point(B + 62_800, 100, false, -864),
            point(B + 82_800, 77, true, -864),
            point(B + 86_400, 100, false, -864),
            point(B + 87_000, 99, false, -864),
        ];

        let cycles = segment(&points, false);
        let discharges: Vec<u32> = cycles.iter().map(|c| c.discharge_epoch).collect();
        assert_eq!(discharges, [B + 86_400, B + 62_800, B + 3_600]);
        assert!(cycles[0].is_open());
        assert_eq!(cycles[1].run_time(0), 20_000);
        assert_eq!(cycles[2].run_time(0), 50_000);

        let fraction = SegmentThresholds::default().discharging_min_fraction;
        assert!(cycles.len() > 1);
        for cycle in cycles.iter().skip(1) {
            assert!(cycle.run_time(0) >= fraction.apply(cycle.max_life()));
        }
    }

    #[test]
    fn test_cycle_count_is_bounded() {
        let mut config = RecorderConfig::default();
        config.max_cycle_count = 2;
        let segmenter = Segmenter::new(&config);

        // Ten days of daily charges
        let mut points = Vec::new();
        for day in 0..10u32 {
            let start = B + day * 86_400;
            points.push(point(start, 10, true, -864));
            points.push(point(start + 3_600, 100, false, -864));
            points.push(point(start + 43_200, 50, false, -864));
        }

        let cycles = segmenter
            .segment(points.iter().rev().map(|p| Ok(*p)), false)
            .unwrap();
        assert_eq!(cycles.len(), 2);
        assert!(cycles[0].is_open());
        assert_eq!(cycles[1].end_epoch, Some(B + 9 * 86_400));
    }

    #[test]
    fn test_storage_error_propagates() {
        let segmenter = Segmenter::new(&RecorderConfig::default());
        let points = [
            Ok(point(B, 50, false, -864)),
            Err(RecorderError::CorruptBlock(1001)),
        ];
        assert_eq!(
            segmenter.segment(points, false),
            Err(RecorderError::CorruptBlock(1001))
        );
    }

    #[test]
    fn test_empty_history() {
        assert!(segment(&[], false).is_empty());
    }
}
