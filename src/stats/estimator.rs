//! Charge-rate estimator
//!
//! The charge rate is a smoothed discharge speed in seconds per percent. It
//! is always negative: a battery losing 1% every 864 s has a rate of -864.
//!
//! Each contiguous discharging pair of observations moves the rate 1/5 of
//! the way toward the pair's own interval:
//!
//! ```text
//! rate' = rate * 4 / 5 + ((new.epoch - old.epoch) / (new.percent - old.percent)) / 5
//! ```
//!
//! All divisions truncate toward zero. For a battery that steadily loses 1%
//! every `x` seconds the rate settles within `[-x, -x + 10)`, slightly
//! optimistic but never drifting further.

use crate::config::{ContiguityHeuristic, SEC_IN_DAY};
use crate::storage::Observation;

/// Whether `new` followed `old` without the recorder being interrupted.
///
/// The `contiguous` flag is trusted when set. Otherwise the pair is judged
/// with a heuristic: if the old point was contiguous, no charge was gained,
/// and the new point arrived close to when the current `rate` predicts, the
/// gap is assumed to be a restart that lost no battery activity.
pub fn are_contiguous(
    old: &Observation,
    new: &Observation,
    rate: i32,
    heuristic: &ContiguityHeuristic,
) -> bool {
    if new.contiguous {
        return true;
    }
    if !old.contiguous || new.percent > old.percent {
        return false;
    }

    let old_epoch = old.epoch as i64;
    let new_epoch = new.epoch as i64;
    let predicted = old_epoch - heuristic.projection_percent as i64 * rate as i64;
    let divisor = heuristic.tolerance_divisor.max(1) as i64;

    new_epoch < predicted || new_epoch - predicted < (new_epoch - old_epoch) / divisor
}

/// Fold the pair `(old, new)` into `rate`.
///
/// The rate is returned unchanged unless time advanced, the percent dropped,
/// neither point was charging and the pair is contiguous.
pub fn next_rate(
    old: &Observation,
    new: &Observation,
    rate: i32,
    heuristic: &ContiguityHeuristic,
) -> i32 {
    if new.epoch <= old.epoch
        || new.percent >= old.percent
        || new.charging
        || old.charging
        || !are_contiguous(old, new, rate, heuristic)
    {
        return rate;
    }

    let elapsed = (new.epoch - old.epoch) as i64;
    let dropped = new.percent as i64 - old.percent as i64;
    let updated = rate as i64 * 4 / 5 + (elapsed / dropped) / 5;
    updated.clamp(i32::MIN as i64, 0) as i32
}

/// Seconds a full charge lasts at `rate`
pub fn max_life(rate: i32) -> i64 {
    rate as i64 * -100
}

/// Percent of battery used per day for a given max life, `None` when the
/// max life is too short to express
pub fn percent_per_day(max_life: i64) -> Option<i32> {
    let days_scaled = max_life * 100 / SEC_IN_DAY as i64;
    if days_scaled == 0 {
        return None;
    }
    Some((10_000 / days_scaled) as i32)
}

/// Unix time at which the battery reaches 0% if it keeps discharging at
/// `rate` from `obs`
pub fn charge_by_time(obs: &Observation, rate: i32) -> i64 {
    obs.epoch as i64 + obs.percent as i64 * -(rate as i64)
}

/// Estimate the live percent by extrapolating from the last observation.
///
/// The estimate never exceeds the observed percent and never falls more than
/// 9 points below it, so a wrong rate cannot cause implausible jumps. It is
/// floored at 1%.
pub fn estimated_percent(obs: &Observation, rate: i32, now: u32) -> u8 {
    if rate == 0 {
        return obs.percent;
    }

    let observed = obs.percent as i64;
    let mut percent = observed + (now as i64 - obs.epoch as i64) / rate as i64;
    if percent > observed {
        percent = observed;
    } else if percent <= observed - 10 {
        percent = observed - 9;
    }

    percent.clamp(1, 100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discharging(epoch: u32, percent: u8) -> Observation {
        Observation::new(epoch, percent, false, false, true)
    }

    #[test]
    fn test_rate_update_uses_ema() {
        let heuristic = ContiguityHeuristic::default();
        let old = discharging(1_500_000_000, 50);
        let new = discharging(1_500_003_600, 40);

        // -6048 * 4 / 5 + (3600 / -10) / 5
        assert_eq!(next_rate(&old, &new, -6048, &heuristic), -4910);
    }

    #[test]
    fn test_rate_unchanged_without_discharge() {
        let heuristic = ContiguityHeuristic::default();
        let old = discharging(1_500_000_000, 50);

        let same = discharging(1_500_003_600, 50);
        assert_eq!(next_rate(&old, &same, -864, &heuristic), -864);

        let gained = discharging(1_500_003_600, 60);
        assert_eq!(next_rate(&old, &gained, -864, &heuristic), -864);

        let mut charging = discharging(1_500_003_600, 40);
        charging.charging = true;
        assert_eq!(next_rate(&old, &charging, -864, &heuristic), -864);

        let earlier = discharging(1_499_999_000, 40);
        assert_eq!(next_rate(&old, &earlier, -864, &heuristic), -864);
    }

    #[test]
    fn test_rate_stays_negative() {
        let heuristic = ContiguityHeuristic::default();
        let mut rate = -1;
        let mut prev = discharging(1_500_000_000, 100);
        for i in 1..100u32 {
            let next = discharging(1_500_000_000 + i * (1 + i % 7), 100 - i as u8);
            rate = next_rate(&prev, &next, rate, &heuristic);
            assert!(rate <= 0);
            prev = next;
        }
    }

    #[test]
    fn test_truncation_bias_is_bounded() {
        let heuristic = ContiguityHeuristic::default();
        for interval in [60u32, 864, 3_600, 6_047, 20_000] {
            for initial in [-6048, -1, -100_000] {
                let mut rate = initial;
                let mut prev = discharging(1_500_000_000, 100);
                for _ in 0..300 {
                    // Jumping back to 100% leaves the rate untouched
                    let percent = if prev.percent > 1 { prev.percent - 1 } else { 100 };
                    let next = discharging(prev.epoch + interval, percent);
                    rate = next_rate(&prev, &next, rate, &heuristic);
                    prev = next;
                }
                let x = interval as i32;
                assert!(rate >= -x && rate < -x + 10, "interval {} settled at {}", x, rate);
            }
        }
    }

    #[test]
    fn test_gap_within_prediction_is_contiguous() {
        let heuristic = ContiguityHeuristic::default();
        let old = discharging(1_500_000_000, 80);
        let mut new = discharging(1_500_000_000 + 3_000, 79);
        new.contiguous = false;

        // Predicted 10% later: 8640 s at -864 s/%
        assert!(are_contiguous(&old, &new, -864, &heuristic));

        // Far beyond the prediction
        new.epoch = 1_500_000_000 + 100_000;
        assert!(!are_contiguous(&old, &new, -864, &heuristic));

        // Gaining charge across a gap is never contiguous
        new.epoch = 1_500_000_000 + 3_000;
        new.percent = 81;
        assert!(!are_contiguous(&old, &new, -864, &heuristic));
    }

    #[test]
    fn test_derived_quantities() {
        assert_eq!(max_life(-864), 86_400);
        assert_eq!(percent_per_day(86_400), Some(100));
        assert_eq!(percent_per_day(604_800), Some(14));
        assert_eq!(percent_per_day(0), None);
        assert_eq!(percent_per_day(500), None);

        let obs = discharging(1_500_000_000, 50);
        assert_eq!(charge_by_time(&obs, -864), 1_500_000_000 + 43_200);
    }

    #[test]
    fn test_estimated_percent_clamps() {
        let obs = discharging(1_500_000_000, 50);
        assert_eq!(estimated_percent(&obs, -864, 1_500_000_000), 50);
        assert_eq!(estimated_percent(&obs, -864, 1_500_000_000 + 864 * 3), 47);
        // Never more than 9 below the observation
        assert_eq!(estimated_percent(&obs, -864, 1_500_000_000 + 864 * 30), 41);
        // Clock went backwards
        assert_eq!(estimated_percent(&obs, -864, 1_499_000_000), 50);
        assert_eq!(estimated_percent(&obs, 0, 1_600_000_000), 50);

        let low = discharging(1_500_000_000, 2);
        assert_eq!(estimated_percent(&low, -864, 1_500_000_000 + 864 * 5), 1);
    }
}
