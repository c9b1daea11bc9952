//! Human-readable dump of the recorder state for debugging.
//!
//! Timestamps are Unix epochs, charge rates are seconds per percent and a
//! value of -1 marks a statistic that is not available.

use alloc::string::String;
use core::fmt::{self, Write};

use log::info;

use crate::error::RecorderError;
use crate::recorder::{Platform, Recorder};
use crate::storage::Storage;

const RULE: &str = "-----------------------------------------------------";

/// Render the statistics header, the cycle table and the raw record table
pub fn write_report<S, P, W>(recorder: &mut Recorder<S, P>, out: &mut W) -> Result<(), RecorderError>
where
    S: Storage,
    P: Platform,
    W: Write,
{
    let now = recorder.platform().now() as i64;
    let point = recorder.current_point()?;
    let life_remaining = recorder.life_remaining()?;
    let max_life = recorder.max_life(0)?.unwrap_or(-1);
    let record = recorder.record_run_time()?;
    let battery_percent = recorder.battery_percent()?;
    let percent_per_day = recorder.percent_per_day()?.unwrap_or(-1);

    writeln!(out, "==================== Statistics ====================")?;
    writeln!(out, "Current Time:\t{}", now)?;
    writeln!(out, "Last Charged:\t{}", recorder.last_charged_time().unwrap_or(-1))?;
    writeln!(out, "Time Remaining:\t{}", life_remaining)?;
    writeln!(out, "Maximum Life:\t{}", max_life)?;
    writeln!(out, "Run Time:\t{}", recorder.run_time(0).unwrap_or(-1))?;
    writeln!(out, "Record Life:\t{}", record)?;
    writeln!(out, "Battery Percent:\t{}", battery_percent)?;
    writeln!(out, "Percent per Day:\t{}", percent_per_day)?;
    writeln!(out, "Charge Rate:\t{}", point.charge_rate)?;

    writeln!(out, "------------------- Charge Cycles -------------------")?;
    writeln!(out, "Charge Start,\tRun Start,\tRun Stop,\tAvg Charge Rate,")?;
    for cycle in recorder.cycles() {
        writeln!(out, "{}", cycle)?;
    }
    let cycle_count = recorder.cycles().len();

    writeln!(out, "---------------------- Raw Data ---------------------")?;
    writeln!(out, "Epoch,\t\tPerc,\tChar,\tPlug,\tContig,\tCharge Rate,")?;
    let mut point_count = 0;
    for point in recorder.history(0) {
        let point = point?;
        let obs = point.observation;
        writeln!(
            out,
            "{},\t{},\t{},\t{},\t{},\t{},",
            obs.epoch,
            obs.percent,
            obs.charging as u8,
            obs.plugged as u8,
            obs.contiguous as u8,
            point.charge_rate
        )?;
        point_count += 1;
    }

    writeln!(out, "{}", RULE)?;
    writeln!(out, "Charge Cycle Count: {}", cycle_count)?;
    writeln!(out, "Data Point Count: {}", point_count)?;
    Ok(())
}

/// Send the report to the log, one record per line
pub fn log_report<S: Storage, P: Platform>(recorder: &mut Recorder<S, P>) -> Result<(), RecorderError> {
    let mut sink = LogLines::default();
    write_report(recorder, &mut sink)?;
    sink.flush();
    Ok(())
}

/// Buffers formatted text and logs each completed line
#[derive(Default)]
struct LogLines {
    line: String,
}

impl LogLines {
    fn flush(&mut self) {
        if !self.line.is_empty() {
            info!("{}", self.line);
            self.line.clear();
        }
    }
}

impl Write for LogLines {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut rest = s;
        while let Some(end) = rest.find('\n') {
            self.line.push_str(&rest[..end]);
            info!("{}", self.line);
            self.line.clear();
            rest = &rest[end + 1..];
        }
        self.line.push_str(rest);
        Ok(())
    }
}
