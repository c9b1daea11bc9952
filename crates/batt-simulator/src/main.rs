//! Desktop simulator for the batt-rs recorder.
//!
//! Runs a synthetic battery through several days of discharge and charge on a
//! simulated clock, sampling it the way the recording worker would. Along the
//! way it reboots the worker (leaving a gap in the history), requests a
//! snapshot over the storage mailbox and logs the diagnostic report. A second
//! run on a size-limited store shows old blocks being evicted.
//!
//! Set `RUST_LOG=debug` to follow block rollover and segmentation.

use core::cell::{Cell, RefCell};

use embedded_hal_async::delay::DelayNs;
use log::{error, info, warn};

use batt_rs::config::SEC_IN_HR;
use batt_rs::ipc::{MessageChannel, WorkerMessage, request_snapshot};
use batt_rs::storage::MemoryStorage;
use batt_rs::{BatteryState, Platform, Recorder, RecorderConfig, RecorderError};

// ---------------------------------------------------------------------------
// Simulation constants
// ---------------------------------------------------------------------------

/// Simulated start time (2024-01-01T00:00:00Z)
const START_EPOCH: u32 = 1_704_067_200;

/// Interval between battery samples
const SAMPLE_INTERVAL_SECS: u32 = 300;

/// Simulated days before and after the reboot
const DAYS_BEFORE_REBOOT: u32 = 4;
const DAYS_AFTER_REBOOT: u32 = 10;

/// Time the worker is down during the reboot
const REBOOT_GAP_SECS: u32 = 2 * SEC_IN_HR as u32;

/// Flash budget of the storage pressure run: about 8 blocks plus the small keys
const STORAGE_BUDGET: usize = 8 * 256 + 128;

/// Simulated days of the storage pressure run
const PRESSURE_DAYS: u32 = 6;

/// Percent lost per hour while discharging
const DRAIN_PER_HOUR: f64 = 4.0;

/// Percent gained per hour while charging
const CHARGE_PER_HOUR: f64 = 90.0;

/// Level at which the simulated user plugs the charger in
const PLUG_IN_LEVEL: f64 = 15.0;

// ---------------------------------------------------------------------------
// Synthetic battery
// ---------------------------------------------------------------------------

/// Battery and clock shared by every recorder instance
struct SimPlatform {
    now: Cell<u32>,
    level: Cell<f64>,
    charging: Cell<bool>,
}

impl SimPlatform {
    fn new() -> Self {
        Self {
            now: Cell::new(START_EPOCH),
            level: Cell::new(100.0),
            charging: Cell::new(false),
        }
    }

    /// Advance the clock and the battery model by `secs`
    fn advance(&self, secs: u32) {
        let now = self.now.get() + secs;
        self.now.set(now);

        let hours = secs as f64 / SEC_IN_HR as f64;
        // Heavier use during the day
        let hour_of_day = (now / SEC_IN_HR as u32) % 24;
        let drain = if (8..22).contains(&hour_of_day) {
            DRAIN_PER_HOUR * 1.5
        } else {
            DRAIN_PER_HOUR * 0.5
        };

        let mut level = self.level.get();
        if self.charging.get() {
            level = (level + CHARGE_PER_HOUR * hours).min(100.0);
            if level >= 100.0 {
                self.charging.set(false);
            }
        } else {
            level = (level - drain * hours).max(0.0);
            if level <= PLUG_IN_LEVEL {
                self.charging.set(true);
            }
        }
        self.level.set(level);
    }
}

impl Platform for SimPlatform {
    fn now(&self) -> u32 {
        self.now.get()
    }

    fn battery(&self) -> BatteryState {
        let charging = self.charging.get();
        BatteryState {
            percent: self.level.get() as u8,
            charging,
            plugged: charging,
        }
    }
}

type Worker<'s, 'p> = Recorder<&'s RefCell<MemoryStorage>, &'p SimPlatform>;

// ---------------------------------------------------------------------------
// Worker helpers
// ---------------------------------------------------------------------------

fn open_worker<'s, 'p>(
    storage: &'s RefCell<MemoryStorage>,
    platform: &'p SimPlatform,
) -> Result<Worker<'s, 'p>, RecorderError> {
    let mut notifications = Vec::new();
    let worker = Recorder::open(storage, platform, RecorderConfig::default(), &mut notifications)?;
    report_notifications(&notifications);
    Ok(worker)
}

fn report_notifications(messages: &[WorkerMessage]) {
    for message in messages {
        if let WorkerMessage::AlertFired { index } = message {
            info!("Alert {} fired", index);
        }
    }
}

/// Sample the battery every interval for `days`
fn run_days(worker: &mut Worker<'_, '_>, platform: &SimPlatform, days: u32) {
    let samples = days * 24 * SEC_IN_HR as u32 / SAMPLE_INTERVAL_SECS;
    let mut stored = 0;
    let mut dropped = 0;

    for _ in 0..samples {
        platform.advance(SAMPLE_INTERVAL_SECS);

        let mut notifications = Vec::new();
        match worker.process_battery_state(&mut notifications) {
            Ok(Some(_)) => stored += 1,
            Ok(None) => {}
            Err(RecorderError::StorageFull { key }) => {
                warn!("Observation dropped, storage full at block {}", key);
                dropped += 1;
            }
            Err(err) => {
                error!("Recording failed: {}", err);
                dropped += 1;
            }
        }
        worker.poll_alerts(&mut notifications);
        report_notifications(&notifications);
    }

    info!(
        "{} days simulated: {} observations stored, {} dropped",
        days, stored, dropped
    );
}

fn log_storage_use(storage: &RefCell<MemoryStorage>) {
    let storage = storage.borrow();
    info!(
        "Storage holds {} bytes in {} keys",
        storage.used_bytes(),
        storage.keys().count()
    );
}

/// Runs the worker between foreground polls of the mailbox
struct WorkerPump<'a, 's, 'p> {
    channel: &'a MessageChannel,
    worker: &'a mut Worker<'s, 'p>,
}

impl DelayNs for WorkerPump<'_, '_, '_> {
    async fn delay_ns(&mut self, _ns: u32) {
        while let Ok(message) = self.channel.try_receive() {
            let mut notifications = Vec::new();
            if let Err(err) = self.worker.handle_message(message, &mut notifications) {
                error!("Worker failed to handle {:?}: {}", message, err);
            }
        }
        if let Err(err) = self.worker.service_mailbox() {
            error!("Mailbox write failed: {}", err);
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("Starting batt-rs simulator");

    let storage = RefCell::new(MemoryStorage::new());
    let platform = SimPlatform::new();

    let mut worker = match open_worker(&storage, &platform) {
        Ok(worker) => worker,
        Err(err) => {
            error!("Failed to open recorder: {}", err);
            return;
        }
    };
    run_days(&mut worker, &platform, DAYS_BEFORE_REBOOT);

    // --- Reboot -----------------------------------------------------------
    drop(worker);
    info!("Worker down for {} s", REBOOT_GAP_SECS);
    platform.advance(REBOOT_GAP_SECS);

    let mut worker = match open_worker(&storage, &platform) {
        Ok(worker) => worker,
        Err(err) => {
            error!("Failed to reopen recorder: {}", err);
            return;
        }
    };
    run_days(&mut worker, &platform, DAYS_AFTER_REBOOT);

    log_storage_use(&storage);

    // --- Snapshot handshake -----------------------------------------------
    let channel = MessageChannel::new();
    let mut sender = channel.sender();
    let mut foreground = &storage;
    let handshake = worker.config().handshake;
    let mut pump = WorkerPump {
        channel: &channel,
        worker: &mut worker,
    };

    match embassy_futures::block_on(request_snapshot(
        &mut foreground,
        &mut sender,
        &mut pump,
        0,
        &handshake,
    )) {
        Ok(snapshot) => {
            info!(
                "Snapshot: rate {} s/%, empty at {}, record life {} s",
                snapshot.charge_rate, snapshot.charge_by_time, snapshot.record_run_time
            );
            for (index, run_time) in snapshot.run_times.iter().enumerate() {
                info!("Cycle {}: run time {:?}", index + 1, run_time);
            }
            info!("Snapshot carries {} points", snapshot.points.len());
        }
        Err(err) => error!("Snapshot request failed: {}", err),
    }

    // --- Diagnostic export ------------------------------------------------
    if let Err(err) = worker.handle_message(WorkerMessage::ExportRequest, &mut Vec::new()) {
        error!("Export failed: {}", err);
    }

    drop(worker);

    // --- Storage pressure -------------------------------------------------
    info!("Recording into a {} byte store", STORAGE_BUDGET);
    let storage = RefCell::new(MemoryStorage::with_capacity(STORAGE_BUDGET));
    let platform = SimPlatform::new();
    match open_worker(&storage, &platform) {
        Ok(mut worker) => {
            run_days(&mut worker, &platform, PRESSURE_DAYS);
            log_storage_use(&storage);
            match worker.store().newest_key() {
                Ok(Some(newest)) => info!(
                    "Blocks {}..={} survive",
                    worker.store().oldest_key(newest),
                    newest
                ),
                Ok(None) => warn!("No blocks survive"),
                Err(err) => error!("Cannot read block pointer: {}", err),
            }
        }
        Err(err) => error!("Failed to open recorder: {}", err),
    }

    info!("Simulator exiting");
}
