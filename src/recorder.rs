//! The battery recorder
//!
//! [`Recorder`] owns the block store, the history cache, the charge-cycle
//! list and the alert timers of one process. The recording worker feeds it
//! battery states; a foreground process typically opens its own instance over
//! the same storage for read-only queries, or asks the worker for a
//! [`Snapshot`](crate::ipc::Snapshot).

use alloc::vec::Vec;

use log::{debug, error, info, warn};

use crate::alerts::AlertScheduler;
use crate::config::RecorderConfig;
use crate::error::RecorderError;
use crate::export;
use crate::history::{HistoryCursor, HistoryPoint, WindowCache};
use crate::ipc::snapshot::{SNAPSHOT_CYCLES, SNAPSHOT_POINTS};
use crate::ipc::{MessageSink, Snapshot, SnapshotPoint, SnapshotWriter, WorkerMessage};
use crate::legacy::LegacyArchive;
use crate::stats::{ChargeCycle, Segmenter, estimator};
use crate::storage::{BlockStore, Observation, RECORD_LIFE_KEY, Storage};

/// Live battery reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatteryState {
    pub percent: u8,
    pub charging: bool,
    pub plugged: bool,
}

impl BatteryState {
    fn matches(&self, obs: &Observation) -> bool {
        self.percent == obs.percent && self.charging == obs.charging && self.plugged == obs.plugged
    }
}

/// Clock and battery access provided by the host
pub trait Platform {
    /// Current Unix time in seconds
    fn now(&self) -> u32;

    fn battery(&self) -> BatteryState;
}

impl<P: Platform + ?Sized> Platform for &P {
    fn now(&self) -> u32 {
        (**self).now()
    }

    fn battery(&self) -> BatteryState {
        (**self).battery()
    }
}

pub struct Recorder<S, P> {
    config: RecorderConfig,
    platform: P,
    store: BlockStore<S>,
    cache: WindowCache,
    segmenter: Segmenter,
    /// Newest first
    cycles: Vec<ChargeCycle>,
    alerts: AlertScheduler,
    /// False until the first observation of this process is stored
    contiguous: bool,
    pending_snapshot: Option<SnapshotWriter>,
}

impl<S: Storage, P: Platform> Recorder<S, P> {
    /// Open the recorder over `storage`.
    ///
    /// On first launch this writes the default alerts, imports any legacy
    /// history and records the current battery state.
    pub fn open<K: MessageSink>(
        storage: S,
        platform: P,
        config: RecorderConfig,
        sink: &mut K,
    ) -> Result<Self, RecorderError> {
        config.validate()?;

        let store = BlockStore::new(storage);
        let alerts = AlertScheduler::load(store.storage())?;

        let mut recorder = Self {
            cache: WindowCache::new(config.cache_block_count),
            segmenter: Segmenter::new(&config),
            config,
            platform,
            store,
            cycles: Vec::new(),
            alerts,
            contiguous: false,
            pending_snapshot: None,
        };

        if recorder.store.is_initialized() {
            recorder.reload()?;
            recorder.refresh_alerts(sink);
        } else {
            recorder.first_launch(sink)?;
        }

        Ok(recorder)
    }

    fn first_launch<K: MessageSink>(&mut self, sink: &mut K) -> Result<(), RecorderError> {
        info!("First launch, preparing storage");

        // An interrupted first launch may have stored some of them already
        for seconds in self.config.default_alerts {
            if !self.alerts.thresholds().contains(&seconds) {
                self.alerts.schedule(self.store.storage_mut(), seconds)?;
            }
        }
        self.store.init()?;

        if LegacyArchive::exists(self.store.storage()) {
            let migrated = LegacyArchive::take(self.store.storage_mut())
                .and_then(|archive| archive.replay(|obs| self.persist_observation(obs).map(|_| ())));
            if let Err(err) = migrated {
                warn!("Legacy migration incomplete: {}", err);
            }
            // Imported history must not set a record
            self.store.storage_mut().delete(RECORD_LIFE_KEY)?;
        }

        self.process_battery_state(sink)?;
        Ok(())
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn store(&self) -> &BlockStore<S> {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut BlockStore<S> {
        &mut self.store
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn alerts(&self) -> &AlertScheduler {
        &self.alerts
    }

    /// Charge cycles, newest first
    pub fn cycles(&self) -> &[ChargeCycle] {
        &self.cycles
    }

    /// Drop cached state and rebuild it from storage
    pub fn reload(&mut self) -> Result<(), RecorderError> {
        self.cache.reload(&self.store, 0, &self.config.contiguity)?;
        self.resegment()
    }

    fn resegment(&mut self) -> Result<(), RecorderError> {
        let history = self
            .cache
            .iter_from(&self.store, 0, self.config.contiguity);
        self.cycles = self.segmenter.segment(history, false)?;
        Ok(())
    }

    /// Newest persisted point, if any
    fn latest_point(&mut self) -> Result<Option<HistoryPoint>, RecorderError> {
        match self.cache.get_or_load(&self.store, 0, &self.config.contiguity) {
            Ok(point) => Ok(Some(point)),
            Err(RecorderError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Walk the stored history newest-first from `start`
    pub fn history(&mut self, start: u16) -> HistoryCursor<'_, S> {
        self.cache
            .iter_from(&self.store, start, self.config.contiguity)
    }

    /// Sample the battery and store the reading if it changed.
    ///
    /// Returns the stored point, or `None` for a duplicate reading. When
    /// storage is full the reading is dropped and
    /// [`RecorderError::StorageFull`] is returned.
    pub fn process_battery_state<K: MessageSink>(
        &mut self,
        sink: &mut K,
    ) -> Result<Option<HistoryPoint>, RecorderError> {
        let state = self.platform.battery();
        if let Some(last) = self.latest_point()?
            && state.matches(&last.observation)
        {
            return Ok(None);
        }

        let obs = Observation::new(
            self.platform.now(),
            state.percent,
            state.charging,
            state.plugged,
            self.contiguous,
        );
        let point = match self.persist_observation(obs) {
            Ok(point) => point,
            Err(err) => {
                error!("Dropping observation {}: {}", obs, err);
                return Err(err);
            }
        };
        self.contiguous = true;

        self.refresh_alerts(sink);
        sink.post(WorkerMessage::ReloadNotification);
        Ok(Some(point))
    }

    /// Store one observation and update derived state
    fn persist_observation(&mut self, obs: Observation) -> Result<HistoryPoint, RecorderError> {
        // Keep exactly what a later read of the block would return
        let obs = Observation::from_bytes(&obs.to_bytes());

        self.update_record_life()?;

        let last = self.latest_point()?;
        let charge_rate = match last {
            Some(last) => estimator::next_rate(
                &last.observation,
                &obs,
                last.charge_rate,
                &self.config.contiguity,
            ),
            None => self.config.default_charge_rate(),
        };

        let outcome = self.store.append(obs, charge_rate)?;
        if outcome.evicted > 0 {
            warn!("Evicted {} old blocks to store {}", outcome.evicted, obs);
        }

        let point = HistoryPoint::new(obs, charge_rate);
        self.cache.push_front(point);

        if let Some(last) = last {
            let prev = last.observation;
            if prev.charging || obs.charging || !prev.contiguous || !obs.contiguous {
                debug!("Boundary at {}, re-segmenting", obs);
                self.resegment()?;
            }
        }

        Ok(point)
    }

    fn update_record_life(&mut self) -> Result<(), RecorderError> {
        let Some(run_time) = self.run_time(0) else {
            return Ok(());
        };
        let stored = self.store.storage().read_i32(RECORD_LIFE_KEY)?;
        if stored.is_none_or(|stored| (stored as i64) < run_time) {
            let run_time = run_time.clamp(0, i32::MAX as i64) as i32;
            self.store.storage_mut().write_i32(RECORD_LIFE_KEY, run_time)?;
        }
        Ok(())
    }

    /// Forget the longest run time
    pub fn reset_record_life(&mut self) -> Result<(), RecorderError> {
        self.store.storage_mut().delete(RECORD_LIFE_KEY)?;
        Ok(())
    }

    fn refresh_alerts<K: MessageSink>(&mut self, sink: &mut K) {
        let remaining = match self.life_remaining() {
            Ok(remaining) => remaining,
            Err(err) => {
                warn!("Cannot project battery life for alerts: {}", err);
                return;
            }
        };
        let now = self.platform.now() as i64;
        for index in self.alerts.refresh(remaining, now) {
            sink.post(WorkerMessage::AlertFired { index });
        }
    }

    /// Fire alerts whose deadline has passed
    pub fn poll_alerts<K: MessageSink>(&mut self, sink: &mut K) {
        let now = self.platform.now() as i64;
        for index in self.alerts.poll(now) {
            sink.post(WorkerMessage::AlertFired { index });
        }
    }

    /// Act on a message from the bus
    pub fn handle_message<K: MessageSink>(
        &mut self,
        message: WorkerMessage,
        sink: &mut K,
    ) -> Result<(), RecorderError> {
        match message {
            WorkerMessage::RequestSnapshot { start_index } => {
                let snapshot = self.snapshot(start_index)?;
                let now = self.platform.now();
                self.pending_snapshot =
                    Some(SnapshotWriter::begin(self.store.storage_mut(), &snapshot, now)?);
                self.service_mailbox()?;
            }
            WorkerMessage::ReloadNotification => self.reload()?,
            WorkerMessage::ScheduleAlert { seconds } => {
                self.alerts.schedule(self.store.storage_mut(), seconds)?;
                self.refresh_alerts(sink);
                sink.post(WorkerMessage::ReloadNotification);
            }
            WorkerMessage::UnscheduleAlert { index } => {
                if self.alerts.unschedule(self.store.storage_mut(), index as usize)? {
                    sink.post(WorkerMessage::ReloadNotification);
                }
            }
            WorkerMessage::AlertFired { index } => info!("Alert {} raised", index),
            WorkerMessage::ExportRequest => export::log_report(self)?,
        }
        Ok(())
    }

    /// Advance a pending snapshot transfer. Returns true while one is pending.
    ///
    /// A transfer the foreground stopped collecting is dropped after the
    /// handshake timeout.
    pub fn service_mailbox(&mut self) -> Result<bool, RecorderError> {
        let now = self.platform.now();
        let timeout = self.config.handshake.timeout;
        if let Some(writer) = self.pending_snapshot.as_mut()
            && writer.service(self.store.storage_mut(), now, timeout)?
        {
            self.pending_snapshot = None;
        }
        Ok(self.pending_snapshot.is_some())
    }

    /// The newest observation, or a synthetic one for the live battery state
    /// when it differs from what was last stored.
    ///
    /// A synthetic point carries the last stored charge rate.
    pub fn current_point(&mut self) -> Result<HistoryPoint, RecorderError> {
        let state = self.platform.battery();
        let live = Observation::new(
            self.platform.now(),
            state.percent,
            state.charging,
            state.plugged,
            self.contiguous,
        );

        Ok(match self.latest_point()? {
            Some(last) if state.matches(&last.observation) => last,
            Some(last) => HistoryPoint::new(live, last.charge_rate),
            None => HistoryPoint::new(live, self.config.default_charge_rate()),
        })
    }

    pub fn charge_rate(&mut self) -> Result<i32, RecorderError> {
        Ok(self.current_point()?.charge_rate)
    }

    /// Unix time the battery is projected to reach 0%
    pub fn charge_by_time(&mut self) -> Result<i64, RecorderError> {
        let point = self.current_point()?;
        Ok(estimator::charge_by_time(&point.observation, point.charge_rate))
    }

    /// Seconds until the battery is projected to reach 0%
    pub fn life_remaining(&mut self) -> Result<i64, RecorderError> {
        Ok(self.charge_by_time()? - self.platform.now() as i64)
    }

    /// Whether the newest cycle has ended, i.e. the battery is charging
    fn newest_cycle_closed(&self) -> bool {
        self.cycles.first().is_some_and(|cycle| !cycle.is_open())
    }

    fn cycle_at(&self, index: usize) -> Option<&ChargeCycle> {
        let index = if index > 0 && self.newest_cycle_closed() {
            index - 1
        } else {
            index
        };
        self.cycles.get(index)
    }

    /// Run time of a cycle: 0 is the current run (`None` while charging),
    /// higher indices go back through finished cycles.
    pub fn run_time(&self, index: usize) -> Option<i64> {
        let cycle = self.cycle_at(index)?;
        if index == 0 && !cycle.is_open() {
            return None;
        }
        Some(cycle.run_time(self.platform.now()))
    }

    /// When the current run started, `None` while charging
    pub fn last_charged_time(&self) -> Option<i64> {
        self.run_time(0)
            .map(|run_time| self.platform.now() as i64 - run_time)
    }

    /// Longest run time seen, including the current run
    pub fn record_run_time(&self) -> Result<i64, RecorderError> {
        let stored = self
            .store
            .storage()
            .read_i32(RECORD_LIFE_KEY)?
            .unwrap_or(0) as i64;
        Ok(self.run_time(0).map_or(stored, |current| current.max(stored)))
    }

    /// Projected life on a full charge: 0 is the current estimate, higher
    /// indices go back through finished cycles
    pub fn max_life(&mut self, index: usize) -> Result<Option<i64>, RecorderError> {
        if index == 0 {
            return Ok(Some(estimator::max_life(self.charge_rate()?)));
        }
        Ok(self
            .cycle_at(index)
            .filter(|cycle| cycle.avg_charge_rate != 0)
            .map(ChargeCycle::max_life))
    }

    /// Battery used per day at the current rate, `None` when unknown
    pub fn percent_per_day(&mut self) -> Result<Option<i32>, RecorderError> {
        let max_life = self.max_life(0)?.unwrap_or(0);
        Ok(estimator::percent_per_day(max_life))
    }

    /// Estimate of the live battery percent between 10% steps
    pub fn battery_percent(&mut self) -> Result<u8, RecorderError> {
        let point = self.current_point()?;
        Ok(estimator::estimated_percent(
            &point.observation,
            point.charge_rate,
            self.platform.now(),
        ))
    }

    /// Stored point at `index`, 0 being the newest
    pub fn data_point(&mut self, index: u16) -> Result<HistoryPoint, RecorderError> {
        self.cache
            .get_or_load(&self.store, index, &self.config.contiguity)
    }

    /// Cycles needed to cover the last `seconds` (all cycles for 0), counting
    /// the current charge as one. Never less than 1.
    pub fn charge_cycle_count_including_seconds(&self, seconds: i64) -> usize {
        let end_time = if seconds != 0 {
            self.platform.now() as i64 - seconds
        } else {
            0
        };

        let mut count = 0;
        for cycle in &self.cycles {
            count += 1;
            if (cycle.charge_epoch as i64) < end_time {
                break;
            }
        }
        if self.newest_cycle_closed() {
            count += 1;
        }
        count.max(1)
    }

    /// Points needed to cover the last `seconds`
    pub fn data_point_count_including_seconds(
        &mut self,
        seconds: i64,
    ) -> Result<usize, RecorderError> {
        let end_time = self.platform.now() as i64 - seconds;
        let mut count = 0;
        for point in self.history(0) {
            count += 1;
            if (point?.observation.epoch as i64) < end_time {
                break;
            }
        }
        Ok(count)
    }

    /// Build the statistics snapshot for the foreground
    pub fn snapshot(&mut self, start_index: u16) -> Result<Snapshot, RecorderError> {
        let mut snapshot = Snapshot {
            charge_rate: self.charge_rate()?,
            charge_by_time: self.charge_by_time()?,
            last_charged_time: self.last_charged_time(),
            record_run_time: self.record_run_time()?,
            start_index,
            ..Snapshot::default()
        };

        // Every push below stays within the heapless capacities
        for &threshold in self.alerts.thresholds() {
            let _ = snapshot.alert_thresholds.push(threshold);
        }

        let cycle_count = (self.charge_cycle_count_including_seconds(0) - 1).min(SNAPSHOT_CYCLES);
        for index in 1..=cycle_count {
            let _ = snapshot.run_times.push(self.run_time(index));
            let _ = snapshot.max_lives.push(self.max_life(index)?);
        }

        for point in self.history(start_index).take(SNAPSHOT_POINTS) {
            let obs = point?.observation;
            let _ = snapshot.points.push(SnapshotPoint {
                epoch: obs.epoch,
                percent: obs.percent,
            });
        }

        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertData;
    use crate::config::{SEC_IN_DAY, SEC_IN_HR};
    use crate::ipc::{MessageChannel, request_snapshot};
    use crate::legacy::{LEGACY_COUNT_KEY, LEGACY_FIRST_CHUNK_KEY, LEGACY_INDEX_KEY};
    use crate::storage::{MemoryStorage, PERSIST_DATA_KEY};
    use core::cell::{Cell, RefCell};
    use embedded_hal_async::delay::DelayNs;

    const B: u32 = 1_600_000_000;

    struct TestPlatform {
        now: Cell<u32>,
        battery: Cell<BatteryState>,
    }

    impl TestPlatform {
        fn new(now: u32, percent: u8, charging: bool) -> Self {
            let platform = Self {
                now: Cell::new(now),
                battery: Cell::new(BatteryState::default()),
            };
            platform.set(now, percent, charging);
            platform
        }

        fn set(&self, now: u32, percent: u8, charging: bool) {
            self.now.set(now);
            self.battery.set(BatteryState {
                percent,
                charging,
                plugged: charging,
            });
        }
    }

    impl Platform for TestPlatform {
        fn now(&self) -> u32 {
            self.now.get()
        }

        fn battery(&self) -> BatteryState {
            self.battery.get()
        }
    }

    type TestRecorder<'a> = Recorder<MemoryStorage, &'a TestPlatform>;

    fn open(platform: &TestPlatform) -> (TestRecorder<'_>, Vec<WorkerMessage>) {
        let mut sink = Vec::new();
        let recorder = Recorder::open(
            MemoryStorage::new(),
            platform,
            RecorderConfig::default(),
            &mut sink,
        )
        .unwrap();
        (recorder, sink)
    }

    fn ingest(
        recorder: &mut TestRecorder<'_>,
        platform: &TestPlatform,
        now: u32,
        percent: u8,
        charging: bool,
    ) -> Option<HistoryPoint> {
        platform.set(now, percent, charging);
        recorder.process_battery_state(&mut Vec::new()).unwrap()
    }

    #[test]
    fn test_first_launch() {
        let platform = TestPlatform::new(B, 80, false);
        let (mut recorder, sink) = open(&platform);

        let storage = recorder.store().storage();
        assert_eq!(storage.read_i32(PERSIST_DATA_KEY), Ok(Some(1001)));
        assert_eq!(
            AlertData::load(storage).unwrap().thresholds.as_slice(),
            &[4 * SEC_IN_HR, SEC_IN_DAY]
        );
        assert!(sink.contains(&WorkerMessage::ReloadNotification));

        let point = recorder.data_point(0).unwrap();
        assert_eq!(point.observation, Observation::new(B, 80, false, false, false));
        assert_eq!(point.charge_rate, -6048);
        assert_eq!(
            recorder.data_point(1),
            Err(RecorderError::NotFound(1))
        );
    }

    #[test]
    fn test_duplicate_state_is_ignored() {
        let platform = TestPlatform::new(B, 80, false);
        let (mut recorder, _) = open(&platform);

        assert_eq!(ingest(&mut recorder, &platform, B + 60, 80, false), None);
        assert!(ingest(&mut recorder, &platform, B + 120, 80, true).is_some());
        assert_eq!(recorder.data_point(0).unwrap().observation.epoch, B + 120);
    }

    #[test]
    fn test_charge_rate_update() {
        let platform = TestPlatform::new(B, 50, false);
        let (mut recorder, _) = open(&platform);

        let point = ingest(&mut recorder, &platform, B + 3_600, 40, false).unwrap();
        assert!(point.observation.contiguous);
        assert_eq!(point.charge_rate, -6048 * 4 / 5 + (3_600 / -10) / 5);
        assert_eq!(recorder.charge_rate(), Ok(-4910));
        assert_eq!(recorder.max_life(0), Ok(Some(491_000)));
    }

    #[test]
    fn test_index_beyond_history_is_not_found() {
        let platform = TestPlatform::new(B, 100, false);
        let (mut recorder, _) = open(&platform);
        for i in 1..150u32 {
            let percent = 100 - (i % 100) as u8;
            ingest(&mut recorder, &platform, B + i * 600, percent, false).unwrap();
        }

        assert_eq!(recorder.data_point(200), Err(RecorderError::NotFound(200)));
        assert_eq!(recorder.data_point(149).unwrap().observation.epoch, B);
        assert_eq!(recorder.data_point_count_including_seconds(i64::MAX / 2), Ok(150));
    }

    #[test]
    fn test_cache_matches_storage() {
        let platform = TestPlatform::new(B, 100, false);
        let (mut recorder, _) = open(&platform);
        for i in 1..260u32 {
            let charging = (i / 40) % 2 == 1;
            let percent = if charging { (i % 40) as u8 * 2 + 20 } else { 100 - (i % 40) as u8 };
            ingest(&mut recorder, &platform, B + i * 900, percent, charging);
        }

        let expected: Vec<HistoryPoint> = {
            let mut fresh = WindowCache::new(3);
            fresh
                .iter_from(recorder.store(), 0, recorder.config().contiguity)
                .collect::<Result<_, _>>()
                .unwrap()
        };
        assert_eq!(expected.len(), 260);

        for index in [0u16, 1, 49, 50, 120, 259, 3, 200] {
            assert_eq!(
                recorder.data_point(index).unwrap(),
                expected[index as usize],
                "index {}",
                index
            );
        }
    }

    #[test]
    fn test_charge_cycle_segmentation() {
        let platform = TestPlatform::new(B + 100, 40, true);
        let (mut recorder, _) = open(&platform);
        ingest(&mut recorder, &platform, B + 200, 40, false);
        ingest(&mut recorder, &platform, B + 5_000, 38, true);

        assert_eq!(
            recorder.cycles(),
            [ChargeCycle {
                charge_epoch: B + 100,
                discharge_epoch: B + 200,
                end_epoch: Some(B + 5_000),
                avg_charge_rate: -6048,
            }]
        );
        // Charging: no current run
        assert_eq!(recorder.run_time(0), None);
        assert_eq!(recorder.run_time(1), Some(4_800));
        assert_eq!(recorder.last_charged_time(), None);
        assert_eq!(recorder.charge_cycle_count_including_seconds(0), 2);
    }

    #[test]
    fn test_current_run_statistics() {
        let platform = TestPlatform::new(B, 20, true);
        let (mut recorder, _) = open(&platform);
        ingest(&mut recorder, &platform, B + 3_600, 100, false);
        ingest(&mut recorder, &platform, B + 3_600 + 8_640, 90, false);

        platform.now.set(B + 20_000);
        assert_eq!(recorder.run_time(0), Some(20_000 - 3_600));
        assert_eq!(recorder.last_charged_time(), Some((B + 3_600) as i64));
        assert_eq!(recorder.run_time(1), None);
        assert_eq!(recorder.charge_cycle_count_including_seconds(0), 1);
        assert_eq!(recorder.record_run_time(), Ok(20_000 - 3_600));
        assert!(recorder.percent_per_day().unwrap().is_some());
    }

    #[test]
    fn test_record_life_is_monotonic_until_reset() {
        let platform = TestPlatform::new(B, 30, true);
        let (mut recorder, _) = open(&platform);

        let mut t = B;
        let mut last_record = 0;
        for (run, charge) in [(200_000u32, 3_600u32), (50_000, 3_600), (300_000, 3_600)] {
            t += charge;
            ingest(&mut recorder, &platform, t, 100, false);
            t += run;
            ingest(&mut recorder, &platform, t, 20, false);
            ingest(&mut recorder, &platform, t + 1, 20, true);

            let record = recorder.record_run_time().unwrap();
            assert!(record >= last_record);
            last_record = record;
        }
        assert!(last_record >= 300_000);

        recorder.reset_record_life().unwrap();
        assert!(recorder.record_run_time().unwrap() < last_record);
    }

    #[test]
    fn test_storage_full_drops_observation() {
        let platform = TestPlatform::new(B, 90, false);
        let (mut recorder, _) = open(&platform);
        let before = recorder.data_point(0).unwrap();

        recorder.store_mut().storage_mut().fail_next_writes(u32::MAX);
        platform.set(B + 600, 89, false);
        assert_eq!(
            recorder.process_battery_state(&mut Vec::new()),
            Err(RecorderError::StorageFull { key: 1001 })
        );
        assert_eq!(recorder.data_point(0), Ok(before));
        assert_eq!(recorder.data_point(1), Err(RecorderError::NotFound(1)));

        recorder.store_mut().storage_mut().fail_next_writes(0);
        assert!(ingest(&mut recorder, &platform, B + 1_200, 88, false).is_some());
        assert_eq!(recorder.data_point(1), Ok(before));
    }

    #[test]
    fn test_alert_fires_when_due() {
        let platform = TestPlatform::new(B, 50, false);
        let (mut recorder, _) = open(&platform);

        // 50% at -6048 s/% leaves 302400 s; the 1-day alert is due first
        assert_eq!(recorder.alerts().next_deadline(), Some(B as i64 + 216_000));

        let mut sink = Vec::new();
        platform.now.set(B + 250_000);
        recorder.poll_alerts(&mut sink);
        assert_eq!(sink, [WorkerMessage::AlertFired { index: 1 }]);
    }

    #[test]
    fn test_schedule_alert_message() {
        let platform = TestPlatform::new(B, 50, false);
        let (mut recorder, _) = open(&platform);

        let mut sink = Vec::new();
        recorder
            .handle_message(WorkerMessage::ScheduleAlert { seconds: 600 }, &mut sink)
            .unwrap();
        assert_eq!(recorder.alerts().thresholds(), &[600, 4 * SEC_IN_HR, SEC_IN_DAY]);
        assert!(sink.contains(&WorkerMessage::ReloadNotification));

        recorder
            .handle_message(WorkerMessage::UnscheduleAlert { index: 0 }, &mut sink)
            .unwrap();
        assert_eq!(recorder.alerts().thresholds(), &[4 * SEC_IN_HR, SEC_IN_DAY]);
    }

    #[test]
    fn test_reopen_marks_gap() {
        let platform = TestPlatform::new(B, 90, false);
        let (recorder, _) = open(&platform);
        let storage = recorder.store.into_inner();

        platform.set(B + 7_200, 85, false);
        let mut recorder =
            Recorder::open(storage, &platform, RecorderConfig::default(), &mut Vec::new()).unwrap();
        let point = recorder.process_battery_state(&mut Vec::new()).unwrap().unwrap();
        assert!(!point.observation.contiguous);
        assert_eq!(recorder.data_point(1).unwrap().observation.epoch, B);
    }

    #[test]
    fn test_restart_while_charging_keeps_charge() {
        let platform = TestPlatform::new(B, 100, false);
        let (mut recorder, _) = open(&platform);
        for i in 1..=80u32 {
            ingest(&mut recorder, &platform, B + i * 3_600, 100 - i as u8, false);
        }
        let plugged_in = B + 80 * 3_600 + 60;
        ingest(&mut recorder, &platform, plugged_in, 20, true);
        let storage = recorder.store.into_inner();

        platform.set(plugged_in + 3_600, 80, true);
        let mut recorder =
            Recorder::open(storage, &platform, RecorderConfig::default(), &mut Vec::new()).unwrap();
        let point = recorder.process_battery_state(&mut Vec::new()).unwrap().unwrap();
        assert!(!point.observation.contiguous);

        assert_eq!(recorder.cycles().len(), 1);
        assert_eq!(recorder.cycles()[0].discharge_epoch, B);
        assert_eq!(recorder.cycles()[0].end_epoch, Some(plugged_in));
        assert_eq!(recorder.run_time(0), None);
        assert_eq!(recorder.last_charged_time(), None);
    }

    #[test]
    fn test_interrupted_first_launch_keeps_single_alerts() {
        let mut storage = MemoryStorage::new();
        let mut partial = AlertData::default();
        partial.thresholds.push(4 * SEC_IN_HR).unwrap();
        partial.save(&mut storage).unwrap();

        let platform = TestPlatform::new(B, 80, false);
        let recorder =
            Recorder::open(storage, &platform, RecorderConfig::default(), &mut Vec::new()).unwrap();
        assert_eq!(recorder.alerts().thresholds(), &[4 * SEC_IN_HR, SEC_IN_DAY]);
        assert_eq!(
            AlertData::load(recorder.store().storage()).unwrap().thresholds.as_slice(),
            &[4 * SEC_IN_HR, SEC_IN_DAY]
        );
    }

    #[test]
    fn test_legacy_history_is_imported() {
        let mut storage = MemoryStorage::new();
        storage.write_i32(LEGACY_INDEX_KEY, 3).unwrap();
        storage.write_i32(LEGACY_COUNT_KEY, 3).unwrap();
        let mut chunk = [0u8; 24];
        for (i, percent) in [90u32, 80, 70].iter().enumerate() {
            let value = (i as u32 * 60) * 44 + (percent / 10) * 4;
            chunk[i * 4..i * 4 + 4].copy_from_slice(&value.to_le_bytes());
        }
        storage.write(LEGACY_FIRST_CHUNK_KEY, &chunk).unwrap();

        let platform = TestPlatform::new(B, 60, false);
        let mut recorder =
            Recorder::open(storage, &platform, RecorderConfig::default(), &mut Vec::new()).unwrap();

        assert!(!recorder.store().storage().exists(LEGACY_INDEX_KEY));
        assert!(!recorder.store().storage().exists(RECORD_LIFE_KEY));
        assert_eq!(recorder.data_point(0).unwrap().observation.percent, 60);
        assert_eq!(recorder.data_point(1).unwrap().observation.percent, 70);
        assert_eq!(recorder.data_point(3).unwrap().observation.percent, 90);
        assert_eq!(recorder.data_point(4), Err(RecorderError::NotFound(4)));
    }

    /// Runs the worker between foreground polls
    struct WorkerPump<'a, 's, 'p> {
        channel: &'a MessageChannel,
        worker: &'a mut Recorder<&'s RefCell<MemoryStorage>, &'p TestPlatform>,
    }

    impl DelayNs for WorkerPump<'_, '_, '_> {
        async fn delay_ns(&mut self, _ns: u32) {
            while let Ok(message) = self.channel.try_receive() {
                self.worker.handle_message(message, &mut Vec::new()).unwrap();
            }
            self.worker.service_mailbox().unwrap();
        }
    }

    #[test]
    fn test_snapshot_handshake() {
        let shared = RefCell::new(MemoryStorage::new());
        let platform = TestPlatform::new(B, 100, false);
        let mut worker =
            Recorder::open(&shared, &platform, RecorderConfig::default(), &mut Vec::new()).unwrap();
        for i in 1..80u32 {
            platform.set(B + i * 864, 100 - i as u8, false);
            worker.process_battery_state(&mut Vec::new()).unwrap();
        }

        let channel = MessageChannel::new();
        let mut sender = channel.sender();
        let mut foreground = &shared;
        let config = RecorderConfig::default().handshake;
        let mut pump = WorkerPump {
            channel: &channel,
            worker: &mut worker,
        };

        let snapshot = embassy_futures::block_on(request_snapshot(
            &mut foreground,
            &mut sender,
            &mut pump,
            10,
            &config,
        ))
        .unwrap();

        assert_eq!(snapshot.start_index, 10);
        assert_eq!(snapshot.points.len(), 50);
        assert_eq!(snapshot.points[0].epoch, B + 69 * 864);
        assert_eq!(snapshot.points[0].percent, 31);
        assert_eq!(snapshot.alert_thresholds.as_slice(), &[4 * SEC_IN_HR, SEC_IN_DAY]);
        assert!(snapshot.charge_rate < 0);
        assert!(!shared.borrow().exists(crate::storage::MAILBOX_LOCK_KEY));
    }

    #[test]
    fn test_abandoned_snapshot_is_dropped() {
        let platform = TestPlatform::new(B, 100, false);
        let (mut recorder, _) = open(&platform);
        for i in 1..80u32 {
            ingest(&mut recorder, &platform, B + i * 864, 100 - i as u8, false);
        }

        recorder
            .handle_message(WorkerMessage::RequestSnapshot { start_index: 0 }, &mut Vec::new())
            .unwrap();
        assert!(recorder.store().storage().exists(crate::storage::MAILBOX_LOCK_KEY));
        assert_eq!(recorder.service_mailbox(), Ok(true));

        // The foreground gave up without collecting the chunk
        platform.now.set(platform.now() + 60);
        assert_eq!(recorder.service_mailbox(), Ok(false));
        let storage = recorder.store().storage();
        assert!(!storage.exists(crate::storage::MAILBOX_LOCK_KEY));
        assert!(!storage.exists(crate::storage::MAILBOX_PAYLOAD_KEY));
    }

    #[test]
    fn test_storage_error_propagates() {
        let platform = TestPlatform::new(B, 90, false);
        let (mut recorder, _) = open(&platform);
        // Corrupt the newest block header
        recorder
            .store_mut()
            .storage_mut()
            .write(1001, &[9, 0, 0, 0, 0, 0])
            .unwrap();
        recorder.reload().unwrap_err();
        assert_eq!(
            recorder.data_point(0),
            Err(RecorderError::UnsupportedVersion(9))
        );
    }
}
