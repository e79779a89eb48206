//! Scheduling Coordinator
//!
//! ## Overview
//!
//! The coordinator is the station's control loop. Each tick walks one fixed
//! path through [`CoordinatorState`]:
//!
//! ```text
//! Idle -> ComputeSchedule -> Sleep -> MergeSources -> Capture -> Persist -> Idle
//!                              |            any state on shutdown -> Stopped
//! ```
//!
//! 1. **ComputeSchedule**: look the current hour up in the [`ScheduleTable`]
//! 2. **Sleep**: wait the planned interval on the [`StopSignal`]; shutdown
//!    ends the wait at once
//! 3. **MergeSources**: build a fresh [`UnifiedRecord`] stamped with the
//!    current time and merge every source into it
//! 4. **Capture**: run the planned bracket; the record is not touched again
//!    until every still is in
//! 5. **Persist**: one row per still, the merged record overlaid with that
//!    still's filename, exposure value and gain
//!
//! ## Threads
//!
//! Sources that need their own loop get a named thread
//! (`fieldfuse-<source>`) from [`Coordinator::spawn_sources`]. The coordinator
//! never touches a source's buffer except through
//! [`SensorSource::merge`]. On shutdown it raises the stop signal and joins
//! every source thread before returning.
//!
//! ## Failure Handling
//!
//! Nothing inside a tick stops the loop. A failed bracket is abandoned and
//! no rows are written for it; a failed append is logged and counted; a
//! stale or mismatched source only affects its own columns.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, info, warn};

use crate::capture::{CaptureController, CaptureMetadata};
use crate::errors::{CaptureError, SetupError, SourceError};
use crate::record::UnifiedRecord;
use crate::schedule::{SchedulePlan, ScheduleTable};
use crate::snapshot::StalenessPolicy;
use crate::stop::StopSignal;
use crate::time::Clock;
use crate::traits::{CaptureDevice, RecordSink, SensorSource};

/// Where the control loop is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    ComputeSchedule,
    Sleep,
    MergeSources,
    Capture,
    Persist,
    Stopped,
}

/// Counters over the coordinator's lifetime
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleStats {
    /// Ticks that reached MergeSources
    pub cycles: usize,
    /// Rows appended to the sink
    pub rows_written: usize,
    /// Brackets abandoned on capture failure or shutdown
    pub brackets_abandoned: usize,
    /// Source merges that found stale data
    pub stale_merges: usize,
    /// Fields refused by the record schema
    pub schema_mismatches: usize,
    /// Rows the sink failed to append
    pub storage_failures: usize,
}

struct Worker {
    source: String,
    handle: JoinHandle<Result<(), SourceError>>,
}

/// Top-level control loop
pub struct Coordinator<D: CaptureDevice> {
    sources: Vec<Arc<dyn SensorSource>>,
    capture: CaptureController<D>,
    sink: Box<dyn RecordSink>,
    schedule: ScheduleTable,
    policy: StalenessPolicy,
    clock: Arc<dyn Clock>,
    stop: StopSignal,
    workers: Vec<Worker>,
    spawned: bool,
    state: CoordinatorState,
    stats: CycleStats,
}

impl<D: CaptureDevice> Coordinator<D> {
    pub fn new(
        capture: CaptureController<D>,
        sink: Box<dyn RecordSink>,
        clock: Arc<dyn Clock>,
        stop: StopSignal,
    ) -> Self {
        Self {
            sources: Vec::new(),
            capture,
            sink,
            schedule: ScheduleTable::default(),
            policy: StalenessPolicy::default(),
            clock,
            stop,
            workers: Vec::new(),
            spawned: false,
            state: CoordinatorState::Idle,
            stats: CycleStats::default(),
        }
    }

    /// Add a source; sources merge in the order they were added
    pub fn with_source(mut self, source: Arc<dyn SensorSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_schedule(mut self, schedule: ScheduleTable) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_policy(mut self, policy: StalenessPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn stats(&self) -> &CycleStats {
        &self.stats
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    /// Start a named thread for every source that runs its own loop
    pub fn spawn_sources(&mut self) -> Result<(), SetupError> {
        if self.spawned {
            return Ok(());
        }
        self.spawned = true;

        for source in self.sources.iter().filter(|s| s.needs_thread()) {
            let name = source.name().to_string();
            let source = Arc::clone(source);
            let stop = self.stop.clone();

            let handle = thread::Builder::new()
                .name(format!("fieldfuse-{name}"))
                .spawn(move || source.run(&stop))
                .map_err(|e| SetupError::Device(format!("cannot start {name} thread: {e}")))?;

            info!("Started source thread for {}", name);
            self.workers.push(Worker { source: name, handle });
        }
        Ok(())
    }

    /// Run ticks until the stop signal is raised, then shut down
    pub fn run(&mut self) -> Result<CycleStats, SetupError> {
        self.spawn_sources()?;
        info!("Coordinator running with {} source(s)", self.sources.len());

        while !self.stop.is_cancelled() {
            self.state = CoordinatorState::ComputeSchedule;
            let plan = self.plan();

            self.state = CoordinatorState::Sleep;
            debug!("Sleeping {:?} before next capture", plan.interval);
            if self.stop.wait_for(plan.interval) {
                break;
            }

            self.run_cycle(plan);
        }

        self.shutdown();
        Ok(self.stats.clone())
    }

    /// One immediate tick without sleeping, then shut down
    pub fn run_once(&mut self) -> Result<CycleStats, SetupError> {
        self.spawn_sources()?;
        self.state = CoordinatorState::ComputeSchedule;
        let plan = self.plan();
        self.run_cycle(plan);
        self.shutdown();
        Ok(self.stats.clone())
    }

    /// Merge, capture and persist once; returns the rows written
    pub fn run_cycle(&mut self, plan: SchedulePlan) -> usize {
        self.stats.cycles += 1;
        let record = self.merge_sources();

        self.state = CoordinatorState::Capture;
        let shots = match self.capture.capture(plan.bracket) {
            Ok(shots) => shots,
            Err(CaptureError::Cancelled) => {
                info!("Bracket abandoned: shutdown requested");
                self.stats.brackets_abandoned += 1;
                self.state = CoordinatorState::Idle;
                return 0;
            }
            Err(e) => {
                error!("Bracket abandoned: {}", e);
                self.stats.brackets_abandoned += 1;
                self.state = CoordinatorState::Idle;
                return 0;
            }
        };

        self.state = CoordinatorState::Persist;
        let written = self.persist(&record, &shots);
        self.state = CoordinatorState::Idle;
        written
    }

    /// Fresh record at the current time with every source merged in
    pub fn merge_sources(&mut self) -> UnifiedRecord {
        self.state = CoordinatorState::MergeSources;
        let mut record = UnifiedRecord::new(self.clock.now());

        for source in &self.sources {
            let report = source.merge(&mut record, self.policy);
            if report.is_stale() {
                self.stats.stale_merges += 1;
            }
            self.stats.schema_mismatches += report.mismatches.len();
        }

        debug!("Merged {} source(s), record time {}", self.sources.len(), record.timestamp);
        record
    }

    /// Raise the stop signal and join every source thread
    pub fn shutdown(&mut self) {
        self.stop.cancel();

        for worker in self.workers.drain(..) {
            match worker.handle.join() {
                Ok(Ok(())) => info!("Source {} stopped", worker.source),
                Ok(Err(e)) => error!("Source {} stopped with error: {}", worker.source, e),
                Err(_) => error!("Source {} thread panicked", worker.source),
            }
        }

        if self.state != CoordinatorState::Stopped {
            self.capture.close();
            let s = &self.stats;
            info!(
                "Coordinator stopped: {} cycles, {} rows, {} brackets abandoned, {} stale merges, {} schema mismatches, {} storage failures",
                s.cycles, s.rows_written, s.brackets_abandoned, s.stale_merges, s.schema_mismatches, s.storage_failures
            );
        }
        self.state = CoordinatorState::Stopped;
    }

    fn plan(&self) -> SchedulePlan {
        let now = self.clock.now();
        let plan = self.schedule.plan_for(now.hour());
        debug!(
            "Hour {:02}: interval {:?}, bracket {:?}",
            now.hour(),
            plan.interval,
            plan.bracket
        );
        plan
    }

    fn persist(&mut self, record: &UnifiedRecord, shots: &[CaptureMetadata]) -> usize {
        let mut written = 0;

        for shot in shots {
            let drift = shot.captured_at.seconds_since(&record.timestamp);
            if drift.abs() > self.policy.tolerance_secs() {
                warn!(
                    "{}: captured {}s away from sensor data ({}), writing anyway",
                    shot.filename, drift, record.timestamp
                );
            }

            // The local capture owns its image fields, even over merged values.
            let mut row = record.clone();
            row.image = Some(shot.filename.clone());
            row.aec_level = Some(f64::from(shot.exposure_value));
            row.agc_gain = shot.analogue_gain;

            match self.sink.append(&row) {
                Ok(()) => {
                    written += 1;
                    self.stats.rows_written += 1;
                }
                Err(e) => {
                    error!("Failed to persist {}: {}", shot.filename, e);
                    self.stats.storage_failures += 1;
                }
            }
        }

        info!("Persisted {} of {} row(s)", written, shots.len());
        written
    }
}

impl<D: CaptureDevice> Drop for Coordinator<D> {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.shutdown();
        }
    }
}
