//! Shared fixtures for coordinator integration tests
//!
//! Provides:
//! - `MockSource`: buffer-backed source, optionally with its own thread
//! - `MockCamera`: capture device that counts frames, can fail on demand
//!   and can omit its analogue gain
//! - `Station`: a coordinator wired to a manual clock and an in-memory sink

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fieldfuse_core::{
    CaptureController, CaptureDevice, CaptureError, Clock, Coordinator, DeviceMetadata, ManualClock,
    MemorySink, MergeReport, Reading, SensorSource, SnapshotBuffer, SourceError, StalenessPolicy, StopSignal,
    Timestamp, UnifiedRecord,
};

pub fn ts(text: &str) -> Timestamp {
    Timestamp::parse(text).expect("valid test timestamp")
}

/// Source whose buffer the test publishes into directly
pub struct MockSource {
    name: String,
    buffer: SnapshotBuffer,
    threaded: bool,
    started: AtomicBool,
    exited: AtomicBool,
}

impl MockSource {
    /// Source merged on demand, no background thread
    pub fn passive(name: &str, fields: &[&str]) -> Arc<Self> {
        Arc::new(Self::build(name, fields, false))
    }

    /// Source with a background loop that idles until shutdown
    pub fn threaded(name: &str, fields: &[&str]) -> Arc<Self> {
        Arc::new(Self::build(name, fields, true))
    }

    fn build(name: &str, fields: &[&str], threaded: bool) -> Self {
        Self {
            name: name.to_string(),
            buffer: SnapshotBuffer::new(name, fields.iter().copied()),
            threaded,
            started: AtomicBool::new(false),
            exited: AtomicBool::new(false),
        }
    }

    pub fn publish(&self, at: Timestamp, readings: &[(&str, Reading)]) {
        self.buffer
            .publish(at, readings.iter().map(|(name, r)| (name.to_string(), Some(r.clone()))));
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

impl SensorSource for MockSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn merge(&self, target: &mut UnifiedRecord, policy: StalenessPolicy) -> MergeReport {
        self.buffer.merge_into(target, policy)
    }

    fn needs_thread(&self) -> bool {
        self.threaded
    }

    fn run(&self, stop: &StopSignal) -> Result<(), SourceError> {
        self.started.store(true, Ordering::SeqCst);
        while !stop.wait_for(Duration::from_millis(10)) {}
        self.exited.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Camera that records how many stills it took
#[derive(Clone, Default)]
pub struct MockCamera {
    pub frames: Arc<AtomicUsize>,
    pub fail_on_frame: Option<usize>,
    /// Leave AnalogueGain out of the capture metadata
    pub no_gain: bool,
}

impl CaptureDevice for MockCamera {
    fn set_exposure(&mut self, _ev: f32) -> Result<(), CaptureError> {
        Ok(())
    }

    fn capture_still(&mut self, path: &Path) -> Result<DeviceMetadata, CaptureError> {
        let frame = self.frames.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_frame == Some(frame) {
            return Err(CaptureError::Device("shutter stuck".into()));
        }
        std::fs::write(path, b"jpeg")?;
        let mut meta = DeviceMetadata::new();
        if !self.no_gain {
            meta.insert("AnalogueGain".into(), serde_json::json!(2.0));
        }
        Ok(meta)
    }
}

/// Coordinator plus the handles a test inspects
pub struct Station {
    pub coordinator: Coordinator<MockCamera>,
    pub sink: MemorySink,
    pub clock: Arc<ManualClock>,
    pub stop: StopSignal,
    pub camera: MockCamera,
    pub dir: tempfile::TempDir,
}

pub fn station(at: &str, settle: Duration, camera: MockCamera, sources: Vec<Arc<dyn SensorSource>>) -> Station {
    let dir = tempfile::tempdir().expect("temp dir");
    let clock = Arc::new(ManualClock::new(ts(at)));
    let shared_clock: Arc<dyn Clock> = clock.clone();
    let stop = StopSignal::new();
    let sink = MemorySink::new();

    let capture = CaptureController::new(camera.clone(), dir.path(), "site", shared_clock.clone(), stop.clone())
        .with_settle(settle);
    let coordinator = sources.into_iter().fold(
        Coordinator::new(capture, Box::new(sink.clone()), shared_clock, stop.clone()),
        |coord, source| coord.with_source(source),
    );

    Station { coordinator, sink, clock, stop, camera, dir }
}
