//! Field station engine for FieldFuse
//!
//! Fuses readings from independently clocked sensor subsystems into one
//! time-correlated record per capture, drives a bracketed still capture on
//! an adaptive time-of-day cadence, and appends every record to a durable
//! log.
//!
//! Key properties:
//! - Each source owns one lock-guarded snapshot; the coordinator only merges
//! - A snapshot older than the staleness tolerance is nulled, never trusted
//! - A bracket is persisted whole or not at all
//! - One stop signal, passed to every component, ends every loop promptly
//!
//! ```no_run
//! use std::sync::Arc;
//! use fieldfuse_core::{
//!     CaptureController, Coordinator, CsvSink, StopSignal, SystemClock, Zone,
//! };
//! # use fieldfuse_core::{CaptureDevice, CaptureError, DeviceMetadata};
//! # struct Camera;
//! # impl CaptureDevice for Camera {
//! #     fn set_exposure(&mut self, _ev: f32) -> Result<(), CaptureError> { Ok(()) }
//! #     fn capture_still(&mut self, _p: &std::path::Path) -> Result<DeviceMetadata, CaptureError> {
//! #         Ok(DeviceMetadata::new())
//! #     }
//! # }
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//!
//! let stop = StopSignal::new();
//! let clock = Arc::new(SystemClock::new(Zone::Local));
//!
//! CsvSink::prepare("/data/dataset.csv")?;
//! let sink = CsvSink::open("/data/dataset.csv")?;
//! let capture = CaptureController::new(Camera, "/data/images", "site7", clock.clone(), stop.clone());
//!
//! let mut coordinator = Coordinator::new(capture, Box::new(sink), clock, stop);
//! coordinator.run()?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub mod capture;
pub mod coordinator;
pub mod errors;
pub mod record;
pub mod schedule;
pub mod snapshot;
pub mod stop;
pub mod storage;
pub mod time;
pub mod traits;

// Public API
pub use capture::{exposure_values, CaptureController, CaptureMetadata};
pub use coordinator::{Coordinator, CoordinatorState, CycleStats};
pub use errors::{
    CaptureError, ChannelError, ProtocolError, SchemaError, SetupError, SourceError, StorageError,
    StorageResult, TimestampError,
};
pub use record::{Field, FieldKind, Reading, UnifiedRecord};
pub use schedule::{Bracket, ScheduleBand, SchedulePlan, ScheduleTable};
pub use snapshot::{MergeOutcome, MergeReport, SensorSnapshot, SnapshotBuffer, StalenessPolicy};
pub use stop::StopSignal;
pub use storage::{CsvSink, MemorySink};
pub use time::{Clock, ManualClock, SystemClock, Timestamp, Zone};
pub use traits::{CaptureDevice, DeviceMetadata, RecordSink, SensorSource};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_exists() {
        assert!(!VERSION.is_empty());
    }
}
