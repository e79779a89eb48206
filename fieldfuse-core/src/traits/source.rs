//! Sensor Source Contract
//!
//! A sensor source owns one [`SnapshotBuffer`](crate::snapshot::SnapshotBuffer)
//! and keeps it fresh from its channel. Sources differ in how the buffer is
//! refreshed:
//!
//! - **Push**: a broker delivers messages; the delivery callback runs the
//!   source's `update`
//! - **Poll, long-lived**: a loop connects, reads a full cycle, publishes it,
//!   sleeps, repeats
//! - **Poll, on demand**: nothing runs in the background; the read happens
//!   inside `merge` and costs only the bus transaction
//!
//! Each source's `update` takes a channel-specific raw input, so it is an
//! inherent method of the concrete type. What the coordinator needs is
//! uniform and lives here.
//!
//! ## Threading
//!
//! Sources are shared between their own thread and the coordinator as
//! `Arc<dyn SensorSource>`. `run` is called once, on a dedicated thread,
//! for sources that report [`SensorSource::needs_thread`].

use crate::errors::SourceError;
use crate::record::UnifiedRecord;
use crate::snapshot::{MergeReport, StalenessPolicy};
use crate::stop::StopSignal;

/// A subsystem that contributes fields to the unified record
pub trait SensorSource: Send + Sync {
    /// Short name used for logs and thread names
    fn name(&self) -> &str;

    /// Merge the current snapshot into `target`
    ///
    /// Takes the source's lock for the duration of the copy only. Stale
    /// snapshots null the source's fields instead of copying them; see
    /// [`crate::snapshot`] for the exact policy.
    fn merge(&self, target: &mut UnifiedRecord, policy: StalenessPolicy) -> MergeReport;

    /// Whether `run` must be given its own thread
    fn needs_thread(&self) -> bool {
        false
    }

    /// Long-lived refresh loop
    ///
    /// Returns when `stop` is cancelled. Recoverable channel errors are
    /// logged and retried inside the loop; only an unusable channel returns
    /// an error.
    fn run(&self, stop: &StopSignal) -> Result<(), SourceError> {
        let _ = stop;
        Ok(())
    }
}
