//! Guarded Snapshot Buffers and the Staleness Merge
//!
//! ## Overview
//!
//! Each sensor source owns exactly one [`SnapshotBuffer`]: the last set of
//! values it observed plus the time it observed them. The buffer is the
//! only shared state between a source's own thread and the coordinator, and
//! it exposes only two operations:
//!
//! - [`SnapshotBuffer::publish`], called by the source's update path
//! - [`SnapshotBuffer::merge_into`], called by the coordinator
//!
//! The raw map never leaves the lock. Parsing, I/O and decoding happen
//! before `publish` takes the lock, so the critical section is a handful of
//! map writes.
//!
//! ## Merge Policy
//!
//! With `Δ = source.timestamp - target.timestamp` (seconds) and tolerance
//! `t`:
//!
//! ```text
//! Δ < -t        source is stale     every field the source owns -> unknown
//! -t <= Δ <= 0  source is current   fields copied verbatim
//! Δ > 0         source is newer     fields copied, target timestamp advanced
//! ```
//!
//! The same policy applies to every source, whichever channel feeds it.
//!
//! ## Schema Problems
//!
//! A source may hold a field the record schema does not know (the push
//! channel accepts arbitrary `name:value` pairs). Such fields are reported
//! in the [`MergeReport`] and skipped; the rest of the merge proceeds.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, error, warn};

use crate::errors::SchemaError;
use crate::record::{Field, Reading, UnifiedRecord};
use crate::time::Timestamp;

/// Staleness tolerance for one source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessPolicy {
    tolerance_secs: i64,
}

impl StalenessPolicy {
    /// Default delay tolerance of the field deployment: ten minutes
    pub const DEFAULT_TOLERANCE_SECS: i64 = 600;

    pub fn new(tolerance: Duration) -> Self {
        Self { tolerance_secs: tolerance.as_secs().min(i64::MAX as u64) as i64 }
    }

    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    pub fn tolerance_secs(&self) -> i64 {
        self.tolerance_secs
    }

    /// True when a source `delta_secs` newer (negative: older) than the
    /// target may no longer be trusted
    pub fn is_stale(&self, delta_secs: i64) -> bool {
        delta_secs < -self.tolerance_secs
    }
}

impl Default for StalenessPolicy {
    fn default() -> Self {
        Self { tolerance_secs: Self::DEFAULT_TOLERANCE_SECS }
    }
}

/// Read-only copy of a source's buffer
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSnapshot {
    /// When the values were observed
    pub timestamp: Timestamp,
    /// Owned fields by column name; `None` means unknown
    pub readings: BTreeMap<String, Option<Reading>>,
}

impl SensorSnapshot {
    /// Snapshot owning `fields`, all unknown, stamped [`Timestamp::epoch`]
    pub fn with_fields<'a>(fields: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            timestamp: Timestamp::epoch(),
            readings: fields.into_iter().map(|name| (name.to_string(), None)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Reading> {
        self.readings.get(name).and_then(Option::as_ref)
    }
}

/// How a merge went
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Fields copied; `advanced` when the target timestamp moved forward
    Copied { advanced: bool },
    /// Source older than tolerance allows; its fields were nulled
    Stale { age_secs: i64 },
}

/// Result of merging one source into a record
#[derive(Debug, Clone, PartialEq)]
pub struct MergeReport {
    pub outcome: MergeOutcome,
    /// Signed source-minus-target delta in seconds
    pub delta_secs: i64,
    /// Fields the record refused
    pub mismatches: Vec<SchemaError>,
}

impl MergeReport {
    pub fn is_stale(&self) -> bool {
        matches!(self.outcome, MergeOutcome::Stale { .. })
    }
}

/// Lock-guarded snapshot owned by one sensor source
#[derive(Debug)]
pub struct SnapshotBuffer {
    source: String,
    inner: Mutex<SensorSnapshot>,
}

impl SnapshotBuffer {
    /// Buffer for `source` owning `fields`, all unknown at [`Timestamp::epoch`]
    pub fn new<'a>(source: impl Into<String>, fields: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            source: source.into(),
            inner: Mutex::new(SensorSnapshot::with_fields(fields)),
        }
    }

    /// Owning source's name, used in logs
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Write new values and the time they were observed
    ///
    /// Fields not mentioned keep their previous value. A timestamp older than
    /// the one already held is logged and still stored.
    pub fn publish<I, K>(&self, timestamp: Timestamp, readings: I)
    where
        I: IntoIterator<Item = (K, Option<Reading>)>,
        K: Into<String>,
    {
        let mut snapshot = self.lock();
        if timestamp < snapshot.timestamp {
            warn!(
                "{}: snapshot time went backwards ({} -> {})",
                self.source, snapshot.timestamp, timestamp
            );
        }
        for (name, reading) in readings {
            snapshot.readings.insert(name.into(), reading);
        }
        snapshot.timestamp = timestamp;
    }

    /// Copy of the current snapshot
    pub fn snapshot(&self) -> SensorSnapshot {
        self.lock().clone()
    }

    /// Merge this buffer into `target` under `policy`
    pub fn merge_into(&self, target: &mut UnifiedRecord, policy: StalenessPolicy) -> MergeReport {
        let snapshot = self.lock();
        let delta_secs = snapshot.timestamp.seconds_since(&target.timestamp);
        debug!("{}: source is {}s relative to record", self.source, delta_secs);

        let mut mismatches = Vec::new();
        let outcome = if policy.is_stale(delta_secs) {
            warn!(
                "{}: data outdated by {}s (>{}s), fields nulled",
                self.source,
                -delta_secs,
                policy.tolerance_secs()
            );
            for name in snapshot.readings.keys() {
                match name.parse::<Field>() {
                    Ok(field) => target.clear(field),
                    Err(e) => mismatches.push(e),
                }
            }
            MergeOutcome::Stale { age_secs: -delta_secs }
        } else {
            for (name, reading) in &snapshot.readings {
                if let Err(e) = target.set_named(name, reading.clone()) {
                    mismatches.push(e);
                }
            }
            let advanced = delta_secs > 0;
            if advanced {
                target.timestamp = snapshot.timestamp;
            }
            MergeOutcome::Copied { advanced }
        };
        drop(snapshot);

        for mismatch in &mismatches {
            error!("{}: {}", self.source, mismatch);
        }

        MergeReport { outcome, delta_secs, mismatches }
    }

    fn lock(&self) -> MutexGuard<'_, SensorSnapshot> {
        // A poisoned buffer still holds the last complete publish.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
