//! In-memory sink for testing and dry runs
//!
//! Clones share the same row list, so a test can hand one clone to the
//! coordinator and inspect the rows through another.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::errors::{StorageError, StorageResult};
use crate::record::UnifiedRecord;
use crate::traits::RecordSink;

#[derive(Debug, Default)]
struct Shared {
    rows: Mutex<Vec<UnifiedRecord>>,
    failing: AtomicBool,
}

/// Shared in-memory row list
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    shared: Arc<Shared>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every row appended so far
    pub fn rows(&self) -> Vec<UnifiedRecord> {
        self.shared.rows.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.shared.rows.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make subsequent appends fail with an I/O error
    pub fn set_failing(&self, failing: bool) {
        self.shared.failing.store(failing, Ordering::SeqCst);
    }
}

impl RecordSink for MemorySink {
    fn append(&mut self, record: &UnifiedRecord) -> StorageResult<()> {
        if self.shared.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Io(io::Error::new(io::ErrorKind::Other, "sink offline")));
        }
        self.shared.rows.lock().unwrap_or_else(|e| e.into_inner()).push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Timestamp;

    #[test]
    fn clones_share_rows() {
        let sink = MemorySink::new();
        let mut writer = sink.clone();

        writer.append(&UnifiedRecord::new(Timestamp::epoch())).unwrap();
        assert_eq!(sink.len(), 1);

        sink.set_failing(true);
        assert!(writer.append(&UnifiedRecord::new(Timestamp::epoch())).is_err());
        assert_eq!(sink.rows().len(), 1);
    }
}
