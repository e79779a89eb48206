//! Record Sink Contract

use crate::errors::StorageResult;
use crate::record::UnifiedRecord;

/// Append-only destination for persisted rows
///
/// Implementations must write each record as one complete row and must
/// never rewrite earlier rows.
pub trait RecordSink: Send {
    /// Append one schema-complete row
    fn append(&mut self, record: &UnifiedRecord) -> StorageResult<()>;
}
