//! Durable record storage
//!
//! Sinks receive schema-complete [`UnifiedRecord`](crate::record::UnifiedRecord)
//! rows through the [`RecordSink`](crate::traits::RecordSink) trait.
//!
//! ## Available Sinks
//!
//! - [`CsvSink`]: append-only CSV log, the production sink
//! - [`MemorySink`]: in-memory rows for tests and dry runs

pub mod csv;
pub mod memory;

pub use csv::{CsvSink, CsvSinkStats};
pub use memory::MemorySink;
