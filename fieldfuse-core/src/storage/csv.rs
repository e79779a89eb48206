//! Append-only CSV record log
//!
//! ## Format
//!
//! ```csv
//! timestamp,image,aec_level,agc_gain,amb,r,g,b,temp,pressure,humidity,gas,co2,accel,gyro,euler,quat
//! 20250601063000,site7_20250601063000.jpg,-2,1.5,812,301,288,190,14.2,1009.5,81,52011,612,"(0.01, -0.02, 0.98)",,,
//! ```
//!
//! - Unknown values are empty cells
//! - Vectors render as `(x, y, z)` and are always quoted
//! - Text containing `,`, `"` or a newline is quoted with `""` escaping
//!
//! ## Durability
//!
//! The file is opened in append mode and never truncated or rewritten. Each
//! row goes out in a single write followed by `sync_data`, so a crash leaves
//! at worst a missing row, never a partial one.
//!
//! The header is a setup concern: [`CsvSink::prepare`] writes it once for a
//! new or empty file and checks it otherwise. Opening a sink never writes a
//! header.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::errors::{StorageError, StorageResult};
use crate::record::{header, Reading, UnifiedRecord};
use crate::traits::RecordSink;

/// Statistics for a CSV sink
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CsvSinkStats {
    /// Rows appended successfully
    pub rows_written: usize,
    /// Bytes appended, including newlines
    pub bytes_written: usize,
}

/// Append-only CSV sink
#[derive(Debug)]
pub struct CsvSink {
    path: PathBuf,
    file: File,
    stats: CsvSinkStats,
}

impl CsvSink {
    /// Write the header if `path` is absent or empty, else verify it
    pub fn prepare(path: impl AsRef<Path>) -> StorageResult<()> {
        let path = path.as_ref();
        let mut file = OpenOptions::new().create(true).append(true).read(true).open(path)?;

        if file.metadata()?.len() == 0 {
            info!("Creating record log {}", path.display());
            file.write_all(format!("{}\n", header()).as_bytes())?;
            file.sync_data()?;
            return Ok(());
        }

        let mut first = String::new();
        BufReader::new(&file).read_line(&mut first)?;
        if first.trim_end_matches(['\r', '\n']) != header() {
            return Err(StorageError::HeaderMismatch { path: path.to_path_buf() });
        }
        debug!("Record log {} has the expected header", path.display());
        Ok(())
    }

    /// Open `path` for appending, creating it if needed
    pub fn open(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file, stats: CsvSinkStats::default() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get statistics
    pub fn stats(&self) -> &CsvSinkStats {
        &self.stats
    }

    /// Render one row, without trailing newline
    pub fn render(record: &UnifiedRecord) -> String {
        let mut row = record.timestamp.to_string();
        for (_, cell) in record.cells() {
            row.push(',');
            if let Some(reading) = cell {
                row.push_str(&render_cell(&reading));
            }
        }
        row
    }
}

impl RecordSink for CsvSink {
    fn append(&mut self, record: &UnifiedRecord) -> StorageResult<()> {
        let mut line = Self::render(record);
        line.push('\n');

        self.file.write_all(line.as_bytes())?;
        self.file.sync_data()?;

        self.stats.rows_written += 1;
        self.stats.bytes_written += line.len();
        Ok(())
    }
}

fn render_cell(reading: &Reading) -> String {
    let text = reading.to_string();
    let needs_quotes = matches!(reading, Reading::Vec3(_) | Reading::Quat(_))
        || text.contains([',', '"', '\n', '\r']);

    if needs_quotes {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Timestamp;
    use std::fs;

    fn record() -> UnifiedRecord {
        let mut rec = UnifiedRecord::new(Timestamp::parse("20250601063000").unwrap());
        rec.image = Some("site7_20250601063000.jpg".into());
        rec.aec_level = Some(-2.0);
        rec.amb = Some(812);
        rec.temp = Some(14.25);
        rec.accel = Some([0.5, -1.0, 9.75]);
        rec
    }

    #[test]
    fn renders_every_column() {
        let row = CsvSink::render(&record());
        assert_eq!(
            row,
            "20250601063000,site7_20250601063000.jpg,-2,,812,,,,14.25,,,,,\"(0.5, -1, 9.75)\",,,"
        );
        assert_eq!(row.matches(',').count(), header().matches(',').count() + 2);
    }

    #[test]
    fn quotes_awkward_text() {
        let mut rec = UnifiedRecord::new(Timestamp::epoch());
        rec.image = Some("a,\"b\".jpg".into());
        assert!(CsvSink::render(&rec).starts_with("20250101000000,\"a,\"\"b\"\".jpg\","));
    }

    #[test]
    fn prepare_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.csv");

        CsvSink::prepare(&path).unwrap();
        CsvSink::prepare(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, format!("{}\n", header()));
    }

    #[test]
    fn prepare_rejects_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.csv");
        fs::write(&path, "time,value\n1,2\n").unwrap();

        assert!(matches!(CsvSink::prepare(&path), Err(StorageError::HeaderMismatch { .. })));
    }

    #[test]
    fn appends_never_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.csv");
        CsvSink::prepare(&path).unwrap();

        {
            let mut sink = CsvSink::open(&path).unwrap();
            sink.append(&record()).unwrap();
            assert_eq!(sink.stats().rows_written, 1);
        }
        {
            let mut sink = CsvSink::open(&path).unwrap();
            sink.append(&record()).unwrap();
        }

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], header());
        assert_eq!(lines[1], lines[2]);
    }
}
