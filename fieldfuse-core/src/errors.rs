//! Error Types for the Field Station Engine
//!
//! ## Error Categories
//!
//! Every failure the station can hit falls in one of these buckets, and each
//! bucket has exactly one recovery policy:
//!
//! ### Channel failures
//! - `ChannelError`: connection drop, timeout, device not advertising.
//!   Retried with backoff by the owning source loop; never ends the thread.
//!
//! ### Data failures
//! - `ProtocolError`: unrecognized message tag or malformed payload. The
//!   message is logged and dropped.
//! - `SchemaError`: a source produced a field the unified record does not
//!   know, or a value of the wrong shape. The field is dropped, the cycle
//!   continues.
//!
//! ### Cycle failures
//! - `CaptureError`: device failure or incomplete bracket. The bracket for
//!   the current cycle is abandoned; no rows are written for it.
//! - `StorageError`: a row could not be appended. Logged; the next cycle
//!   tries again.
//!
//! ### Process failures
//! - `SetupError`: a required device or directory is absent at startup.
//!   This is the only category that stops the process.
//!
//! Staleness is deliberately absent from this list: a stale snapshot is a
//! policy outcome reported through [`crate::snapshot::MergeReport`], not an
//! error.
//!
//! ## Handling Pattern
//!
//! ```rust
//! use fieldfuse_core::errors::ChannelError;
//!
//! fn on_channel_failure(err: &ChannelError) -> bool {
//!     if err.is_transient() {
//!         // back off and reconnect
//!         true
//!     } else {
//!         // give up on this channel
//!         false
//!     }
//! }
//! # assert!(on_channel_failure(&ChannelError::Timeout));
//! ```

use std::path::PathBuf;

use thiserror::Error;

/// Result alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Failures of the transport underneath a sensor source
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Could not establish or keep a connection
    #[error("Connection failed: {0}")]
    Connect(String),

    /// A library-level timeout elapsed
    #[error("Timed out waiting for the channel")]
    Timeout,

    /// The named device was not found during discovery
    #[error("Device {0} not found")]
    DeviceNotFound(String),

    /// A read or write on an open channel failed
    #[error("Channel I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Backend reported an unrecoverable condition (bad adapter, bad config)
    #[error("Channel unavailable: {0}")]
    Unavailable(String),
}

impl ChannelError {
    /// Whether the owning loop should back off and retry
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Unavailable(_))
    }
}

/// A message arrived but could not be understood
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    /// The 3-byte type tag is not one we know
    #[error("Unknown message tag {0:?}")]
    UnknownTag(String),

    /// Payload too short for its fixed-width header
    #[error("Payload truncated: need {needed} bytes, got {got}")]
    Truncated {
        /// Minimum number of bytes the header needs
        needed: usize,
        /// Bytes actually received
        got: usize,
    },

    /// Payload structure is wrong
    #[error("Malformed payload: {0}")]
    Malformed(String),

    /// A characteristic value had the wrong byte length for its encoding
    #[error("Characteristic {name} expected {expected} bytes, got {got}")]
    BadLength {
        /// Field the characteristic feeds
        name: &'static str,
        /// Encoded width
        expected: usize,
        /// Received width
        got: usize,
    },
}

/// A source reported something the unified schema cannot hold
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchemaError {
    /// Field name is not part of the record schema
    #[error("Field {0:?} is not in the record schema")]
    UnknownField(String),

    /// Field exists but the value has the wrong shape
    #[error("Field {field} expects {expected}, got {got}")]
    TypeMismatch {
        /// Column name
        field: &'static str,
        /// Expected kind
        expected: &'static str,
        /// Kind that was supplied
        got: &'static str,
    },
}

/// Capture failures; any of these abandons the whole bracket
#[derive(Debug, Error)]
pub enum CaptureError {
    /// A bracket must contain at least one exposure
    #[error("Bracket needs at least one frame, got {0}")]
    EmptyBracket(usize),

    /// Device rejected a setting or failed to produce an image
    #[error("Capture device failed: {0}")]
    Device(String),

    /// Fewer frames than requested came back
    #[error("Incomplete bracket: expected {expected} frames, got {got}")]
    Incomplete {
        /// Frames requested
        expected: usize,
        /// Frames captured before failure
        got: usize,
    },

    /// Shutdown was requested while the bracket was running
    #[error("Capture cancelled by shutdown")]
    Cancelled,

    /// Every numbered variant of the image name is already taken
    #[error("No free image name for {0}")]
    NamesExhausted(String),

    /// Image directory or metadata file problem
    #[error("Capture I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable storage failures
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying file operation failed
    #[error("Record log I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Log file exists but its header does not match the schema
    #[error("Record log {path} has an unexpected header")]
    HeaderMismatch {
        /// Offending log file
        path: PathBuf,
    },
}

/// Startup failures that abort the process before scheduling begins
#[derive(Debug, Error)]
pub enum SetupError {
    /// A directory the station writes into is missing
    #[error("Required directory {0} is missing (is the drive mounted?)")]
    MissingDirectory(PathBuf),

    /// A required device could not be opened or probed
    #[error("Required device unavailable: {0}")]
    Device(String),

    /// Configuration is internally inconsistent
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Timestamp text could not be parsed
#[derive(Debug, Error, Clone, PartialEq)]
#[error("Invalid timestamp {text:?}: expected YYYYMMDDHHMMSS")]
pub struct TimestampError {
    /// Offending input
    pub text: String,
}

/// Failure returned by a source's long-lived loop
#[derive(Debug, Error)]
pub enum SourceError {
    /// The channel cannot be used at all; the loop gave up
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Source could not be set up
    #[error(transparent)]
    Setup(#[from] SetupError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ChannelError::Timeout.is_transient());
        assert!(ChannelError::Connect("refused".into()).is_transient());
        assert!(ChannelError::DeviceNotFound("cam".into()).is_transient());
        assert!(!ChannelError::Unavailable("no adapter".into()).is_transient());
    }

    #[test]
    fn error_messages_name_the_problem() {
        let err = SchemaError::UnknownField("uv".into());
        assert_eq!(err.to_string(), "Field \"uv\" is not in the record schema");

        let err = CaptureError::Incomplete { expected: 5, got: 3 };
        assert_eq!(err.to_string(), "Incomplete bracket: expected 5 frames, got 3");
    }
}
