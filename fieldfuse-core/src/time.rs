//! Time handling for the field station
//!
//! Every subsystem clocks itself differently: the push camera stamps frames
//! with its own (sometimes unset) RTC, the wireless board is stamped at the
//! start of each poll, and the station stamps captures as they happen. All
//! of them are normalized to one representation before anything is
//! published:
//!
//! - [`Timestamp`]: wall-clock second in the configured zone, text form
//!   `YYYYMMDDHHMMSS`
//! - [`Zone`]: the configured zone (`local` or a fixed `+HH:MM` offset)
//! - [`Clock`]: where "now" comes from (system clock, or a manual clock in
//!   tests)

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Duration, FixedOffset, Local, NaiveDate, NaiveDateTime, Offset, TimeZone, Timelike, Utc};

use crate::errors::TimestampError;

/// `strftime` form of the textual timestamp
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Width of the textual timestamp
pub const TIMESTAMP_WIDTH: usize = 14;

/// Wall-clock second in the configured zone
///
/// Ordering and differences are plain wall-clock arithmetic, so two
/// timestamps are only comparable when produced in the same [`Zone`],
/// which the station guarantees by handing one zone to every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(NaiveDateTime);

impl Timestamp {
    /// Initial timestamp of every snapshot buffer: 2025-01-01 00:00:00
    pub fn epoch() -> Self {
        Self::from_parts(2025, 1, 1, 0, 0, 0).unwrap_or(Self(NaiveDateTime::MIN))
    }

    /// Build from calendar parts, `None` if any part is out of range
    pub fn from_parts(year: i32, month: u32, day: u32, hour: u32, minute: u32, second: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|date| date.and_hms_opt(hour, minute, second))
            .map(Self)
    }

    /// Parse the fixed-width `YYYYMMDDHHMMSS` form
    pub fn parse(text: &str) -> Result<Self, TimestampError> {
        let invalid = || TimestampError { text: text.to_string() };

        if text.len() != TIMESTAMP_WIDTH || !text.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let part = |range: std::ops::Range<usize>| text[range].parse::<u32>().map_err(|_| invalid());
        let year = part(0..4)? as i32;

        Self::from_parts(year, part(4..6)?, part(6..8)?, part(8..10)?, part(10..12)?, part(12..14)?)
            .ok_or_else(invalid)
    }

    /// Normalize an absolute instant to wall-clock time in its own offset
    pub fn from_instant<Tz: TimeZone>(instant: &DateTime<Tz>) -> Self {
        Self(instant.naive_local().with_nanosecond(0).unwrap_or(instant.naive_local()))
    }

    /// Resolve back to an absolute instant in `zone`
    ///
    /// Returns `None` for wall-clock times skipped by a DST transition.
    pub fn to_instant(&self, zone: &Zone) -> Option<DateTime<FixedOffset>> {
        zone.localize(self.0)
    }

    /// Signed seconds from `earlier` to `self` (negative when `self` is older)
    pub fn seconds_since(&self, earlier: &Timestamp) -> i64 {
        (self.0 - earlier.0).num_seconds()
    }

    /// Shift by a signed number of seconds
    pub fn offset_by(&self, seconds: i64) -> Self {
        Self(self.0 + Duration::seconds(seconds))
    }

    /// Hour of day, 0-23
    pub fn hour(&self) -> u32 {
        self.0.hour()
    }

    /// Underlying wall-clock value
    pub fn naive(&self) -> NaiveDateTime {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(TIMESTAMP_FORMAT))
    }
}

impl FromStr for Timestamp {
    type Err = TimestampError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Zone all timestamps are expressed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(try_from = "String")]
pub enum Zone {
    /// Host's local zone, DST-aware
    Local,
    /// Fixed UTC offset
    Fixed(FixedOffset),
}

impl Zone {
    /// Current instant in this zone
    pub fn now(&self) -> DateTime<FixedOffset> {
        match self {
            Self::Local => {
                let now = Local::now();
                now.with_timezone(&now.offset().fix())
            }
            Self::Fixed(offset) => Utc::now().with_timezone(offset),
        }
    }

    fn localize(&self, naive: NaiveDateTime) -> Option<DateTime<FixedOffset>> {
        match self {
            Self::Local => Local
                .from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.with_timezone(&dt.offset().fix())),
            Self::Fixed(offset) => offset.from_local_datetime(&naive).single(),
        }
    }
}

impl Default for Zone {
    fn default() -> Self {
        Self::Local
    }
}

impl FromStr for Zone {
    type Err = String;

    /// Accepts `local`, `utc`, `Z`, or a `+HH:MM` / `-HH:MM` offset
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.to_ascii_lowercase().as_str() {
            "local" => return Ok(Self::Local),
            "utc" | "z" => return Ok(Self::Fixed(Utc.fix())),
            _ => {}
        }

        let bad = || format!("invalid timezone {s:?}, expected \"local\" or an offset like \"+08:00\"");
        let (sign, rest) = match s.as_bytes().first() {
            Some(b'+') => (1, &s[1..]),
            Some(b'-') => (-1, &s[1..]),
            _ => return Err(bad()),
        };
        let (hours, minutes) = rest.split_once(':').ok_or_else(bad)?;
        let hours: i32 = hours.parse().map_err(|_| bad())?;
        let minutes: i32 = minutes.parse().map_err(|_| bad())?;
        if !(0..60).contains(&minutes) {
            return Err(bad());
        }

        FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
            .map(Self::Fixed)
            .ok_or_else(bad)
    }
}

impl TryFrom<String> for Zone {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Source of "now" for every component
pub trait Clock: Send + Sync {
    /// Current wall-clock second
    fn now(&self) -> Timestamp;
}

/// Wall clock of the host, expressed in the configured zone
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock {
    zone: Zone,
}

impl SystemClock {
    pub fn new(zone: Zone) -> Self {
        Self { zone }
    }

    pub fn zone(&self) -> Zone {
        self.zone
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_instant(&self.zone.now())
    }
}

/// Manually driven clock for tests and replay
#[derive(Debug)]
pub struct ManualClock {
    current: Mutex<Timestamp>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self { current: Mutex::new(start) }
    }

    pub fn set(&self, timestamp: Timestamp) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = timestamp;
    }

    pub fn advance(&self, seconds: i64) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *current = current.offset_by(seconds);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}
