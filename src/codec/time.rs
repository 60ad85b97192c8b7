//! CP56Time2a seven-octet absolute timestamp
//!
//! Wire layout (little-endian fields):
//!
//! ```text
//! | milliseconds (D7..D0)                  |  milliseconds = 0..=59999
//! | milliseconds (D15..D8)                 |  (seconds * 1000 + ms)
//! | IV(D7)  RES(D6)  minutes (D5..D0)      |  minutes = 0..=59
//! | SU(D7)  RES(D6..D5)  hours (D4..D0)    |  hours = 0..=23
//! | day-of-week (D7..D5)  day (D4..D0)     |  day = 1..=31
//! | RES(D7..D4)  month (D3..D0)            |  month = 1..=12
//! | RES(D7)  year (D6..D0)                 |  year = 0..=99, offset 2000
//! ```
//!
//! The day-of-week bits are ignored on decode and zeroed on encode. A set IV
//! bit does not stop decoding; it is surfaced through [`Cp56Time2a::invalid`]
//! so the caller can fold it into the object's quality.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of octets in the wire representation.
pub const CP56_SIZE: usize = 7;

/// CP56Time2a timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cp56Time2a {
    /// Milliseconds within the minute (0..=59999)
    pub millis: u16,
    /// Minute (0..=59)
    pub minute: u8,
    /// Hour (0..=23)
    pub hour: u8,
    /// Day of month (1..=31)
    pub day: u8,
    /// Month (1..=12)
    pub month: u8,
    /// Year offset from 2000 (0..=99)
    pub year: u8,
    /// IV bit: timestamp flagged invalid by the sender
    pub invalid: bool,
}

impl Cp56Time2a {
    /// Decode from seven wire octets.
    pub fn from_bytes(bytes: &[u8; CP56_SIZE]) -> Self {
        let millis = u16::from_le_bytes([bytes[0], bytes[1]]);
        Self {
            millis,
            minute: bytes[2] & 0x3F,
            invalid: (bytes[2] & 0x80) != 0,
            hour: bytes[3] & 0x1F,
            day: bytes[4] & 0x1F,
            month: bytes[5] & 0x0F,
            year: bytes[6] & 0x7F,
        }
    }

    /// Encode to seven wire octets. Reserved and day-of-week bits are zero.
    pub fn to_bytes(self) -> [u8; CP56_SIZE] {
        let [ms_lo, ms_hi] = self.millis.to_le_bytes();
        [
            ms_lo,
            ms_hi,
            (self.minute & 0x3F) | if self.invalid { 0x80 } else { 0 },
            self.hour & 0x1F,
            self.day & 0x1F,
            self.month & 0x0F,
            self.year & 0x7F,
        ]
    }

    /// Build from an absolute timestamp. Sub-millisecond precision is lost.
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self {
            millis: (dt.second() * 1000 + dt.timestamp_subsec_millis()) as u16,
            minute: dt.minute() as u8,
            hour: dt.hour() as u8,
            day: dt.day() as u8,
            month: dt.month() as u8,
            year: (dt.year() - 2000).clamp(0, 99) as u8,
            invalid: false,
        }
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Convert to an absolute timestamp. `None` when the calendar fields do
    /// not name a real instant (e.g. month 0 or Feb 30 from a broken peer).
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        let secs = (self.millis / 1000) as u32;
        let ms = (self.millis % 1000) as u32;
        Utc.with_ymd_and_hms(
            2000 + self.year as i32,
            self.month as u32,
            self.day as u32,
            self.hour as u32,
            self.minute as u32,
            secs,
        )
        .single()
        .map(|dt| dt + chrono::Duration::milliseconds(ms as i64))
    }
}

impl fmt::Display for Cp56Time2a {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "20{:02}-{:02}-{:02} {:02}:{:02}:{:02}.{:03}{}",
            self.year,
            self.month,
            self.day,
            self.hour,
            self.minute,
            self.millis / 1000,
            self.millis % 1000,
            if self.invalid { " (IV)" } else { "" }
        )
    }
}
