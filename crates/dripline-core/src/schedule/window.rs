//! Send Window - Daily recurring clock-time interval for outbound email

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use dripline_common::{Error, Result};
use serde::{Deserialize, Serialize};

/// Daily recurring time-of-day interval during which sending is permitted.
///
/// Immutable once constructed. Construction rejects `end <= start`, so a
/// window always has positive duration; cross-midnight windows are not
/// supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendWindow {
    start_of_day: NaiveTime,
    end_of_day: NaiveTime,
}

impl SendWindow {
    /// Create a new send window
    pub fn new(start_of_day: NaiveTime, end_of_day: NaiveTime) -> Result<Self> {
        if end_of_day <= start_of_day {
            return Err(Error::Validation(format!(
                "Send window end ({}) must be after start ({})",
                end_of_day, start_of_day
            )));
        }

        Ok(Self {
            start_of_day,
            end_of_day,
        })
    }

    /// Create a window from (hour, minute, second) triples
    pub fn from_hms(start: (u32, u32, u32), end: (u32, u32, u32)) -> Result<Self> {
        let start_of_day = NaiveTime::from_hms_opt(start.0, start.1, start.2)
            .ok_or_else(|| Error::Validation(format!("Invalid window start time: {:?}", start)))?;
        let end_of_day = NaiveTime::from_hms_opt(end.0, end.1, end.2)
            .ok_or_else(|| Error::Validation(format!("Invalid window end time: {:?}", end)))?;

        Self::new(start_of_day, end_of_day)
    }

    pub fn start_of_day(&self) -> NaiveTime {
        self.start_of_day
    }

    pub fn end_of_day(&self) -> NaiveTime {
        self.end_of_day
    }

    /// Window duration in milliseconds on any single day
    pub fn duration_ms(&self) -> i64 {
        (self.end_of_day - self.start_of_day).num_milliseconds().max(0)
    }

    /// Project the window start onto a calendar date
    pub fn start_on(&self, date: NaiveDate) -> NaiveDateTime {
        date.and_time(self.start_of_day)
    }

    /// Project the window end onto a calendar date
    pub fn end_on(&self, date: NaiveDate) -> NaiveDateTime {
        date.and_time(self.end_of_day)
    }

    /// Whether the instant falls inside that day's window (inclusive bounds)
    pub fn is_within(&self, instant: NaiveDateTime) -> bool {
        let date = instant.date();
        self.start_on(date) <= instant && instant <= self.end_on(date)
    }
}
