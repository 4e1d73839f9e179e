//! Calendar day to absolute hourly slot grid in a station's local time.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Days, FixedOffset, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use thiserror::Error;

use crate::telemetry::{TimeRange, SLOTS_PER_DAY, SLOT_SECONDS};

const DATE_FORMAT: &str = "%Y-%m-%d";
const LABEL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeWindowError {
    #[error("invalid date '{0}': expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error("invalid timezone '{0}': expected an IANA name or a +HH:MM offset")]
    InvalidTimezone(String),
    #[error("local time {0} does not exist in the target timezone")]
    NonexistentLocalTime(String),
}

/// Either an IANA zone or a fixed UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationTimezone {
    Named(Tz),
    Fixed(FixedOffset),
}

impl Default for StationTimezone {
    fn default() -> Self {
        Self::Named(chrono_tz::Asia::Shanghai)
    }
}

impl fmt::Display for StationTimezone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(tz) => write!(f, "{}", tz.name()),
            Self::Fixed(offset) => write!(f, "{offset}"),
        }
    }
}

impl FromStr for StationTimezone {
    type Err = TimeWindowError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if let Some(offset) = parse_fixed_offset(trimmed) {
            return Ok(Self::Fixed(offset));
        }
        trimmed
            .parse::<Tz>()
            .map(Self::Named)
            .map_err(|_| TimeWindowError::InvalidTimezone(raw.to_string()))
    }
}

impl StationTimezone {
    fn earliest_local(&self, naive: NaiveDateTime) -> Option<i64> {
        match self {
            Self::Named(tz) => first_instant(tz.from_local_datetime(&naive)),
            Self::Fixed(offset) => first_instant(offset.from_local_datetime(&naive)),
        }
    }

    fn latest_local(&self, naive: NaiveDateTime) -> Option<i64> {
        match self {
            Self::Named(tz) => last_instant(tz.from_local_datetime(&naive)),
            Self::Fixed(offset) => last_instant(offset.from_local_datetime(&naive)),
        }
    }

    /// Formats an absolute timestamp as a local wall-clock label.
    pub fn local_label(&self, ts: i64) -> String {
        let Some(utc) = DateTime::<Utc>::from_timestamp(ts, 0) else {
            return ts.to_string();
        };
        match self {
            Self::Named(tz) => utc.with_timezone(tz).format(LABEL_FORMAT).to_string(),
            Self::Fixed(offset) => utc.with_timezone(offset).format(LABEL_FORMAT).to_string(),
        }
    }

    pub fn local_date(&self, ts: i64) -> Option<NaiveDate> {
        let utc = DateTime::<Utc>::from_timestamp(ts, 0)?;
        Some(match self {
            Self::Named(tz) => utc.with_timezone(tz).date_naive(),
            Self::Fixed(offset) => utc.with_timezone(offset).date_naive(),
        })
    }
}

/// The canonical 24-slot grid for one local calendar day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayWindow {
    pub date: NaiveDate,
    pub range: TimeRange,
    pub slots: Vec<i64>,
}

impl DayWindow {
    /// Quality records are keyed by the day's first instant.
    pub fn day_marker(&self) -> i64 {
        self.range.start_ts
    }

    pub fn slot_index(&self, ts: i64) -> Option<usize> {
        self.slots.binary_search(&ts).ok()
    }
}

pub fn parse_date(raw: &str) -> Result<NaiveDate, TimeWindowError> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT)
        .map_err(|_| TimeWindowError::InvalidDate(raw.to_string()))
}

pub fn resolve_day_window(raw_date: &str, tz: &StationTimezone) -> Result<DayWindow, TimeWindowError> {
    let date = parse_date(raw_date)?;
    day_window_for(date, tz)
}

pub fn day_window_for(date: NaiveDate, tz: &StationTimezone) -> Result<DayWindow, TimeWindowError> {
    let midnight = date.and_hms_opt(0, 0, 0).ok_or_else(|| {
        TimeWindowError::InvalidDate(date.format(DATE_FORMAT).to_string())
    })?;
    let last_second = date.and_hms_opt(23, 59, 59).ok_or_else(|| {
        TimeWindowError::InvalidDate(date.format(DATE_FORMAT).to_string())
    })?;

    let start_ts = tz
        .earliest_local(midnight)
        .ok_or_else(|| TimeWindowError::NonexistentLocalTime(midnight.to_string()))?;
    let end_ts = tz
        .latest_local(last_second)
        .ok_or_else(|| TimeWindowError::NonexistentLocalTime(last_second.to_string()))?;

    let slots = (0..SLOTS_PER_DAY as i64)
        .map(|i| start_ts + i * SLOT_SECONDS)
        .collect();

    Ok(DayWindow {
        date,
        range: TimeRange { start_ts, end_ts },
        slots,
    })
}

/// Every date from `start` up to but excluding `end_exclusive`.
pub fn dates_between(start: NaiveDate, end_exclusive: NaiveDate) -> Vec<NaiveDate> {
    let mut out = Vec::new();
    let mut day = start;
    while day < end_exclusive {
        out.push(day);
        match day.checked_add_days(Days::new(1)) {
            Some(next) => day = next,
            None => break,
        }
    }
    out
}

fn first_instant<T: TimeZone>(local: LocalResult<DateTime<T>>) -> Option<i64> {
    local.earliest().map(|dt| dt.timestamp())
}

fn last_instant<T: TimeZone>(local: LocalResult<DateTime<T>>) -> Option<i64> {
    local.latest().map(|dt| dt.timestamp())
}

fn parse_fixed_offset(raw: &str) -> Option<FixedOffset> {
    let (sign, rest) = match raw.as_bytes().first()? {
        b'+' => (1, &raw[1..]),
        b'-' => (-1, &raw[1..]),
        _ => return None,
    };
    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h.parse::<i32>().ok()?, m.parse::<i32>().ok()?),
        None => (rest.parse::<i32>().ok()?, 0),
    };
    if !(0..=14).contains(&hours) || !(0..60).contains(&minutes) {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3_600 + minutes * 60))
}
