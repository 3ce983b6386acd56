// =============================================================================
// Timeframe — bucket granularity for bar aggregation
// =============================================================================
//
// Codes follow the provider convention `<unit><size>`:
//   t = tick, m = minute, H = hour, D = day, W = week, M = month.
// Minute/hour/day sizes floor on the UNIX epoch grid; weeks start Monday
// 00:00 UTC; months start on the 1st and multi-month sizes align on January.
// =============================================================================

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, TimeZone, Utc};

use crate::error::TimeframeError;

const WEEK_SECS: i64 = 7 * 86_400;
/// 1970-01-05 00:00 UTC, the first Monday after the epoch.
const FIRST_MONDAY_SECS: i64 = 4 * 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeframeUnit {
    Tick,
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

impl TimeframeUnit {
    fn code(self) -> char {
        match self {
            Self::Tick => 't',
            Self::Minute => 'm',
            Self::Hour => 'H',
            Self::Day => 'D',
            Self::Week => 'W',
            Self::Month => 'M',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Timeframe {
    pub unit: TimeframeUnit,
    pub size: u32,
}

impl Timeframe {
    pub const fn minutes(size: u32) -> Self {
        Self {
            unit: TimeframeUnit::Minute,
            size,
        }
    }

    pub const fn hours(size: u32) -> Self {
        Self {
            unit: TimeframeUnit::Hour,
            size,
        }
    }

    pub fn is_tick(&self) -> bool {
        self.unit == TimeframeUnit::Tick
    }

    /// Reject tick-level granularity; aggregation is bar-only.
    pub fn ensure_bars(&self) -> Result<(), TimeframeError> {
        if self.is_tick() {
            return Err(TimeframeError::TickGranularity(self.to_string()));
        }
        Ok(())
    }

    /// Map a timestamp to the start of the bucket containing it.
    pub fn bucket_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let size = i64::from(self.size.max(1));
        match self.unit {
            TimeframeUnit::Tick => ts,
            TimeframeUnit::Minute => floor_epoch(ts, 60 * size),
            TimeframeUnit::Hour => floor_epoch(ts, 3_600 * size),
            TimeframeUnit::Day => floor_epoch(ts, 86_400 * size),
            TimeframeUnit::Week => {
                let step = WEEK_SECS * size;
                let offset = (ts.timestamp() - FIRST_MONDAY_SECS).rem_euclid(step);
                Utc.timestamp_opt(ts.timestamp() - offset, 0)
                    .single()
                    .unwrap_or(ts)
            }
            TimeframeUnit::Month => {
                let index = i64::from(ts.year()) * 12 + i64::from(ts.month0());
                let aligned = index - index.rem_euclid(size);
                let year = aligned.div_euclid(12) as i32;
                let month = aligned.rem_euclid(12) as u32 + 1;
                Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
                    .single()
                    .unwrap_or(ts)
            }
        }
    }
}

fn floor_epoch(ts: DateTime<Utc>, step_secs: i64) -> DateTime<Utc> {
    let secs = ts.timestamp();
    let floored = secs - secs.rem_euclid(step_secs);
    Utc.timestamp_opt(floored, 0).single().unwrap_or(ts)
}

impl FromStr for Timeframe {
    type Err = TimeframeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim();
        let mut chars = code.chars();
        let unit = match chars.next() {
            Some('t') => TimeframeUnit::Tick,
            Some('m') => TimeframeUnit::Minute,
            Some('H') => TimeframeUnit::Hour,
            Some('D') => TimeframeUnit::Day,
            Some('W') => TimeframeUnit::Week,
            Some('M') => TimeframeUnit::Month,
            _ => return Err(TimeframeError::Unrecognized(s.to_string())),
        };
        let size: u32 = chars
            .as_str()
            .parse()
            .map_err(|_| TimeframeError::Unrecognized(s.to_string()))?;
        if size == 0 {
            return Err(TimeframeError::Unrecognized(s.to_string()));
        }
        Ok(Self { unit, size })
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.unit.code(), self.size)
    }
}
