use chrono::{Datelike, NaiveDate};
use chrono_tz::Tz;

use crate::model::{HostState, WallTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalSource {
    WeeklyRule,
    DateOverride,
}

impl IntervalSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalSource::WeeklyRule => "weekly_rule",
            IntervalSource::DateOverride => "date_override",
        }
    }
}

/// One open wall-clock interval on the resolved date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenInterval {
    pub start: WallTime,
    pub end: WallTime,
    pub timezone: Tz,
    pub source: IntervalSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Closed,
    Open(Vec<OpenInterval>),
}

impl Resolution {
    pub fn intervals(&self) -> &[OpenInterval] {
        match self {
            Resolution::Closed => &[],
            Resolution::Open(intervals) => intervals,
        }
    }
}

/// 0 = Sunday .. 6 = Saturday.
pub fn weekday_index(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

/// Open intervals of `host` on `date`.
///
/// An override for the date wins outright: unavailable closes the day, and
/// explicit times replace the weekly rules in the host's zone. Anything else
/// falls back to the weekly rules for the weekday, ordered by start and left
/// unmerged.
pub fn resolve(host: &HostState, date: NaiveDate) -> Resolution {
    if let Some(ov) = host.overrides.get(&date) {
        if !ov.is_available {
            return Resolution::Closed;
        }
        if let (Some(start), Some(end)) = (ov.start, ov.end) {
            return Resolution::Open(vec![OpenInterval {
                start,
                end,
                timezone: host.timezone,
                source: IntervalSource::DateOverride,
            }]);
        }
    }

    let mut intervals: Vec<OpenInterval> = host
        .rules_for_weekday(weekday_index(date))
        .map(|r| OpenInterval {
            start: r.start,
            end: r.end,
            timezone: r.timezone,
            source: IntervalSource::WeeklyRule,
        })
        .collect();
    if intervals.is_empty() {
        return Resolution::Closed;
    }
    intervals.sort_by_key(|i| i.start);
    Resolution::Open(intervals)
}
