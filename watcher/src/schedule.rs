//! Cron schedule parsing and window arithmetic.
//!
//! Expressions use the classic five fields (minute, hour, day of month,
//! month, day of week) and are matched against local wall-clock time.
//! Evaluation always starts from a UTC instant: the local offset is looked
//! up for that instant on every query, so a long running process follows
//! daylight saving changes without restarting.

use std::fmt;

use chrono::{
    DateTime, Datelike, FixedOffset, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta,
    TimeZone, Timelike, Utc,
};

use crate::error::ScheduleError;

/// Smallest distance between two occurrences.
pub const GRANULARITY: TimeDelta = TimeDelta::minutes(1);

/// How far back [`ScheduleEvaluator::is_continuous`] looks for a previous
/// occurrence.
pub const LOOKBACK: TimeDelta = TimeDelta::hours(1);

/// Upper bound on the number of days scanned for the next occurrence.
/// Eight years covers leap days skipped by a non-leap century.
const MAX_SCAN_DAYS: u32 = 366 * 8;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];

const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Set of allowed values for one cron field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet(u64);

impl FieldSet {
    fn contains(self, value: u32) -> bool {
        value < 64 && self.0 & (1 << value) != 0
    }

    fn insert(&mut self, value: u32) {
        self.0 |= 1 << value;
    }

    /// Smallest member that is `>= from`.
    fn first_from(self, from: u32) -> Option<u32> {
        if from >= 64 {
            return None;
        }
        let masked = self.0 & (u64::MAX << from);
        if masked == 0 {
            None
        } else {
            Some(masked.trailing_zeros())
        }
    }

    fn first(self) -> Option<u32> {
        self.first_from(0)
    }

    fn last(self) -> Option<u32> {
        if self.0 == 0 {
            None
        } else {
            Some(63 - self.0.leading_zeros())
        }
    }
}

/// Static description of a cron field.
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    /// Value the first entry of `names` maps to.
    names_base: u32,
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
    names_base: 0,
};

const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
    names_base: 0,
};

const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
    names_base: 0,
};

const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: &MONTH_NAMES,
    names_base: 1,
};

// 7 is accepted as an alias for Sunday and folded into 0 after parsing.
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: &WEEKDAY_NAMES,
    names_base: 0,
};

impl FieldSpec {
    fn invalid(&self, value: &str) -> ScheduleError {
        ScheduleError::InvalidField {
            field: self.name,
            value: value.to_string(),
        }
    }

    fn value(&self, raw: &str) -> Result<u32, ScheduleError> {
        let value = match raw.parse::<u32>() {
            Ok(value) => value,
            Err(_) => self
                .names
                .iter()
                .position(|name| name.eq_ignore_ascii_case(raw))
                .and_then(|index| u32::try_from(index).ok())
                .map(|index| index + self.names_base)
                .ok_or_else(|| self.invalid(raw))?,
        };

        if value < self.min || value > self.max {
            return Err(ScheduleError::OutOfRange {
                field: self.name,
                value,
                min: self.min,
                max: self.max,
            });
        }
        Ok(value)
    }

    /// Parse a whole field. Returns the value set and whether the field
    /// restricts anything (i.e. is not a bare wildcard).
    fn parse(&self, field: &str) -> Result<(FieldSet, bool), ScheduleError> {
        let mut set = FieldSet(0);
        let restricted = !(field.starts_with('*') || field.starts_with('?'));

        for item in field.split(',') {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => {
                    let step = step
                        .parse::<u32>()
                        .ok()
                        .filter(|step| *step > 0)
                        .ok_or_else(|| self.invalid(item))?;
                    (range, Some(step))
                }
                None => (item, None),
            };

            let (start, end) = if range == "*" || range == "?" {
                (self.min, self.max)
            } else if let Some((low, high)) = range.split_once('-') {
                let (low, high) = (self.value(low)?, self.value(high)?);
                if low > high {
                    return Err(self.invalid(item));
                }
                (low, high)
            } else {
                let value = self.value(range)?;
                // `5/15` means "from 5 to the end of the range, every 15".
                match step {
                    Some(_) => (value, self.max),
                    None => (value, value),
                }
            };

            let step = step.unwrap_or(1);
            let mut value = start;
            while value <= end {
                set.insert(value);
                value = value.saturating_add(step);
            }
        }

        Ok((set, restricted))
    }
}

/// A parsed five-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    /// Parse a cron expression.
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let [minute, hour, dom, month, dow] = fields.as_slice() else {
            return Err(ScheduleError::FieldCount(fields.len()));
        };

        let (minutes, _) = MINUTE.parse(minute)?;
        let (hours, _) = HOUR.parse(hour)?;
        let (days_of_month, dom_restricted) = DAY_OF_MONTH.parse(dom)?;
        let (months, _) = MONTH.parse(month)?;
        let (mut days_of_week, dow_restricted) = DAY_OF_WEEK.parse(dow)?;
        if days_of_week.contains(7) {
            days_of_week.0 &= !(1 << 7);
            days_of_week.insert(0);
        }

        Ok(Self {
            expression: fields.join(" "),
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted,
            dow_restricted,
        })
    }

    /// Whether the schedule fires on the given calendar day.
    pub fn matches_day(&self, date: NaiveDate) -> bool {
        if !self.months.contains(date.month()) {
            return false;
        }
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());

        // Vixie cron: when both day fields are restricted either may match.
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// Whether the schedule fires at the given minute.
    pub fn matches(&self, at: NaiveDateTime) -> bool {
        self.matches_day(at.date())
            && self.hours.contains(at.hour())
            && self.minutes.contains(at.minute())
    }

    /// Next matching minute at or after `start`. A `start` with a non-zero
    /// seconds component is rounded up to the following minute.
    pub fn next_from(&self, start: NaiveDateTime) -> Option<NaiveDateTime> {
        let truncated = start.with_second(0)?.with_nanosecond(0)?;
        let start = if truncated < start {
            truncated + GRANULARITY
        } else {
            truncated
        };

        let mut date = start.date();
        let (mut hour, mut minute) = (start.hour(), start.minute());
        for _ in 0..MAX_SCAN_DAYS {
            if self.matches_day(date) {
                if let Some(time) = self.first_time_from(hour, minute) {
                    return Some(date.and_time(time));
                }
            }
            date = date.succ_opt()?;
            (hour, minute) = (0, 0);
        }
        None
    }

    /// Most recent matching minute strictly before `end`, searching no
    /// further back than `lookback`.
    pub fn previous_before(&self, end: NaiveDateTime, lookback: TimeDelta) -> Option<NaiveDateTime> {
        let mut cursor = end - lookback;
        let mut last = None;
        while let Some(next) = self.next_from(cursor) {
            if next >= end {
                break;
            }
            last = Some(next);
            cursor = next + GRANULARITY;
        }
        last
    }

    /// First and last occurrence on `date`, if the schedule fires that day.
    pub fn day_window(&self, date: NaiveDate) -> Option<(NaiveDateTime, NaiveDateTime)> {
        if !self.matches_day(date) {
            return None;
        }
        let first = NaiveTime::from_hms_opt(self.hours.first()?, self.minutes.first()?, 0)?;
        let last = NaiveTime::from_hms_opt(self.hours.last()?, self.minutes.last()?, 0)?;
        Some((date.and_time(first), date.and_time(last)))
    }

    fn first_time_from(&self, hour: u32, minute: u32) -> Option<NaiveTime> {
        let mut candidate = self.hours.first_from(hour)?;
        let mut from_minute = if candidate == hour { minute } else { 0 };
        loop {
            if let Some(minute) = self.minutes.first_from(from_minute) {
                return NaiveTime::from_hms_opt(candidate, minute, 0);
            }
            candidate = self.hours.first_from(candidate + 1)?;
            from_minute = 0;
        }
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

/// Where the local UTC offset comes from.
#[derive(Debug, Clone, Copy, Default)]
pub enum OffsetSource {
    /// The system time zone, looked up for each instant.
    #[default]
    Local,

    /// A fixed offset.
    Fixed(FixedOffset),

    /// An offset computed from the instant, for zones with custom
    /// transition rules.
    Rule(fn(DateTime<Utc>) -> FixedOffset),
}

impl OffsetSource {
    /// Offset in effect at `instant`.
    pub fn offset_at(&self, instant: DateTime<Utc>) -> FixedOffset {
        match self {
            Self::Local => Local.offset_from_utc_datetime(&instant.naive_utc()),
            Self::Fixed(offset) => *offset,
            Self::Rule(rule) => rule(instant),
        }
    }
}

/// A point in time at which the schedule fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occurrence {
    /// The occurrence as an absolute instant.
    pub utc: DateTime<Utc>,

    /// The local wall-clock minute the expression matched.
    pub local: NaiveDateTime,
}

/// Evaluates a cron schedule against the clock.
#[derive(Debug, Clone)]
pub struct ScheduleEvaluator {
    schedule: CronSchedule,
    offsets: OffsetSource,
}

impl ScheduleEvaluator {
    /// Create an evaluator for an already parsed schedule.
    pub fn new(schedule: CronSchedule, offsets: OffsetSource) -> Self {
        Self { schedule, offsets }
    }

    /// Parse `expression` and evaluate it in the system time zone.
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        Ok(Self::new(CronSchedule::parse(expression)?, OffsetSource::Local))
    }

    /// Use a different offset source.
    pub fn with_offsets(mut self, offsets: OffsetSource) -> Self {
        self.offsets = offsets;
        self
    }

    /// Next occurrence at or after `now`.
    pub fn next_occurrence(&self, now: DateTime<Utc>) -> Result<Occurrence, ScheduleError> {
        let offset = offset_delta(self.offsets.offset_at(now));
        let local = self
            .schedule
            .next_from(now.naive_utc() + offset)
            .ok_or_else(|| ScheduleError::NoOccurrence(self.schedule.to_string()))?;

        Ok(Occurrence {
            utc: (local - offset).and_utc(),
            local,
        })
    }

    /// Whether `candidate` continues a run of occurrences spaced no more
    /// than [`GRANULARITY`] apart. An occurrence with no predecessor inside
    /// [`LOOKBACK`] is isolated.
    pub fn is_continuous(&self, candidate: &Occurrence) -> bool {
        self.schedule
            .previous_before(candidate.local, LOOKBACK)
            .is_some_and(|previous| candidate.local - previous <= GRANULARITY)
    }

    /// First and last local occurrence on `date`.
    pub fn day_window(&self, date: NaiveDate) -> Option<(NaiveDateTime, NaiveDateTime)> {
        self.schedule.day_window(date)
    }
}

fn offset_delta(offset: FixedOffset) -> TimeDelta {
    TimeDelta::seconds(i64::from(offset.local_minus_utc()))
}
