//! Recurring delivery patterns
//!
//! A pattern is stored as `{type, interval, day?, month?, startDate?}`.
//! `day` is a day-of-week (0 = Sunday) for weekly patterns and a
//! day-of-month (1-31) for monthly and yearly ones; `month` is 0-11 and only
//! meaningful for yearly patterns. Occurrences keep the time of day of the
//! anchor they are computed from, and a day-of-month past the end of a short
//! month is clamped to its last day.

use crate::error::ValidationError;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Upper bound on calendar steps examined while searching for an occurrence
const MAX_CALENDAR_STEPS: i64 = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatKind {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl RepeatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepeatKind::Daily => "daily",
            RepeatKind::Weekly => "weekly",
            RepeatKind::Monthly => "monthly",
            RepeatKind::Yearly => "yearly",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurringPattern {
    #[serde(rename = "type")]
    pub kind: RepeatKind,
    pub interval: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub month: Option<u32>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "start_date_format"
    )]
    pub start_date: Option<NaiveDate>,
}

impl Default for RecurringPattern {
    fn default() -> Self {
        Self {
            kind: RepeatKind::Daily,
            interval: 1,
            day: None,
            month: None,
            start_date: None,
        }
    }
}

impl RecurringPattern {
    /// Pattern to use when a condition is switched into (or forced into)
    /// recurring mode. An existing pattern is kept as is; otherwise a daily
    /// pattern with interval 1 is created.
    pub fn resolve(existing: Option<Self>, enabled: bool, force_enabled: bool) -> Option<Self> {
        if enabled || force_enabled {
            Some(existing.unwrap_or_default())
        } else {
            None
        }
    }

    /// Switch the repeat type, keeping `day` / `month` only where they still
    /// mean something for the new type.
    pub fn with_kind(self, kind: RepeatKind) -> Self {
        let (day, month) = match kind {
            RepeatKind::Daily => (None, None),
            RepeatKind::Weekly => (self.day.filter(|d| *d <= 6), None),
            RepeatKind::Monthly => (self.day.filter(|d| (1..=31).contains(d)), None),
            RepeatKind::Yearly => (
                self.day.filter(|d| (1..=31).contains(d)),
                self.month.filter(|m| *m <= 11),
            ),
        };

        Self {
            kind,
            day,
            month,
            ..self
        }
    }

    pub fn with_interval(self, interval: u32) -> Result<Self, ValidationError> {
        let next = Self { interval, ..self };
        next.validate()?;
        Ok(next)
    }

    pub fn with_day(self, day: Option<u32>) -> Result<Self, ValidationError> {
        let next = Self { day, ..self };
        next.validate()?;
        Ok(next)
    }

    pub fn with_month(self, month: Option<u32>) -> Result<Self, ValidationError> {
        let next = Self { month, ..self };
        next.validate()?;
        Ok(next)
    }

    pub fn with_start_date(self, start_date: Option<NaiveDate>) -> Self {
        Self { start_date, ..self }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.interval < 1 {
            return Err(ValidationError::InvalidInterval);
        }

        if let Some(day) = self.day {
            let in_range = match self.kind {
                RepeatKind::Daily => true,
                RepeatKind::Weekly => day <= 6,
                RepeatKind::Monthly | RepeatKind::Yearly => (1..=31).contains(&day),
            };
            if !in_range {
                return Err(ValidationError::DayOutOfRange {
                    kind: self.kind.as_str(),
                    day,
                });
            }
        }

        if let Some(month) = self.month {
            if month > 11 {
                return Err(ValidationError::MonthOutOfRange(month));
            }
        }

        Ok(())
    }

    /// Earliest instant a recurring delivery may happen, if a start date is set
    pub fn start_floor(&self) -> Option<DateTime<Utc>> {
        self.start_date
            .map(|date| date.and_time(NaiveTime::MIN).and_utc())
    }

    pub fn floor_reached(&self, now: DateTime<Utc>) -> bool {
        self.start_floor().map_or(true, |floor| now >= floor)
    }

    /// First occurrence strictly after `after`.
    ///
    /// Occurrences are laid out from `anchor` (moved forward to the start
    /// date when one is set) and never precede it.
    pub fn next_occurrence(
        &self,
        after: DateTime<Utc>,
        anchor: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let interval = i64::from(self.interval.max(1));
        let time = anchor.time();

        let base = match self.start_date {
            Some(start) if start > anchor.date_naive() => start.and_time(time).and_utc(),
            _ => anchor,
        };

        match self.kind {
            RepeatKind::Daily => periodic(base, Duration::try_days(interval)?, after),
            RepeatKind::Weekly => {
                let current = base.weekday().num_days_from_sunday();
                let target = self.day.unwrap_or(current) % 7;
                let delta = (target + 7 - current) % 7;
                let first = base.checked_add_signed(Duration::days(i64::from(delta)))?;
                periodic(first, Duration::try_days(7 * interval)?, after)
            }
            RepeatKind::Monthly => {
                let dom = self.day.unwrap_or_else(|| base.day());
                let origin = month_index(base);
                let target = month_index(after);
                calendar_search(base, after, (target - origin) / interval, |k| {
                    let index = origin + k * interval;
                    make_date(index.div_euclid(12), index.rem_euclid(12), dom, time)
                })
            }
            RepeatKind::Yearly => {
                let month0 = self.month.map(i64::from).unwrap_or_else(|| i64::from(base.month0()));
                let dom = self.day.unwrap_or_else(|| base.day());
                let origin = i64::from(base.year());
                let target = i64::from(after.year());
                calendar_search(base, after, (target - origin) / interval, |k| {
                    make_date(origin + k * interval, month0, dom, time)
                })
            }
        }
    }
}

/// `None` once the next step would leave the representable calendar
fn periodic(first: DateTime<Utc>, step: Duration, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if first > after {
        return Some(first);
    }
    let step_secs = step.num_seconds().max(1);
    let elapsed = (after - first).num_seconds();
    let steps = elapsed / step_secs + 1;
    let offset = step_secs.checked_mul(steps).and_then(Duration::try_seconds)?;
    first.checked_add_signed(offset)
}

fn calendar_search<F>(
    base: DateTime<Utc>,
    after: DateTime<Utc>,
    estimate: i64,
    occurrence: F,
) -> Option<DateTime<Utc>>
where
    F: Fn(i64) -> Option<DateTime<Utc>>,
{
    // Start one step early so clamping and time-of-day cannot skip a candidate.
    let start = (estimate - 1).max(0);
    (start..start + MAX_CALENDAR_STEPS)
        .filter_map(&occurrence)
        .find(|occ| *occ > after && *occ >= base)
}

fn month_index(at: DateTime<Utc>) -> i64 {
    i64::from(at.year()) * 12 + i64::from(at.month0())
}

fn make_date(year: i64, month0: i64, dom: u32, time: NaiveTime) -> Option<DateTime<Utc>> {
    let year = i32::try_from(year).ok()?;
    let month = u32::try_from(month0).ok()? + 1;
    NaiveDate::from_ymd_opt(year, month, 1)?;
    let day = dom.clamp(1, days_in_month(year, month));
    NaiveDate::from_ymd_opt(year, month, day).map(|date| date.and_time(time).and_utc())
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

/// `startDate` is written by the editor either as `YYYY-MM-DD` or as a full
/// ISO timestamp; only the date part is significant.
mod start_date_format {
    use chrono::NaiveDate;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<NaiveDate>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(date) => serializer.serialize_str(&date.format("%Y-%m-%d").to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            None => Ok(None),
            Some(s) if s.trim().is_empty() => Ok(None),
            Some(s) => {
                let date_part = s.get(..10).unwrap_or(&s);
                NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
                    .map(Some)
                    .map_err(serde::de::Error::custom)
            }
        }
    }
}
