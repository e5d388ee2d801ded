//! Hour/minute arithmetic for deadlines and reminder offsets

use crate::config::QUARTER_HOUR_MINUTES;
use crate::error::ValidationError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoursMinutes {
    pub hours: u32,
    pub minutes: u32,
}

impl HoursMinutes {
    pub fn new(hours: u32, minutes: u32) -> Self {
        Self { hours, minutes }
    }

    pub fn total_minutes(&self) -> u32 {
        to_minutes(self.hours, self.minutes)
    }
}

/// Split a minute count into whole hours and remaining minutes.
pub fn to_hours_and_minutes(total_minutes: u32) -> HoursMinutes {
    HoursMinutes {
        hours: total_minutes / 60,
        minutes: total_minutes % 60,
    }
}

pub fn to_minutes(hours: u32, minutes: u32) -> u32 {
    hours.saturating_mul(60).saturating_add(minutes)
}

/// Human readable duration, e.g. "1 hour and 30 minutes".
///
/// A zero hour part is omitted; a zero total renders as "0 minutes".
pub fn format_duration(total_minutes: u32) -> String {
    let HoursMinutes { hours, minutes } = to_hours_and_minutes(total_minutes);

    let hour_part = (hours > 0).then(|| plural(hours, "hour"));
    let minute_part = (minutes > 0).then(|| plural(minutes, "minute"));

    match (hour_part, minute_part) {
        (Some(h), Some(m)) => format!("{} and {}", h, m),
        (Some(h), None) => h,
        (None, Some(m)) => m,
        (None, None) => "0 minutes".to_string(),
    }
}

fn plural(n: u32, unit: &str) -> String {
    if n == 1 {
        format!("1 {}", unit)
    } else {
        format!("{} {}s", n, unit)
    }
}

/// Round a minute count to the nearest quarter hour.
///
/// Rounding happens on the total, so 52 minutes becomes 45 and 53 minutes
/// becomes a full hour.
pub fn snap_minutes_to_quarter(total_minutes: u32) -> u32 {
    let step = QUARTER_HOUR_MINUTES;
    let lower = total_minutes / step * step;
    if total_minutes - lower >= step.div_ceil(2) {
        lower.saturating_add(step)
    } else {
        lower
    }
}

/// Snap an hours/minutes pair, carrying a rounded-up 60 into the hour.
pub fn snap_to_quarter_hour(hours: u32, minutes: u32) -> HoursMinutes {
    to_hours_and_minutes(snap_minutes_to_quarter(to_minutes(hours, minutes)))
}

/// Validate a new reminder offset against an existing set and the deadline.
///
/// Returns the offset in minutes on success.
pub fn validate_reminder_offset(
    hours: u32,
    minutes: u32,
    existing: &[u32],
    max_minutes: u32,
) -> Result<u32, ValidationError> {
    if hours == 0 && minutes == 0 {
        return Err(ValidationError::ZeroDuration);
    }

    if minutes % QUARTER_HOUR_MINUTES != 0 {
        return Err(ValidationError::NonQuarterInterval(minutes));
    }

    let total = to_minutes(hours, minutes);
    if total >= max_minutes {
        return Err(ValidationError::ExceedsThreshold {
            offset: total,
            max: max_minutes,
        });
    }

    if existing.contains(&total) {
        return Err(ValidationError::DuplicateReminder(total));
    }

    Ok(total)
}
