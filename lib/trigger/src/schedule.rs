//! Schedule configuration and the schedule planner.
//!
//! The planner is a pure function of a [`ScheduleConfig`] and "now". It has
//! no notion of timers or persistence; the job scheduler decides what to do
//! with the instant it returns.

use crate::error::ValidationError;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unit for interval-based schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    Minutes,
    Hours,
    Days,
}

impl IntervalUnit {
    /// Smallest accepted interval value for this unit.
    #[must_use]
    pub const fn minimum(self) -> u32 {
        match self {
            Self::Minutes => 5,
            Self::Hours | Self::Days => 1,
        }
    }

    /// Largest accepted interval value for this unit: ten years.
    #[must_use]
    pub const fn maximum(self) -> u32 {
        match self {
            Self::Minutes => 5_256_000,
            Self::Hours => 87_600,
            Self::Days => 3_650,
        }
    }

    /// Length of `value` units.
    #[must_use]
    pub fn duration(self, value: u32) -> Duration {
        let value = i64::from(value);
        match self {
            Self::Minutes => Duration::minutes(value),
            Self::Hours => Duration::hours(value),
            Self::Days => Duration::days(value),
        }
    }

    /// Stable string form, used for storage and display.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Minutes => "minutes",
            Self::Hours => "hours",
            Self::Days => "days",
        }
    }
}

impl fmt::Display for IntervalUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When a scheduled trigger fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "schedule_type", rename_all = "snake_case")]
pub enum ScheduleConfig {
    /// Fire once at an exact instant.
    OneTimeAt { at: DateTime<Utc> },
    /// Fire once, `value` units after the schedule was set.
    OneTimeAfterInterval { unit: IntervalUnit, value: u32 },
    /// Fire every day at `hour:minute` UTC.
    RecurringAtTimeOfDay { hour: u32, minute: u32 },
    /// Fire every `value` units.
    RecurringInterval { unit: IntervalUnit, value: u32 },
}

impl ScheduleConfig {
    /// Whether this schedule retires after its first fire.
    #[must_use]
    pub fn is_one_time(&self) -> bool {
        matches!(
            self,
            Self::OneTimeAt { .. } | Self::OneTimeAfterInterval { .. }
        )
    }

    /// Validates the schedule as of `now`.
    ///
    /// # Errors
    ///
    /// Returns the first rule the schedule violates.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), ValidationError> {
        match *self {
            Self::OneTimeAt { at } if at <= now => Err(ValidationError::NotInFuture { at }),
            Self::OneTimeAt { .. } => Ok(()),
            Self::OneTimeAfterInterval { unit, value } | Self::RecurringInterval { unit, value } => {
                if value < unit.minimum() {
                    Err(ValidationError::IntervalTooShort {
                        unit,
                        value,
                        minimum: unit.minimum(),
                    })
                } else if value > unit.maximum() {
                    Err(ValidationError::IntervalTooLong {
                        unit,
                        value,
                        maximum: unit.maximum(),
                    })
                } else {
                    Ok(())
                }
            }
            Self::RecurringAtTimeOfDay { hour, minute } => {
                if hour > 23 || minute > 59 {
                    Err(ValidationError::InvalidTimeOfDay { hour, minute })
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Forces the schedule into a single fire, keeping its first due time.
    ///
    /// Used when a definition is tested rather than registered.
    #[must_use]
    pub fn as_one_time(&self, now: DateTime<Utc>) -> Self {
        match self {
            Self::RecurringInterval { unit, value } => Self::OneTimeAfterInterval {
                unit: *unit,
                value: *value,
            },
            Self::RecurringAtTimeOfDay { .. } => match next_fire(self, now) {
                Some(at) => Self::OneTimeAt { at },
                None => self.clone(),
            },
            one_time => one_time.clone(),
        }
    }
}

/// Computes the next fire time strictly after `now`.
///
/// Returns `None` for a one-time instant that has already elapsed; the
/// scheduler applies its grace policy to that case. Also `None` when the
/// next fire falls outside the representable date range.
#[must_use]
pub fn next_fire(config: &ScheduleConfig, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match *config {
        ScheduleConfig::OneTimeAt { at } => (at > now).then_some(at),
        ScheduleConfig::OneTimeAfterInterval { unit, value }
        | ScheduleConfig::RecurringInterval { unit, value } => {
            now.checked_add_signed(unit.duration(value))
        }
        ScheduleConfig::RecurringAtTimeOfDay { hour, minute } => {
            let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
            let today = now.date_naive().and_time(time).and_utc();
            if today > now {
                Some(today)
            } else {
                today.checked_add_signed(Duration::days(1))
            }
        }
    }
}
