//! Schedule validation and next-occurrence computation shared by the task
//! engine and the HTTP task surface.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use thiserror::Error;

use jagc_types::{ScheduleKind, ScheduledTask};

use crate::cron::{next_cron_occurrence, CronError, CronExpr};
use crate::rrule_eval::next_rrule_occurrence;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Cron(#[from] CronError),

    #[error("invalid rrule: {0}")]
    InvalidRrule(String),

    #[error("unknown timezone {0:?}")]
    UnknownTimezone(String),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
}

/// Exactly one schedule payload, matching `schedule_kind`.
#[derive(Debug, Clone)]
pub enum ScheduleSpec {
    Once { at: DateTime<Utc> },
    Cron { expr: String },
    Rrule { expr: String },
}

impl ScheduleSpec {
    pub fn kind(&self) -> ScheduleKind {
        match self {
            ScheduleSpec::Once { .. } => ScheduleKind::Once,
            ScheduleSpec::Cron { .. } => ScheduleKind::Cron,
            ScheduleSpec::Rrule { .. } => ScheduleKind::Rrule,
        }
    }

    /// Validate the payload against its timezone and compute the first
    /// occurrence strictly after `now`.
    pub fn first_occurrence_after(
        &self,
        timezone: &str,
        dtstart_fallback: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        validate_timezone(timezone)?;
        match self {
            ScheduleSpec::Once { at } => {
                if *at <= now {
                    return Err(ScheduleError::InvalidSchedule(format!(
                        "one-shot time {at} is in the past"
                    )));
                }
                Ok(Some(*at))
            }
            ScheduleSpec::Cron { expr } => {
                CronExpr::parse(expr)?;
                Ok(Some(next_cron_occurrence(expr, timezone, now)?))
            }
            ScheduleSpec::Rrule { expr } => {
                next_rrule_occurrence(expr, timezone, dtstart_fallback, now)
            }
        }
    }
}

pub fn validate_timezone(timezone: &str) -> Result<Tz, ScheduleError> {
    Tz::from_str(timezone).map_err(|_| ScheduleError::UnknownTimezone(timezone.to_string()))
}

/// The occurrence after `occurrence` for an existing task, plus whether the
/// task stays enabled. One-shots disable themselves after materializing.
pub fn compute_next_occurrence(
    task: &ScheduledTask,
    occurrence: DateTime<Utc>,
) -> Result<(bool, Option<DateTime<Utc>>), ScheduleError> {
    match task.schedule_kind {
        ScheduleKind::Once => Ok((false, None)),
        ScheduleKind::Cron => {
            let expr = task.cron_expr.as_deref().ok_or_else(|| {
                ScheduleError::InvalidSchedule("cron task without cron_expr".into())
            })?;
            let next = next_cron_occurrence(expr, &task.timezone, occurrence)?;
            Ok((true, Some(next)))
        }
        ScheduleKind::Rrule => {
            let expr = task.rrule_expr.as_deref().ok_or_else(|| {
                ScheduleError::InvalidSchedule("rrule task without rrule_expr".into())
            })?;
            let next = next_rrule_occurrence(expr, &task.timezone, task.created_at, occurrence)?;
            Ok((next.is_some(), next))
        }
    }
}
