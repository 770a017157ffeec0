//! RRULE evaluation via the `rrule` crate. Stored expressions may or may not
//! carry their own DTSTART line; when they do not, one is stamped from the
//! task's creation instant rendered in the task timezone.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use rrule::RRuleSet;

use crate::schedule::ScheduleError;

/// Next occurrence strictly after `after`, or `None` when the rule is
/// exhausted.
pub fn next_rrule_occurrence(
    expr: &str,
    timezone: &str,
    dtstart_fallback: DateTime<Utc>,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let source = normalize_rrule_source(expr, timezone, dtstart_fallback)?;
    let set: RRuleSet = source
        .parse()
        .map_err(|e| ScheduleError::InvalidRrule(format!("{expr:?}: {e}")))?;

    // Occurrences are second-granular; one second past `after` makes the
    // bound strictly exclusive regardless of the library's own inclusivity.
    let bound = (after + Duration::seconds(1)).with_timezone(&rrule::Tz::UTC);
    let result = set.after(bound).all(1);
    Ok(result
        .dates
        .first()
        .map(|occurrence| occurrence.with_timezone(&Utc)))
}

fn normalize_rrule_source(
    expr: &str,
    timezone: &str,
    dtstart_fallback: DateTime<Utc>,
) -> Result<String, ScheduleError> {
    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return Err(ScheduleError::InvalidRrule("empty rrule".into()));
    }
    if trimmed.contains("DTSTART") {
        return Ok(trimmed.replace("\\n", "\n"));
    }
    let tz =
        Tz::from_str(timezone).map_err(|_| ScheduleError::UnknownTimezone(timezone.to_string()))?;
    let dtstart = dtstart_fallback
        .with_timezone(&tz)
        .format("%Y%m%dT%H%M%S")
        .to_string();
    let rule_line = if trimmed.starts_with("RRULE:") {
        trimmed.to_string()
    } else {
        format!("RRULE:{trimmed}")
    };
    Ok(format!("DTSTART;TZID={timezone}:{dtstart}\n{rule_line}"))
}
