//! Five-field cron evaluation in an arbitrary IANA timezone.
//!
//! Fields: minute hour day-of-month month day-of-week. Ranges `a-b`, lists
//! `a,b,c`, steps `*/n` and `a-b/n`; day-of-week accepts 0-7 with 7 folded
//! onto Sunday. Day-of-month vs day-of-week follows the classic rule: both
//! wildcards AND, otherwise the union. Matching decomposes successive UTC
//! instants in the target timezone, so DST gaps and overlaps never produce
//! ambiguous local times.

use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CronError {
    #[error("invalid cron expression {expr:?}: {reason}")]
    Invalid { expr: String, reason: String },

    #[error("unknown timezone {0:?}")]
    UnknownTimezone(String),

    #[error("no cron occurrence within 366 days after {0}")]
    SearchExhausted(DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minutes: u64,
    hours: u32,
    days_of_month: u32,
    months: u16,
    days_of_week: u8,
    dom_is_wildcard: bool,
    dow_is_wildcard: bool,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::Invalid {
                expr: expr.to_string(),
                reason: format!("expected 5 fields, got {}", fields.len()),
            });
        }
        let invalid = |reason: String| CronError::Invalid {
            expr: expr.to_string(),
            reason,
        };

        let (minutes, _) = parse_field(fields[0], 0, 59).map_err(&invalid)?;
        let (hours, _) = parse_field(fields[1], 0, 23).map_err(&invalid)?;
        let (dom, dom_is_wildcard) = parse_field(fields[2], 1, 31).map_err(&invalid)?;
        let (months, _) = parse_field(fields[3], 1, 12).map_err(&invalid)?;
        let (dow_raw, dow_is_wildcard) = parse_field(fields[4], 0, 7).map_err(&invalid)?;

        // 7 is an alias for Sunday.
        let mut dow = (dow_raw & 0x7F) as u8;
        if dow_raw & (1 << 7) != 0 {
            dow |= 1;
        }

        Ok(Self {
            minutes,
            hours: hours as u32,
            days_of_month: dom as u32,
            months: months as u16,
            days_of_week: dow,
            dom_is_wildcard,
            dow_is_wildcard,
        })
    }

    fn minute_matches(&self, minute: u32) -> bool {
        self.minutes & (1 << minute) != 0
    }

    fn hour_matches(&self, hour: u32) -> bool {
        self.hours & (1 << hour) != 0
    }

    fn day_matches(&self, month: u32, day: u32, weekday_from_sunday: u32) -> bool {
        if self.months & (1 << month) == 0 {
            return false;
        }
        let dom_ok = self.days_of_month & (1 << day) != 0;
        let dow_ok = self.days_of_week & (1 << weekday_from_sunday) != 0;
        match (self.dom_is_wildcard, self.dow_is_wildcard) {
            (true, true) => true,
            (true, false) => dow_ok,
            (false, true) => dom_ok,
            // Both restricted: the classic union rule.
            (false, false) => dom_ok || dow_ok,
        }
    }
}

/// Returns a bitmask over `[min, max]` plus whether the field was a bare `*`.
fn parse_field(field: &str, min: u32, max: u32) -> Result<(u64, bool), String> {
    if field == "*" {
        return Ok((range_mask(min, max, 1), true));
    }
    let mut mask: u64 = 0;
    for part in field.split(',') {
        if part.is_empty() {
            return Err(format!("empty list entry in {field:?}"));
        }
        let (range_part, step) = match part.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s
                    .parse()
                    .map_err(|_| format!("bad step {s:?} in {field:?}"))?;
                if step == 0 {
                    return Err(format!("zero step in {field:?}"));
                }
                (r, step)
            }
            None => (part, 1),
        };
        let (lo, hi) = if range_part == "*" {
            (min, max)
        } else if let Some((a, b)) = range_part.split_once('-') {
            let lo: u32 = a
                .parse()
                .map_err(|_| format!("bad number {a:?} in {field:?}"))?;
            let hi: u32 = b
                .parse()
                .map_err(|_| format!("bad number {b:?} in {field:?}"))?;
            (lo, hi)
        } else {
            let v: u32 = range_part
                .parse()
                .map_err(|_| format!("bad number {range_part:?} in {field:?}"))?;
            // A bare value with a step ranges to the top, vixie style.
            if step > 1 {
                (v, max)
            } else {
                (v, v)
            }
        };
        if lo < min || hi > max || lo > hi {
            return Err(format!("{lo}-{hi} out of range {min}-{max} in {field:?}"));
        }
        mask |= range_mask(lo, hi, step);
    }
    Ok((mask, false))
}

fn range_mask(lo: u32, hi: u32, step: u32) -> u64 {
    let mut mask = 0u64;
    let mut v = lo;
    while v <= hi {
        mask |= 1 << v;
        v += step;
    }
    mask
}

/// Next instant strictly after `after` matching the expression in `timezone`.
/// Bounded at 366 days; exhausting the bound is a hard error.
pub fn next_cron_occurrence(
    expr: &str,
    timezone: &str,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>, CronError> {
    let parsed = CronExpr::parse(expr)?;
    let tz = Tz::from_str(timezone).map_err(|_| CronError::UnknownTimezone(timezone.to_string()))?;

    let mut candidate = truncate_to_minute(after) + Duration::minutes(1);
    let bound = after + Duration::days(366);

    while candidate <= bound {
        let local = candidate.with_timezone(&tz);
        let weekday = local.weekday().num_days_from_sunday();
        if !parsed.day_matches(local.month(), local.day(), weekday) {
            // Jump toward the next local midnight, stopping two hours short
            // so a 23-hour DST day can never be skipped past.
            let elapsed = local.hour() * 60 + local.minute();
            let jump = (1440i64 - elapsed as i64 - 120).max(1);
            candidate += Duration::minutes(jump);
            continue;
        }
        if !parsed.hour_matches(local.hour()) {
            candidate += Duration::minutes((60 - local.minute()) as i64);
            continue;
        }
        if !parsed.minute_matches(local.minute()) {
            candidate += Duration::minutes(1);
            continue;
        }
        return Ok(candidate);
    }
    Err(CronError::SearchExhausted(after))
}

fn truncate_to_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(
        ts.year(),
        ts.month(),
        ts.day(),
        ts.hour(),
        ts.minute(),
        0,
    )
    .single()
    .unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn midnight_daily_in_utc() {
        let next =
            next_cron_occurrence("0 0 * * *", "UTC", utc(2026, 2, 15, 17, 0, 0)).unwrap();
        assert_eq!(next, utc(2026, 2, 16, 0, 0, 0));
    }

    #[test]
    fn quarter_hours_align_locally_across_dst() {
        // 2026-03-08 02:00 PST does not exist; clocks jump to 03:00 PDT.
        // 01:50 PST is 09:50Z; the next local quarter-hour is 03:00 PDT,
        // which is 10:00Z.
        let next = next_cron_occurrence(
            "*/15 * * * *",
            "America/Los_Angeles",
            utc(2026, 3, 8, 9, 50, 0),
        )
        .unwrap();
        assert_eq!(next, utc(2026, 3, 8, 10, 0, 0));

        // Well before the transition the quarters are plain.
        let next = next_cron_occurrence(
            "*/15 * * * *",
            "America/Los_Angeles",
            utc(2026, 3, 8, 9, 1, 0),
        )
        .unwrap();
        assert_eq!(next, utc(2026, 3, 8, 9, 15, 0));
    }

    #[test]
    fn weekday_mornings_in_local_time() {
        // 09:00 Mon-Fri in Los Angeles. Friday 2026-03-06 09:00 PST = 17:00Z.
        let next = next_cron_occurrence(
            "0 9 * * 1-5",
            "America/Los_Angeles",
            utc(2026, 3, 6, 17, 0, 0),
        )
        .unwrap();
        // Next is Monday 2026-03-09, already PDT: 09:00 local = 16:00Z.
        assert_eq!(next, utc(2026, 3, 9, 16, 0, 0));
    }

    #[test]
    fn dom_dow_union_when_both_restricted() {
        // 13th of the month OR Friday. From Wed 2026-03-11: Friday the 13th
        // happens to satisfy both, but Thursday the 12th satisfies neither
        // and Friday 2026-03-13 must win over waiting for the next 13th.
        let next =
            next_cron_occurrence("0 12 13 * 5", "UTC", utc(2026, 3, 11, 0, 0, 0)).unwrap();
        assert_eq!(next, utc(2026, 3, 13, 12, 0, 0));

        // From the 13th at noon, the next hit is Friday the 20th, not
        // April 13th: the union rule.
        let next =
            next_cron_occurrence("0 12 13 * 5", "UTC", utc(2026, 3, 13, 12, 0, 0)).unwrap();
        assert_eq!(next, utc(2026, 3, 20, 12, 0, 0));
    }

    #[test]
    fn seven_is_sunday() {
        let a = next_cron_occurrence("0 8 * * 0", "UTC", utc(2026, 3, 11, 0, 0, 0)).unwrap();
        let b = next_cron_occurrence("0 8 * * 7", "UTC", utc(2026, 3, 11, 0, 0, 0)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, utc(2026, 3, 15, 8, 0, 0));
    }

    #[test]
    fn lists_ranges_and_steps() {
        let next = next_cron_occurrence("5,35 9-17/4 * * *", "UTC", utc(2026, 1, 1, 9, 6, 0))
            .unwrap();
        assert_eq!(next, utc(2026, 1, 1, 9, 35, 0));
        let next = next_cron_occurrence("5,35 9-17/4 * * *", "UTC", utc(2026, 1, 1, 9, 36, 0))
            .unwrap();
        assert_eq!(next, utc(2026, 1, 1, 13, 5, 0));
    }

    #[test]
    fn impossible_date_exhausts_search() {
        let err = next_cron_occurrence("0 0 30 2 *", "UTC", utc(2026, 1, 1, 0, 0, 0)).unwrap_err();
        assert!(matches!(err, CronError::SearchExhausted(_)));
    }

    #[test]
    fn rejects_malformed_expressions() {
        for bad in [
            "* * * *",
            "60 * * * *",
            "* 24 * * *",
            "* * 0 * *",
            "* * * 13 *",
            "* * * * 8",
            "*/0 * * * *",
            "5-2 * * * *",
            "a * * * *",
        ] {
            assert!(
                CronExpr::parse(bad).is_err(),
                "expected {bad:?} to be rejected"
            );
        }
    }

    #[test]
    fn rejects_unknown_timezone() {
        let err =
            next_cron_occurrence("0 0 * * *", "Mars/Olympus", utc(2026, 1, 1, 0, 0, 0)).unwrap_err();
        assert!(matches!(err, CronError::UnknownTimezone(_)));
    }
}
