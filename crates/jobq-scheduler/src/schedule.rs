use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde_json::Value;

use crate::error::{Result, SchedulerError};

/// A parsed cron expression bound to the timezone it is evaluated in.
#[derive(Debug, Clone)]
pub struct CronSpec {
    /// More than one only when day-of-month and day-of-week are both
    /// restricted; a time matching either schedule is due.
    schedules: Vec<cron::Schedule>,
    tz: Tz,
}

impl CronSpec {
    /// Parse `expr` and `timezone`.
    ///
    /// Five-field expressions (`min hour dom month dow`, Sunday = 0 or 7)
    /// follow standard cron: when both day fields are restricted a day
    /// matching either one is due. Six or seven fields are passed to the
    /// `cron` crate unchanged, which requires both day fields to match.
    pub fn parse(expr: &str, timezone: &str) -> Result<Self> {
        let tz = Tz::from_str(timezone.trim())
            .map_err(|_| SchedulerError::InvalidTimezone(timezone.to_string()))?;
        let schedules = normalize(expr)?
            .iter()
            .map(|normalized| {
                cron::Schedule::from_str(normalized).map_err(|e| {
                    SchedulerError::InvalidSchedule(format!("invalid cron expression '{expr}': {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { schedules, tz })
    }

    /// First occurrence strictly after `after`, in UTC.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&self.tz);
        self.schedules
            .iter()
            .filter_map(|s| s.after(&local).next())
            .min()
            .map(|at| at.with_timezone(&Utc))
    }
}

/// Turn a standard five-field expression into the `cron` crate's
/// seconds-first form. Restricting both day fields yields one expression
/// per field.
fn normalize(expr: &str) -> Result<Vec<String>> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    match fields.len() {
        5 => {
            let dow = translate_dow(fields[4]).map_err(|e| {
                SchedulerError::InvalidSchedule(format!("invalid cron expression '{expr}': {e}"))
            })?;
            let (min, hour, dom, month) = (fields[0], fields[1], fields[2], fields[3]);
            let restricted = |f: &str| !f.starts_with('*') && f != "?";
            if restricted(dom) && restricted(dow.as_str()) {
                Ok(vec![
                    format!("0 {min} {hour} {dom} {month} *"),
                    format!("0 {min} {hour} * {month} {dow}"),
                ])
            } else {
                Ok(vec![format!("0 {min} {hour} {dom} {month} {dow}")])
            }
        }
        6 | 7 => Ok(vec![fields.join(" ")]),
        n => Err(SchedulerError::InvalidSchedule(format!(
            "cron expression '{expr}' has {n} fields, expected 5"
        ))),
    }
}

/// Standard cron counts weekdays 0-6 from Sunday (7 is Sunday too); the
/// `cron` crate counts 1-7 from Sunday. Numeric ranges and steps are
/// expanded to a list so a range ending on Sunday keeps it.
fn translate_dow(field: &str) -> std::result::Result<String, String> {
    let day = |s: &str| -> std::result::Result<Option<u8>, String> {
        match s.parse::<u8>() {
            Ok(n @ 0..=7) => Ok(Some(n)),
            Ok(n) => Err(format!("day of week {n} out of range")),
            // Names and wildcards mean the same thing in both dialects.
            Err(_) => Ok(None),
        }
    };
    let shift = |n: u8| n % 7 + 1;

    let mut days: Vec<String> = Vec::new();
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => match s.parse::<usize>() {
                Ok(n) if n > 0 => (r, Some(n)),
                _ => return Err(format!("invalid step '{s}'")),
            },
            None => (part, None),
        };
        let bounds = match range.split_once('-') {
            Some((a, b)) => match (day(a)?, day(b)?) {
                (Some(a), Some(b)) => Some((a, b)),
                (None, None) => None,
                _ => return Err(format!("range '{range}' mixes names and numbers")),
            },
            // `n/step` runs to the end of the week.
            None => day(range)?.map(|a| if step.is_some() { (a, a.max(6)) } else { (a, a) }),
        };
        let expanded: Vec<String> = match bounds {
            Some((a, b)) if a > b => return Err(format!("range '{range}' is reversed")),
            Some((a, b)) => (a..=b).step_by(step.unwrap_or(1)).map(|n| shift(n).to_string()).collect(),
            None => vec![part.to_string()],
        };
        for d in expanded {
            if !days.contains(&d) {
                days.push(d);
            }
        }
    }
    Ok(days.join(","))
}

/// Values substituted into a definition's payload template for each run.
#[derive(Debug, Clone)]
pub struct TickContext<'a> {
    pub schedule_id: &'a str,
    pub schedule_name: &'a str,
    pub scheduled_at: DateTime<Utc>,
    pub run: u64,
}

/// Copy `template`, replacing `{{schedule_id}}`, `{{schedule_name}}`,
/// `{{scheduled_at}}` and `{{run}}` inside every string value.
pub fn materialize(template: &Value, ctx: &TickContext<'_>) -> Value {
    match template {
        Value::String(s) if s.contains("{{") => Value::String(
            s.replace("{{schedule_id}}", ctx.schedule_id)
                .replace("{{schedule_name}}", ctx.schedule_name)
                .replace("{{scheduled_at}}", &ctx.scheduled_at.to_rfc3339())
                .replace("{{run}}", &ctx.run.to_string()),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| materialize(v, ctx)).collect()),
        Value::Object(map) => {
            Value::Object(map.iter().map(|(k, v)| (k.clone(), materialize(v, ctx))).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn every_five_minutes() {
        let spec = CronSpec::parse("*/5 * * * *", "UTC").unwrap();
        let from = utc(2026, 1, 1, 0, 2);
        assert_eq!(spec.next_after(from), Some(utc(2026, 1, 1, 0, 5)));
        // Strictly after: an exact match is not returned again.
        assert_eq!(spec.next_after(utc(2026, 1, 1, 0, 5)), Some(utc(2026, 1, 1, 0, 10)));
    }

    #[test]
    fn weekday_uses_standard_numbering() {
        // 2026-01-01 is a Thursday; "1" is Monday.
        let spec = CronSpec::parse("0 9 * * 1", "UTC").unwrap();
        assert_eq!(spec.next_after(utc(2026, 1, 1, 0, 0)), Some(utc(2026, 1, 5, 9, 0)));

        let sunday = CronSpec::parse("0 0 * * 0", "UTC").unwrap();
        assert_eq!(sunday.next_after(utc(2026, 1, 1, 0, 0)), Some(utc(2026, 1, 4, 0, 0)));
        let sunday7 = CronSpec::parse("0 0 * * 7", "UTC").unwrap();
        assert_eq!(sunday7.next_after(utc(2026, 1, 1, 0, 0)), Some(utc(2026, 1, 4, 0, 0)));
    }

    #[test]
    fn dow_translation() {
        assert_eq!(translate_dow("*").unwrap(), "*");
        assert_eq!(translate_dow("*/2").unwrap(), "*/2");
        assert_eq!(translate_dow("1-5").unwrap(), "2,3,4,5,6");
        assert_eq!(translate_dow("0,6").unwrap(), "1,7");
        assert_eq!(translate_dow("0,7").unwrap(), "1");
        assert_eq!(translate_dow("5-7").unwrap(), "6,7,1");
        assert_eq!(translate_dow("5-7/2").unwrap(), "6,1");
        assert_eq!(translate_dow("0-6/3").unwrap(), "1,4,7");
        assert_eq!(translate_dow("4/2").unwrap(), "5,7");
        assert_eq!(translate_dow("MON").unwrap(), "MON");
        assert_eq!(translate_dow("MON-FRI").unwrap(), "MON-FRI");
        assert!(translate_dow("9").is_err());
        assert!(translate_dow("6-2").is_err());
        assert!(translate_dow("MON-5").is_err());
        assert!(translate_dow("1-5/0").is_err());
    }

    #[test]
    fn stepped_range_keeps_sunday() {
        // Friday and Sunday; 2026-01-01 is a Thursday.
        let spec = CronSpec::parse("0 0 * * 5-7/2", "UTC").unwrap();
        let fri = spec.next_after(utc(2026, 1, 1, 0, 0)).unwrap();
        assert_eq!(fri, utc(2026, 1, 2, 0, 0));
        assert_eq!(spec.next_after(fri), Some(utc(2026, 1, 4, 0, 0)));
    }

    #[test]
    fn restricted_day_fields_match_either() {
        // The 15th or any Monday.
        let spec = CronSpec::parse("0 12 15 * 1", "UTC").unwrap();
        let first = spec.next_after(utc(2026, 1, 1, 0, 0)).unwrap();
        assert_eq!(first, utc(2026, 1, 5, 12, 0));
        assert_eq!(spec.next_after(utc(2026, 1, 13, 0, 0)), Some(utc(2026, 1, 15, 12, 0)));

        // A wildcard day-of-week leaves day-of-month alone.
        let monthly = CronSpec::parse("0 12 15 * *", "UTC").unwrap();
        assert_eq!(monthly.next_after(utc(2026, 1, 1, 0, 0)), Some(utc(2026, 1, 15, 12, 0)));
        assert_eq!(monthly.next_after(utc(2026, 1, 15, 12, 0)), Some(utc(2026, 2, 15, 12, 0)));
    }

    #[test]
    fn evaluated_in_timezone() {
        // 09:00 in New York during winter (UTC-5) is 14:00 UTC.
        let spec = CronSpec::parse("0 9 * * *", "America/New_York").unwrap();
        assert_eq!(spec.next_after(utc(2026, 1, 10, 0, 0)), Some(utc(2026, 1, 10, 14, 0)));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(
            CronSpec::parse("* * *", "UTC"),
            Err(SchedulerError::InvalidSchedule(_))
        ));
        assert!(matches!(
            CronSpec::parse("*/5 * * * *", "Mars/Olympus"),
            Err(SchedulerError::InvalidTimezone(_))
        ));
        assert!(CronSpec::parse("61 * * * *", "UTC").is_err());
    }

    #[test]
    fn template_placeholders_are_filled() {
        let ctx = TickContext {
            schedule_id: "schedule_1",
            schedule_name: "hourly_sync",
            scheduled_at: utc(2026, 1, 1, 1, 0),
            run: 3,
        };
        let tpl = json!({
            "carrierId": "all",
            "tag": "{{schedule_name}}#{{run}}",
            "at": ["{{scheduled_at}}"],
            "n": 1
        });
        assert_eq!(
            materialize(&tpl, &ctx),
            json!({
                "carrierId": "all",
                "tag": "hourly_sync#3",
                "at": ["2026-01-01T01:00:00+00:00"],
                "n": 1
            })
        );
    }
}
