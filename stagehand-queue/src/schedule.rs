//! Repeatable job schedules.

use crate::envelope::JobEnvelope;
use crate::error::{QueueError, QueueResult};
use crate::options::EnqueueOptions;
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Parsed cron expression.
///
/// Accepts the classic five-field form (minute through day of week) as well
/// as six or seven fields with leading seconds and trailing year.
#[derive(Debug, Clone)]
pub struct CronExpression {
    schedule: Schedule,
    expression: String,
}

impl CronExpression {
    /// Parse a cron expression.
    ///
    /// # Examples
    ///
    /// ```
    /// use stagehand_queue::CronExpression;
    ///
    /// // Every day at 03:00
    /// let nightly = CronExpression::parse("0 3 * * *").unwrap();
    ///
    /// // Every 30 seconds
    /// let frequent = CronExpression::parse("*/30 * * * * *").unwrap();
    ///
    /// assert!(CronExpression::parse("every tuesday").is_err());
    /// ```
    pub fn parse(expression: &str) -> QueueResult<Self> {
        let invalid = |reason: String| QueueError::InvalidCronPattern(format!("{}: {}", expression, reason));

        let mut fields: Vec<String> = expression.split_whitespace().map(str::to_string).collect();
        if fields.len() == 5 {
            fields.insert(0, "0".to_string());
        }
        if let Some(day_of_week) = fields.get_mut(DAY_OF_WEEK_FIELD) {
            *day_of_week = shift_day_of_week(day_of_week).map_err(invalid)?;
        }

        let schedule = Schedule::from_str(&fields.join(" ")).map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            schedule,
            expression: expression.to_string(),
        })
    }

    /// Get the next execution time after the given time.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Get the next execution time from now.
    pub fn next(&self) -> Option<DateTime<Utc>> {
        self.next_after(Utc::now())
    }

    /// The expression as given.
    pub fn expression(&self) -> &str {
        &self.expression
    }
}

// Position of the day-of-week field once seconds are present.
const DAY_OF_WEEK_FIELD: usize = 5;

/// Rewrite a day-of-week field from cron numbering (Sunday is 0 or 7) to the
/// `cron` crate's numbering (Sunday is 1, Saturday is 7).
///
/// Numeric items are expanded to an explicit day list; names such as `MON-FRI`
/// and the wildcards `*` and `?` pass through unchanged.
fn shift_day_of_week(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut items = Vec::new();
    for item in field.split(',') {
        if item.chars().any(|c| c.is_ascii_alphabetic()) {
            items.push(item.to_string());
            continue;
        }

        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u8 = step
                    .parse()
                    .map_err(|_| format!("invalid day-of-week step '{}'", step))?;
                if step == 0 {
                    return Err("day-of-week step must be positive".to_string());
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let (start, end) = match range {
            "*" => (0, 6),
            _ => match range.split_once('-') {
                Some((start, end)) => (parse_day(start)?, parse_day(end)?),
                None if step.is_some() => (parse_day(range)?, 6),
                None => {
                    let day = parse_day(range)?;
                    (day, day)
                }
            },
        };
        if start > end {
            return Err(format!("day-of-week range '{}' is reversed", range));
        }

        let mut days: Vec<u8> = (start..=end)
            .step_by(usize::from(step.unwrap_or(1)))
            .map(|day| day % 7 + 1)
            .collect();
        days.sort_unstable();
        days.dedup();
        items.extend(days.iter().map(u8::to_string));
    }

    Ok(items.join(","))
}

fn parse_day(value: &str) -> Result<u8, String> {
    match value.parse::<u8>() {
        Ok(day) if day <= 7 => Ok(day),
        _ => Err(format!("day of week '{}' must be between 0 and 7", value)),
    }
}

/// Schedule id: `"{class_name}:{method}"`.
///
/// The pattern is not part of the id: rescheduling the same method with a
/// new pattern replaces the old schedule.
pub fn schedule_id(class_name: &str, method: &str) -> String {
    format!("{}:{}", class_name, method)
}

/// A repeatable job registered with the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub id: String,
    pub pattern: String,
    pub envelope: JobEnvelope,
    pub options: EnqueueOptions,
}

impl ScheduleSpec {
    /// Parsed form of `pattern`.
    pub fn cron(&self) -> QueueResult<CronExpression> {
        CronExpression::parse(&self.pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    #[test]
    fn test_five_field_patterns_get_seconds() {
        let expr = CronExpression::parse("30 2 * * *").unwrap();
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let next = expr.next_after(base).unwrap();

        assert_eq!((next.hour(), next.minute(), next.second()), (2, 30, 0));
        assert_eq!(expr.expression(), "30 2 * * *");
    }

    #[test]
    fn test_six_field_patterns_pass_through() {
        let expr = CronExpression::parse("15 * * * * *").unwrap();
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(expr.next_after(base).unwrap().second(), 15);
    }

    #[test]
    fn test_invalid_pattern() {
        let err = CronExpression::parse("61 * * * *").unwrap_err();
        assert!(matches!(err, QueueError::InvalidCronPattern(_)));
    }

    #[test]
    fn test_schedule_id_ignores_pattern() {
        assert_eq!(schedule_id("ReportService", "nightly"), "ReportService:nightly");
    }

    #[test]
    fn test_weekday_range_is_monday_to_friday() {
        let expr = CronExpression::parse("0 9 * * 1-5").unwrap();
        // Friday night
        let friday = Utc.with_ymd_and_hms(2026, 10, 16, 23, 0, 0).unwrap();
        let next = expr.next_after(friday).unwrap();

        assert_eq!(next, Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap());
        assert_eq!(next.weekday(), Weekday::Mon);
    }

    #[test]
    fn test_sunday_as_zero_and_seven() {
        let friday = Utc.with_ymd_and_hms(2026, 10, 16, 23, 0, 0).unwrap();
        for pattern in ["0 0 * * 0", "0 0 * * 7", "0 0 0 * * 0"] {
            let next = CronExpression::parse(pattern).unwrap().next_after(friday).unwrap();
            assert_eq!(next.weekday(), Weekday::Sun, "{}", pattern);
        }
    }

    #[test]
    fn test_day_of_week_lists_steps_and_names() {
        assert_eq!(shift_day_of_week("*").unwrap(), "*");
        assert_eq!(shift_day_of_week("1,3,5").unwrap(), "2,4,6");
        assert_eq!(shift_day_of_week("5-7").unwrap(), "1,6,7");
        assert_eq!(shift_day_of_week("*/2").unwrap(), "1,3,5,7");
        assert_eq!(shift_day_of_week("MON-FRI").unwrap(), "MON-FRI");

        let saturday = Utc.with_ymd_and_hms(2026, 10, 17, 12, 0, 0).unwrap();
        let next = CronExpression::parse("0 8 * * SAT,6").unwrap().next_after(saturday).unwrap();
        assert_eq!(next.weekday(), Weekday::Sat);
    }

    #[test]
    fn test_day_of_week_out_of_range() {
        for pattern in ["0 0 * * 8", "0 0 * * 5-1", "0 0 * * */0"] {
            let err = CronExpression::parse(pattern).unwrap_err();
            assert!(matches!(err, QueueError::InvalidCronPattern(_)), "{}", pattern);
        }
    }
}
