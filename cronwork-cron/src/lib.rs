use chrono::{DateTime, Datelike, TimeZone, Timelike};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CronParseError {
    #[error("cron expression '{0}' must have 5 fields: MIN HOUR DOM MON DOW")]
    FieldCount(String),
    #[error("invalid {field} field '{value}'")]
    BadField { field: &'static str, value: String },
    #[error("{field} value {value} out of range {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
}

/// One parsed cron field: literal value, wildcard, comma list, or `*/N`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CronField {
    Any,
    Value(u32),
    List(Vec<u32>),
    Step(u32),
}

impl CronField {
    fn matches(&self, value: u32) -> bool {
        match self {
            CronField::Any => true,
            CronField::Value(v) => *v == value,
            CronField::List(values) => values.contains(&value),
            CronField::Step(n) => value % n == 0,
        }
    }
}

/// A parsed five-field cron expression. Evaluation is pure: the same
/// (expression, instant) pair always yields the same answer.
///
/// Day-of-month and day-of-week are both conjoined — an instant matches
/// only when every field matches, which is stricter than POSIX cron.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minute: CronField,
    hour: CronField,
    day: CronField,
    month: CronField,
    weekday: CronField,
}

impl CronExpr {
    pub fn parse(expression: &str) -> Result<Self, CronParseError> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(CronParseError::FieldCount(expression.to_string()));
        }

        Ok(Self {
            minute: parse_field(parts[0], "minute", 0, 59)?,
            hour: parse_field(parts[1], "hour", 0, 23)?,
            day: parse_field(parts[2], "day", 1, 31)?,
            month: parse_field(parts[3], "month", 1, 12)?,
            weekday: parse_field(parts[4], "weekday", 0, 6)?,
        })
    }

    /// Whether the instant matches. Weekday numbering follows the usual
    /// cron convention: Sunday is 0.
    pub fn matches<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> bool {
        self.minute.matches(at.minute())
            && self.hour.matches(at.hour())
            && self.day.matches(at.day())
            && self.month.matches(at.month())
            && self.weekday.matches(at.weekday().num_days_from_sunday())
    }
}

fn parse_field(
    raw: &str,
    field: &'static str,
    min: u32,
    max: u32,
) -> Result<CronField, CronParseError> {
    let bad = || CronParseError::BadField {
        field,
        value: raw.to_string(),
    };

    if raw == "*" {
        return Ok(CronField::Any);
    }

    if let Some(step) = raw.strip_prefix("*/") {
        let n: u32 = step.parse().map_err(|_| bad())?;
        if n == 0 {
            return Err(bad());
        }
        return Ok(CronField::Step(n));
    }

    if raw.contains(',') {
        let mut values = Vec::new();
        for part in raw.split(',') {
            let value: u32 = part.trim().parse().map_err(|_| bad())?;
            check_range(field, value, min, max)?;
            values.push(value);
        }
        return Ok(CronField::List(values));
    }

    let value: u32 = raw.parse().map_err(|_| bad())?;
    check_range(field, value, min, max)?;
    Ok(CronField::Value(value))
}

fn check_range(field: &'static str, value: u32, min: u32, max: u32) -> Result<(), CronParseError> {
    if value < min || value > max {
        return Err(CronParseError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn at(hour: u32, minute: u32) -> chrono::DateTime<Utc> {
        // 2026-08-03 is a Monday.
        Utc.with_ymd_and_hms(2026, 8, 3, hour, minute, 0).unwrap()
    }

    #[test]
    fn wildcard_matches_everything() {
        let expr = CronExpr::parse("* * * * *").unwrap();
        assert!(expr.matches(&at(0, 0)));
        assert!(expr.matches(&at(23, 59)));
    }

    #[test]
    fn step_matches_even_minutes_only() {
        let expr = CronExpr::parse("*/2 * * * *").unwrap();
        assert!(expr.matches(&at(10, 0)));
        assert!(!expr.matches(&at(10, 1)));
        assert!(expr.matches(&at(10, 2)));
    }

    #[test]
    fn list_and_literal_fields() {
        let expr = CronExpr::parse("0,30 8 * * *").unwrap();
        assert!(expr.matches(&at(8, 0)));
        assert!(expr.matches(&at(8, 30)));
        assert!(!expr.matches(&at(8, 15)));
        assert!(!expr.matches(&at(9, 0)));
    }

    #[test]
    fn day_of_month_and_weekday_are_both_required() {
        // 2026-08-03 is a Monday (weekday 1) and the 3rd of the month.
        let both = CronExpr::parse("0 12 3 * 1").unwrap();
        assert!(both.matches(&at(12, 0)));

        let wrong_weekday = CronExpr::parse("0 12 3 * 2").unwrap();
        assert!(!wrong_weekday.matches(&at(12, 0)));

        let wrong_day = CronExpr::parse("0 12 4 * 1").unwrap();
        assert!(!wrong_day.matches(&at(12, 0)));
    }

    #[test]
    fn evaluation_is_pure() {
        let expr = CronExpr::parse("*/5 * * * *").unwrap();
        let instant = at(9, 25);
        let first = expr.matches(&instant);
        for _ in 0..10 {
            assert_eq!(expr.matches(&instant), first);
        }
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert_eq!(
            CronExpr::parse("bogus"),
            Err(CronParseError::FieldCount("bogus".into()))
        );
        assert!(matches!(
            CronExpr::parse("x * * * *"),
            Err(CronParseError::BadField { field: "minute", .. })
        ));
        assert!(matches!(
            CronExpr::parse("*/0 * * * *"),
            Err(CronParseError::BadField { field: "minute", .. })
        ));
        assert!(matches!(
            CronExpr::parse("61 * * * *"),
            Err(CronParseError::OutOfRange { field: "minute", value: 61, .. })
        ));
        assert!(matches!(
            CronExpr::parse("* * 0 * *"),
            Err(CronParseError::OutOfRange { field: "day", .. })
        ));
        assert!(matches!(
            CronExpr::parse("* * * * 7"),
            Err(CronParseError::OutOfRange { field: "weekday", .. })
        ));
    }
}
