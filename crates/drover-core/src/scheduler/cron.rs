//! Cron expression handling
//!
//! Accepts the common five-field form (minute first) as well as the
//! six- and seven-field forms with a leading seconds column.

use chrono::{DateTime, Utc};
use std::str::FromStr;

use super::types::{Result, SchedulerError};

/// Parsed cron schedule
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expr: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    /// Parse a five, six or seven field expression
    pub fn parse(expr: &str) -> Result<Self> {
        let trimmed = expr.trim();
        let fields = trimmed.split_whitespace().count();
        let normalized = match fields {
            5 => format!("0 {}", trimmed),
            6 | 7 => trimmed.to_string(),
            n => {
                return Err(SchedulerError::InvalidCron {
                    expr: expr.to_string(),
                    reason: format!("expected 5 to 7 fields, got {}", n),
                })
            }
        };

        let schedule =
            cron::Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidCron {
                expr: expr.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            expr: trimmed.to_string(),
            schedule,
        })
    }

    /// Expression as given
    #[must_use]
    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// First fire time strictly after `from`
    #[must_use]
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&from).next()
    }

    /// Next fire time from now
    #[must_use]
    pub fn upcoming(&self) -> Option<DateTime<Utc>> {
        self.schedule.upcoming(Utc).next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn test_five_field_expression() {
        let schedule = CronSchedule::parse("*/15 * * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2025, 3, 1, 10, 7, 30).unwrap();
        let next = schedule.next_after(from).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 1, 10, 15, 0).unwrap());
    }

    #[test]
    fn test_six_field_expression() {
        let schedule = CronSchedule::parse("30 0 9 * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        let next = schedule.next_after(from).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 2, 9, 0, 30).unwrap());
    }

    #[test]
    fn test_next_after_is_strict() {
        let schedule = CronSchedule::parse("0 * * * *").unwrap();
        let on_the_hour = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        let next = schedule.next_after(on_the_hour).unwrap();
        assert_eq!(next.hour(), 11);
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(matches!(
            CronSchedule::parse("* * *"),
            Err(SchedulerError::InvalidCron { .. })
        ));
        assert!(matches!(
            CronSchedule::parse("99 * * * *"),
            Err(SchedulerError::InvalidCron { .. })
        ));
    }

    #[test]
    fn test_upcoming_is_future() {
        let schedule = CronSchedule::parse("* * * * *").unwrap();
        assert!(schedule.upcoming().unwrap() > Utc::now());
    }
}
