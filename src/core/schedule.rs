//! Schedule parsing and next occurrence calculation.
//!
//! Supports standard 5-field cron expressions, extended 6-field cron (with
//! seconds), and the usual shortcuts (@daily, @hourly, etc.). Evaluation is
//! pure: the caller supplies "now".

use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur when parsing or using schedules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    /// Invalid cron expression.
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// No more occurrences.
    #[error("no more occurrences")]
    NoMoreOccurrences,
}

/// A parsed cron schedule.
#[derive(Debug, Clone)]
pub struct Schedule {
    /// The original expression string.
    expression: String,
    /// Parsed form.
    cron: Box<CronSchedule>,
}

impl Schedule {
    /// Parse a cron expression.
    ///
    /// Supports:
    /// - Standard 5-field cron: `minute hour day month weekday`
    /// - Extended 6-field cron: `second minute hour day month weekday`
    /// - Shortcuts: `@yearly`, `@annually`, `@monthly`, `@weekly`, `@daily`,
    ///   `@midnight`, `@hourly`
    pub fn parse(expression: impl Into<String>) -> Result<Self, ScheduleError> {
        let expression = expression.into();
        let trimmed = expression.trim();

        let cron = if trimmed.starts_with('@') {
            Self::parse_shortcut(trimmed)?
        } else {
            Self::parse_cron(trimmed)?
        };

        Ok(Self {
            expression,
            cron: Box::new(cron),
        })
    }

    /// Parse a shortcut expression (@daily, @hourly, etc.).
    fn parse_shortcut(expression: &str) -> Result<CronSchedule, ScheduleError> {
        match expression.to_lowercase().as_str() {
            "@yearly" | "@annually" => Self::parse_cron("0 0 1 1 *"),
            "@monthly" => Self::parse_cron("0 0 1 * *"),
            "@weekly" => Self::parse_cron("0 0 * * SUN"),
            "@daily" | "@midnight" => Self::parse_cron("0 0 * * *"),
            "@hourly" => Self::parse_cron("0 * * * *"),
            _ => Err(ScheduleError::InvalidCron(format!(
                "unknown shortcut: {}",
                expression
            ))),
        }
    }

    /// Parse a 5- or 6-field cron expression.
    fn parse_cron(expression: &str) -> Result<CronSchedule, ScheduleError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();

        let cron_expr = match fields.len() {
            // The cron crate always wants a leading seconds field.
            5 => format!("0 {}", fields.join(" ")),
            6 => fields.join(" "),
            n => {
                return Err(ScheduleError::InvalidCron(format!(
                    "expected 5 or 6 fields, got {}",
                    n
                )));
            }
        };

        CronSchedule::from_str(&cron_expr).map_err(|e| ScheduleError::InvalidCron(e.to_string()))
    }

    /// Get the next occurrence strictly after the given time.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        self.cron
            .after(&after)
            .next()
            .ok_or(ScheduleError::NoMoreOccurrences)
    }

    /// Get the next N occurrences after the given time.
    pub fn next_n_after(&self, after: DateTime<Utc>, n: usize) -> Vec<DateTime<Utc>> {
        self.cron.after(&after).take(n).collect()
    }

    /// Get the original expression string.
    pub fn expression(&self) -> &str {
        &self.expression
    }
}
