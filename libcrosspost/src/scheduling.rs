//! Schedule parsing
//!
//! Turns the human-readable `schedule` of a submission into a fire time.

use crate::error::{QueueError, Result};
use chrono::{DateTime, Duration, Utc};

/// Parse a schedule string into a DateTime
///
/// Supports multiple formats:
/// - Absolute timestamps: "2025-11-20T15:00:00Z" (RFC 3339)
/// - Relative durations: "1h", "30m", "2d"
/// - Natural language: "tomorrow", "in 1 hour", "next monday 10am"
///
/// A timestamp in the past is returned as-is; the queue runs it right away.
///
/// # Errors
///
/// Returns `QueueError::Scheduling` if the input matches none of the formats,
/// or if a relative duration lands past the latest representable time.
pub fn parse_schedule(input: &str) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return Err(QueueError::Scheduling("schedule cannot be empty".to_string()).into());
    }

    if let Ok(at) = DateTime::parse_from_rfc3339(input) {
        return Ok(at.with_timezone(&Utc));
    }

    if let Some(duration) = parse_duration(input) {
        return Utc::now().checked_add_signed(duration).ok_or_else(|| {
            QueueError::Scheduling(format!("'{}' is out of range", input)).into()
        });
    }

    parse_natural_language(input)
}

/// Parse a duration string into a chrono::Duration
fn parse_duration(input: &str) -> Option<Duration> {
    let std_duration = humantime::parse_duration(input).ok()?;
    Duration::from_std(std_duration).ok()
}

fn parse_natural_language(input: &str) -> Result<DateTime<Utc>> {
    chrono_english::parse_date_string(input, Utc::now(), chrono_english::Dialect::Us).map_err(
        |e| QueueError::Scheduling(format!("could not parse '{}': {}", input, e)).into(),
    )
}
