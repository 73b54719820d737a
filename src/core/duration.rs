//! Short duration parsing and human readable time deltas.
//!
//! Durations are written as a run of `<number><unit>` pairs such as `1h30m`
//! or `2 weeks 3d`. Supported units are weeks, days, hours, minutes and
//! seconds, either abbreviated (`w`, `d`, `h`, `m`, `s`) or spelled out.

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when parsing a duration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DurationError {
    /// The input was not a sequence of `<number><unit>` pairs.
    #[error("invalid duration: {0}")]
    Invalid(String),

    /// A unit was not recognised.
    #[error("unknown duration unit '{unit}' in {input}")]
    UnknownUnit { unit: String, input: String },

    /// The total does not fit in a duration.
    #[error("duration too large: {0}")]
    Overflow(String),
}

const UNITS: [(&str, u64); 5] = [
    ("week", 7 * 86_400),
    ("day", 86_400),
    ("hour", 3_600),
    ("minute", 60),
    ("second", 1),
];

fn unit_seconds(unit: &str) -> Option<u64> {
    match unit {
        "w" | "week" | "weeks" => Some(7 * 86_400),
        "d" | "day" | "days" => Some(86_400),
        "h" | "hour" | "hours" => Some(3_600),
        "m" | "min" | "mins" | "minute" | "minutes" => Some(60),
        "s" | "sec" | "secs" | "second" | "seconds" => Some(1),
        _ => None,
    }
}

/// Parse a duration string like "5m", "1h30m", "2 weeks 3d" or "30s".
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    let invalid = || DurationError::Invalid(input.to_string());
    let mut total_secs: u64 = 0;
    let mut chars = input.trim().chars().peekable();
    let mut saw_pair = false;

    while chars.peek().is_some() {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let mut number = String::new();
        while let Some(c) = chars.next_if(|c| c.is_ascii_digit()) {
            number.push(c);
        }
        if number.is_empty() {
            return Err(invalid());
        }
        let number: u64 = number.parse().map_err(|_| invalid())?;

        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let mut unit = String::new();
        while let Some(c) = chars.next_if(|c| c.is_ascii_alphabetic()) {
            unit.push(c.to_ascii_lowercase());
        }
        let scale = unit_seconds(&unit).ok_or_else(|| DurationError::UnknownUnit {
            unit: unit.clone(),
            input: input.to_string(),
        })?;

        total_secs = number
            .checked_mul(scale)
            .and_then(|secs| total_secs.checked_add(secs))
            .ok_or_else(|| DurationError::Overflow(input.to_string()))?;
        saw_pair = true;

        while chars.next_if(|c| c.is_whitespace()).is_some() {}
    }

    if !saw_pair || total_secs == 0 {
        return Err(invalid());
    }

    Ok(Duration::from_secs(total_secs))
}

/// Render a duration with its two most significant units, e.g. "1 day and 3 hours".
pub fn format_duration(duration: Duration) -> String {
    let mut remaining = duration.as_secs();
    let mut parts = Vec::new();

    for (name, size) in UNITS {
        if parts.len() == 2 {
            break;
        }
        let count = remaining / size;
        if count > 0 {
            remaining -= count * size;
            let plural = if count == 1 { "" } else { "s" };
            parts.push(format!("{count} {name}{plural}"));
        }
    }

    match parts.as_slice() {
        [] => "0 seconds".to_string(),
        [one] => one.clone(),
        [first, second] => format!("{first} and {second}"),
        _ => parts.join(", "),
    }
}

/// Describe `then` relative to `now`: "5 minutes ago" or "in 2 hours".
pub fn natural_delta(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    if then <= now {
        let elapsed = (now - then).to_std().unwrap_or_default();
        if elapsed.as_secs() == 0 {
            return "just now".to_string();
        }
        format!("{} ago", format_duration(elapsed))
    } else {
        let ahead = (then - now).to_std().unwrap_or_default();
        format!("in {}", format_duration(ahead))
    }
}
