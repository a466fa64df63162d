//! Human-friendly duration parsing.
//!
//! Accepts `90d`, `2160h`, `30m`, `45s`, combinations such as `1h30m`,
//! and bare integers (seconds).

use std::time::Duration;

use crate::ConfigError;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// Parse a duration string
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(ConfigError::InvalidDuration(input.to_string()));
    }

    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total: u64 = 0;
    let mut digits = String::new();
    for ch in s.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }

        let unit = match ch {
            'd' => DAY,
            'h' => HOUR,
            'm' => MINUTE,
            's' => 1,
            _ => return Err(ConfigError::InvalidDuration(input.to_string())),
        };
        let value: u64 = digits
            .parse()
            .map_err(|_| ConfigError::InvalidDuration(input.to_string()))?;
        total = value
            .checked_mul(unit)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(|| ConfigError::InvalidDuration(input.to_string()))?;
        digits.clear();
    }

    // Trailing digits without a unit ("1h30") are ambiguous
    if !digits.is_empty() {
        return Err(ConfigError::InvalidDuration(input.to_string()));
    }

    Ok(Duration::from_secs(total))
}

/// Format a duration in the same notation `parse_duration` accepts
pub fn format_duration(duration: Duration) -> String {
    let mut secs = duration.as_secs();
    if secs == 0 {
        return "0s".to_string();
    }

    let mut out = String::new();
    for (unit, suffix) in [(DAY, 'd'), (HOUR, 'h'), (MINUTE, 'm'), (1, 's')] {
        if secs >= unit {
            out.push_str(&(secs / unit).to_string());
            out.push(suffix);
            secs %= unit;
        }
    }
    out
}
