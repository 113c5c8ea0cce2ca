//! Size and duration rendering/parsing used in quotas, resource requests
//! and user-facing failure messages.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("invalid size: {0}")]
    InvalidSize(String),
    #[error("invalid duration: {0}")]
    InvalidDuration(String),
}

/// Renders a byte count with the largest binary unit that keeps the value
/// below 1024, e.g. `4m`, `2g`.
pub fn size_str(size: u64) -> String {
    let mut value = size as f64;
    for unit in ["", "k", "m", "g", "t"] {
        if value < 1024.0 {
            if unit.is_empty() {
                return format!("{}", size);
            }
            return format!("{:.1}{}", value, unit);
        }
        value /= 1024.0;
    }
    format!("{:.1}p", value)
}

/// Renders a number of seconds with the largest unit that keeps the value
/// below its range, e.g. `30s`, `5m`, `2h`, `60d`.
pub fn duration_str(seconds: u64) -> String {
    let mut value = seconds;
    for (limit, label) in [(60, "s"), (60, "m"), (24, "h"), (365, "d")] {
        if value < limit {
            return format!("{}{}", value, label);
        }
        value /= limit;
    }
    format!("{}y", value)
}

/// Parses a size with an optional binary suffix (`k`, `m`, `g`, `t`, case
/// insensitive). A bare number is bytes.
pub fn parse_size(spec: &str) -> Result<u64, ParseError> {
    let spec = spec.trim();
    let err = || ParseError::InvalidSize(spec.to_string());
    let (digits, multiplier) = match spec.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => {
            let multiplier: u64 = match c.to_ascii_lowercase() {
                'k' => 1 << 10,
                'm' => 1 << 20,
                'g' => 1 << 30,
                't' => 1 << 40,
                _ => return Err(err()),
            };
            (&spec[..spec.len() - 1], multiplier)
        }
        Some(_) => (spec, 1),
        None => return Err(err()),
    };
    let value: f64 = digits.parse().map_err(|_| err())?;
    if value < 0.0 {
        return Err(err());
    }
    Ok((value * multiplier as f64) as u64)
}

/// Parses a duration with an optional suffix (`s`, `m`, `h`, `d`, `y`).
/// A bare number is seconds.
pub fn parse_duration(spec: &str) -> Result<u64, ParseError> {
    let spec = spec.trim();
    let err = || ParseError::InvalidDuration(spec.to_string());
    let (digits, multiplier) = match spec.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => {
            let multiplier: u64 = match c.to_ascii_lowercase() {
                's' => 1,
                'm' => 60,
                'h' => 60 * 60,
                'd' => 60 * 60 * 24,
                'y' => 60 * 60 * 24 * 365,
                _ => return Err(err()),
            };
            (&spec[..spec.len() - 1], multiplier)
        }
        Some(_) => (spec, 1),
        None => return Err(err()),
    };
    let value: f64 = digits.parse().map_err(|_| err())?;
    if value < 0.0 {
        return Err(err());
    }
    Ok((value * multiplier as f64) as u64)
}
