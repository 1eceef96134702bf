use std::time::Duration;

use crate::error::AppError;

/// Parse a duration such as `90s`, `30m`, `12h`, `7d` or `3600` (seconds)
pub fn parse_time(time_str: &str) -> Result<Duration, AppError> {
    let time_str = time_str.trim().to_lowercase();
    if time_str.is_empty() {
        return Err(AppError::ParseError("Invalid duration: empty string".to_string()));
    }

    let split = time_str
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(time_str.len());
    let (number, unit) = time_str.split_at(split);

    let value = number
        .parse::<f64>()
        .map_err(|_| AppError::ParseError(format!("Invalid duration: '{time_str}'")))?;

    let seconds = match unit.trim() {
        "" | "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        "d" => value * 86400.0,
        other => {
            return Err(AppError::ParseError(format!(
                "Invalid duration unit: '{other}'"
            )));
        }
    };

    Duration::try_from_secs_f64(seconds)
        .map_err(|e| AppError::ParseError(format!("Invalid duration '{time_str}': {e}")))
}

/// Convert a duration to a short human-readable form
pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs_f64();
    if seconds >= 86400.0 {
        format!("{:.2}d", seconds / 86400.0)
    } else if seconds >= 3600.0 {
        format!("{:.2}h", seconds / 3600.0)
    } else if seconds >= 60.0 {
        format!("{:.2}m", seconds / 60.0)
    } else {
        format!("{seconds:.2}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_time("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_time("1.5h").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_time("60d").unwrap(), Duration::from_secs(60 * 86400));
        assert!(parse_time("").is_err());
        assert!(parse_time("3w").is_err());
        assert!(parse_time("-5s").is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(30)), "30.00s");
        assert_eq!(format_duration(Duration::from_secs(5400)), "1.50h");
        assert_eq!(format_duration(Duration::from_secs(60 * 86400)), "60.00d");
    }
}
