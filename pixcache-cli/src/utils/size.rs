use crate::error::AppError;

const UNITS: [(&str, u64); 5] = [
    ("b", 1),
    ("kb", 1024),
    ("mb", 1024 * 1024),
    ("gb", 1024 * 1024 * 1024),
    ("tb", 1024 * 1024 * 1024 * 1024),
];

/// Parse a size such as `500MB`, `1.5gb` or `2048` (bytes) into bytes
pub fn parse_size(size_str: &str) -> Result<u64, AppError> {
    let size_str = size_str.trim().to_lowercase();
    if size_str.is_empty() {
        return Err(AppError::ParseError("Invalid size: empty string".to_string()));
    }

    let split = size_str
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(size_str.len());
    let (number, unit) = size_str.split_at(split);
    let unit = unit.trim();

    if unit.is_empty() {
        return number
            .parse::<u64>()
            .map_err(|_| AppError::ParseError(format!("Invalid size: '{size_str}'")));
    }

    let value = number
        .parse::<f64>()
        .map_err(|_| AppError::ParseError(format!("Invalid size: '{size_str}'")))?;
    let multiplier = UNITS
        .iter()
        .find(|(name, _)| *name == unit)
        .map(|(_, multiplier)| *multiplier)
        .ok_or_else(|| AppError::ParseError(format!("Invalid size unit: '{unit}'")))?;

    Ok((value * multiplier as f64) as u64)
}

/// Convert bytes to a human-readable format
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("2048").unwrap(), 2048);
        assert_eq!(parse_size("500MB").unwrap(), 500 * 1024 * 1024);
        assert_eq!(parse_size(" 1.5 kb ").unwrap(), 1536);
        assert_eq!(parse_size("1GB").unwrap(), 1024 * 1024 * 1024);
        assert!(parse_size("").is_err());
        assert!(parse_size("12 parsecs").is_err());
        assert!(parse_size("1.5").is_err());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(500 * 1024 * 1024), "500.00 MB");
    }
}
