use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

use crate::error::AppError;

/// Parse one `Name: Value` header
fn parse_header(header_str: &str) -> Result<(HeaderName, HeaderValue), AppError> {
    let (name, value) = header_str.split_once(':').ok_or_else(|| {
        AppError::InvalidInput(format!(
            "Invalid header format: '{header_str}'. Expected 'Name: Value'"
        ))
    })?;
    let (name, value) = (name.trim(), value.trim());

    let header_name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| AppError::InvalidInput(format!("Invalid header name: '{name}'")))?;
    let header_value = HeaderValue::from_str(value)
        .map_err(|_| AppError::InvalidInput(format!("Invalid header value: '{value}'")))?;
    Ok((header_name, header_value))
}

/// Parse a collection of header strings into a HeaderMap
pub fn parse_headers(header_strings: &[String]) -> Result<HeaderMap, AppError> {
    let mut headers = HeaderMap::new();
    for header_str in header_strings {
        let (name, value) = parse_header(header_str)?;
        debug!(header = %name, "Adding request header");
        headers.insert(name, value);
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_headers() {
        let headers = parse_headers(&[
            "Referer: https://example.com/".to_string(),
            "X-Token:abc:def".to_string(),
        ])
        .unwrap();
        assert_eq!(headers["referer"], "https://example.com/");
        assert_eq!(headers["x-token"], "abc:def");
    }

    #[test]
    fn test_rejects_malformed_header() {
        assert!(parse_headers(&["no colon here".to_string()]).is_err());
        assert!(parse_headers(&["bad name: v".to_string()]).is_err());
    }
}
