//! Human-readable byte sizes ("4GB", "512 MB").

use thiserror::Error;

const KB: u64 = 1024;
const MB: u64 = KB * 1024;
const GB: u64 = MB * 1024;
const TB: u64 = GB * 1024;

/// Suffixes, longest first so "GB" wins over "B".
const UNITS: [(&str, u64); 9] = [
    ("TB", TB),
    ("GB", GB),
    ("MB", MB),
    ("KB", KB),
    ("T", TB),
    ("G", GB),
    ("M", MB),
    ("K", KB),
    ("B", 1),
];

/// Error parsing a size string.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid size '{input}', expected a whole number with an optional KB/MB/GB/TB suffix")]
pub struct SizeParseError {
    input: String,
}

/// Parses a size into bytes. Suffixes are binary (1KB = 1024) and
/// case-insensitive; a bare number is bytes.
///
/// ```
/// use photobatch::config::parse_size;
///
/// assert_eq!(parse_size("4GB").unwrap(), 4 * 1024 * 1024 * 1024);
/// assert_eq!(parse_size("512 mb").unwrap(), 512 * 1024 * 1024);
/// assert_eq!(parse_size("100").unwrap(), 100);
/// ```
pub fn parse_size(input: &str) -> Result<u64, SizeParseError> {
    let err = || SizeParseError {
        input: input.to_string(),
    };
    let upper = input.trim().to_ascii_uppercase();

    let (digits, multiplier) = UNITS
        .iter()
        .find_map(|(suffix, mult)| upper.strip_suffix(suffix).map(|rest| (rest.trim_end(), *mult)))
        .unwrap_or((upper.as_str(), 1));

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(err());
    }
    digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(err)
}

/// Formats bytes with the largest suffix that divides them exactly.
pub fn format_size(bytes: u64) -> String {
    [("TB", TB), ("GB", GB), ("MB", MB), ("KB", KB)]
        .iter()
        .find(|(_, unit)| bytes >= *unit && bytes % unit == 0)
        .map(|(suffix, unit)| format!("{}{}", bytes / unit, suffix))
        .unwrap_or_else(|| bytes.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!(parse_size("0").unwrap(), 0);
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("64B").unwrap(), 64);
        assert_eq!(parse_size("1k").unwrap(), KB);
        assert_eq!(parse_size("3KB").unwrap(), 3 * KB);
        assert_eq!(parse_size("500MB").unwrap(), 500 * MB);
        assert_eq!(parse_size("2g").unwrap(), 2 * GB);
        assert_eq!(parse_size("1TB").unwrap(), TB);
    }

    #[test]
    fn test_parse_whitespace() {
        assert_eq!(parse_size("  4 GB ").unwrap(), 4 * GB);
    }

    #[test]
    fn test_parse_invalid() {
        for bad in ["", "GB", "abc", "-1GB", "1.5GB", "2PB", "99999999999TB"] {
            assert!(parse_size(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_format() {
        assert_eq!(format_size(4 * GB), "4GB");
        assert_eq!(format_size(1536 * MB), "1536MB");
        assert_eq!(format_size(KB), "1KB");
        assert_eq!(format_size(1000), "1000");
        assert_eq!(format_size(0), "0");
    }

    #[test]
    fn test_format_parses_back() {
        for bytes in [0, 7, KB, 3 * MB, 5 * GB, 2 * TB] {
            assert_eq!(parse_size(&format_size(bytes)).unwrap(), bytes);
        }
    }
}
