//! Capacity arithmetic: quantity strings, percentages, and rounding.
//!
//! Quantities follow the cluster's resource notation: a decimal number
//! with an optional binary (`Ki`…`Ei`), decimal (`k`…`E`, `m`) or
//! exponent (`e3`) suffix. Fractional byte counts round up.

use crate::error::{VolumeError, VolumeResult};

/// One gibibyte (2^30 bytes).
pub const GIB: u64 = 1 << 30;

const BINARY_SUFFIXES: [(&str, u32); 6] = [
    ("Ei", 60),
    ("Pi", 50),
    ("Ti", 40),
    ("Gi", 30),
    ("Mi", 20),
    ("Ki", 10),
];

const DECIMAL_SUFFIXES: [(&str, u64); 6] = [
    ("E", 1_000_000_000_000_000_000),
    ("P", 1_000_000_000_000_000),
    ("T", 1_000_000_000_000),
    ("G", 1_000_000_000),
    ("M", 1_000_000),
    ("k", 1_000),
];

/// Parse a quantity string such as `"10Gi"`, `"500M"` or `"1.5Ti"` into bytes.
pub fn parse_quantity(input: &str) -> VolumeResult<u64> {
    let invalid = |reason: &str| VolumeError::InvalidQuantity(input.to_string(), reason.to_string());

    let s = input.trim();
    if s.is_empty() {
        return Err(invalid("empty quantity"));
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    if number.is_empty() {
        return Err(invalid("missing number"));
    }
    if number.starts_with('-') {
        return Err(invalid("negative quantity"));
    }

    // Exact integer path avoids float rounding on large byte counts.
    if !number.contains('.') {
        let base: u64 = number
            .trim_start_matches('+')
            .parse()
            .map_err(|_| invalid("malformed number"))?;
        let multiplier = match suffix_multiplier(suffix) {
            Some(Multiplier::Integer(m)) => Some(m),
            Some(Multiplier::Milli) => None,
            None => return Err(invalid("unknown suffix")),
        };
        if let Some(m) = multiplier {
            return base
                .checked_mul(m)
                .ok_or_else(|| invalid("quantity overflows u64"));
        }
    }

    let value: f64 = number.parse().map_err(|_| invalid("malformed number"))?;
    let scaled = match suffix_multiplier(suffix) {
        Some(Multiplier::Integer(m)) => value * m as f64,
        Some(Multiplier::Milli) => value / 1000.0,
        None => return Err(invalid("unknown suffix")),
    };
    if !scaled.is_finite() || scaled < 0.0 || scaled > u64::MAX as f64 {
        return Err(invalid("quantity out of range"));
    }
    Ok(scaled.ceil() as u64)
}

enum Multiplier {
    Integer(u64),
    Milli,
}

fn suffix_multiplier(suffix: &str) -> Option<Multiplier> {
    if suffix.is_empty() {
        return Some(Multiplier::Integer(1));
    }
    if suffix == "m" {
        return Some(Multiplier::Milli);
    }
    if let Some((_, shift)) = BINARY_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        return Some(Multiplier::Integer(1u64 << shift));
    }
    if let Some((_, m)) = DECIMAL_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        return Some(Multiplier::Integer(*m));
    }
    // Exponent form: e3, E6, e+2.
    let exponent = suffix.strip_prefix(['e', 'E'])?;
    let exponent: u32 = exponent.trim_start_matches('+').parse().ok()?;
    10u64.checked_pow(exponent).map(Multiplier::Integer)
}

/// Render a byte count using the largest exact binary suffix.
pub fn format_quantity(bytes: u64) -> String {
    if bytes == 0 {
        return "0".to_string();
    }
    for (suffix, shift) in BINARY_SUFFIXES {
        if bytes % (1u64 << shift) == 0 {
            return format!("{}{suffix}", bytes >> shift);
        }
    }
    bytes.to_string()
}

/// Convert a percentage annotation into a byte count of `capacity`.
///
/// An empty `value` falls back to `default`. The value must end in `%`
/// and lie within 0–100.
pub fn convert_percentage_to_bytes(value: &str, capacity: u64, default: &str) -> VolumeResult<u64> {
    let value = if value.trim().is_empty() { default } else { value };
    let invalid = |reason: &str| VolumeError::InvalidPercentage(value.to_string(), reason.to_string());

    let number = value
        .trim()
        .strip_suffix('%')
        .ok_or_else(|| invalid("value should be a percentage"))?;
    let pct: f64 = number
        .trim()
        .parse()
        .map_err(|_| invalid("malformed number"))?;
    if !(0.0..=100.0).contains(&pct) {
        return Err(invalid("value should be between 0% and 100%"));
    }

    Ok((capacity as f64 * pct / 100.0) as u64)
}

/// Round up to the next multiple of 2^30 bytes unless already aligned.
pub fn ceil_to_gibibyte(bytes: u64) -> u64 {
    bytes.div_ceil(GIB).saturating_mul(GIB)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_binary_suffixes() {
        assert_eq!(parse_quantity("10Gi").unwrap(), 10 * GIB);
        assert_eq!(parse_quantity("512Mi").unwrap(), 512 << 20);
        assert_eq!(parse_quantity("1Ti").unwrap(), 1 << 40);
        assert_eq!(parse_quantity("1.5Gi").unwrap(), GIB + GIB / 2);
    }

    #[test]
    fn parse_decimal_and_plain() {
        assert_eq!(parse_quantity("500M").unwrap(), 500_000_000);
        assert_eq!(parse_quantity("2k").unwrap(), 2_000);
        assert_eq!(parse_quantity("12884901888").unwrap(), 12 * GIB);
        assert_eq!(parse_quantity("1e9").unwrap(), 1_000_000_000);
        assert_eq!(parse_quantity("1500m").unwrap(), 2);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_quantity("").is_err());
        assert!(parse_quantity("Gi").is_err());
        assert!(parse_quantity("-1Gi").is_err());
        assert!(parse_quantity("10Qi").is_err());
        assert!(parse_quantity("ten").is_err());
    }

    #[test]
    fn format_picks_largest_exact_suffix() {
        assert_eq!(format_quantity(12 * GIB), "12Gi");
        assert_eq!(format_quantity(1 << 40), "1Ti");
        assert_eq!(format_quantity(1536 << 20), "1536Mi");
        assert_eq!(format_quantity(1000), "1000");
        assert_eq!(format_quantity(0), "0");
    }

    #[test]
    fn percentage_conversion() {
        assert_eq!(convert_percentage_to_bytes("50%", 200, "80%").unwrap(), 100);
        assert_eq!(convert_percentage_to_bytes("", 400, "25%").unwrap(), 100);
        assert_eq!(convert_percentage_to_bytes("0%", 400, "25%").unwrap(), 0);
        assert_eq!(convert_percentage_to_bytes("100%", 400, "25%").unwrap(), 400);
    }

    #[test]
    fn percentage_out_of_range_or_malformed() {
        assert!(convert_percentage_to_bytes("150%", 100, "80%").is_err());
        assert!(convert_percentage_to_bytes("-10%", 100, "80%").is_err());
        assert!(convert_percentage_to_bytes("50", 100, "80%").is_err());
        assert!(convert_percentage_to_bytes("abc%", 100, "80%").is_err());
        assert!(convert_percentage_to_bytes("abc", 100, "80%").is_err());
    }

    #[test]
    fn gibibyte_rounding() {
        // 10Gi + 20% is already aligned.
        assert_eq!(ceil_to_gibibyte(12 * GIB), 12 * GIB);
        // 12.3Gi rounds up to 13Gi.
        let candidate = 12 * GIB + (3 * GIB) / 10;
        assert_eq!(ceil_to_gibibyte(candidate), 13 * GIB);
        assert_eq!(ceil_to_gibibyte(1), GIB);
        assert_eq!(ceil_to_gibibyte(0), 0);
    }
}
