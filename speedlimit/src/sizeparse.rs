//! Parses the decimal-plus-unit-suffix notation `set --rate`/`--bucket`
//! accept: a bare `u64`, or one suffixed with `k`/`K` (1024) or `m`/`M`
//! (1024²). Mirrors `original_source/src/limiter/utils.c`'s `parse_size`,
//! with the "invalid"/"unsupported suffix" `fprintf`+`return 0` pattern
//! replaced by a proper `Result` — zero was never a distinguishable error
//! code here anyway, since `0` is also a legitimately rejected rate.
use crate::error::{LimiterError, Result};

/// Parses a rate/bucket-size argument. Rejects empty input, non-numeric
/// input, unrecognised suffixes, and a value that parses to zero (zero
/// bytes/sec is never a valid rate or bucket, per the data model).
pub fn parse_size(input: &str) -> Result<u64> {
    let input = input.trim();
    if input.is_empty() {
        return Err(LimiterError::RuleMalformed("empty size value".into()));
    }

    let (digits, multiplier) = match input.chars().last() {
        Some(c) if c.eq_ignore_ascii_case(&'k') => (&input[..input.len() - 1], 1024u64),
        Some(c) if c.eq_ignore_ascii_case(&'m') => (&input[..input.len() - 1], 1024u64 * 1024),
        _ => (input, 1u64),
    };

    let value: u64 = digits
        .parse()
        .map_err(|_| LimiterError::RuleMalformed(format!("invalid size value: {input}")))?;

    let total = value
        .checked_mul(multiplier)
        .ok_or_else(|| LimiterError::RuleMalformed(format!("size value overflows u64: {input}")))?;

    if total == 0 {
        return Err(LimiterError::RuleMalformed(format!(
            "size value must be > 0: {input}"
        )));
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_decimal_has_no_multiplier() {
        assert_eq!(parse_size("1048576").unwrap(), 1_048_576);
    }

    #[test]
    fn lowercase_and_uppercase_k_multiply_by_1024() {
        assert_eq!(parse_size("512k").unwrap(), 512 * 1024);
        assert_eq!(parse_size("512K").unwrap(), 512 * 1024);
    }

    #[test]
    fn lowercase_and_uppercase_m_multiply_by_1024_squared() {
        assert_eq!(parse_size("1m").unwrap(), 1024 * 1024);
        assert_eq!(parse_size("2M").unwrap(), 2 * 1024 * 1024);
    }

    #[test]
    fn zero_is_rejected_regardless_of_suffix() {
        assert!(parse_size("0").is_err());
        assert!(parse_size("0k").is_err());
        assert!(parse_size("0m").is_err());
    }

    #[test]
    fn unrecognised_suffix_is_rejected() {
        assert!(parse_size("10g").is_err());
        assert!(parse_size("10x").is_err());
    }

    #[test]
    fn garbage_and_empty_input_is_rejected() {
        assert!(parse_size("").is_err());
        assert!(parse_size("not-a-number").is_err());
        assert!(parse_size("k").is_err());
    }
}
