//! Integer nano-dollar arithmetic.
//!
//! 1 USD = 1_000_000_000 nanos. Prices are parsed from their decimal string
//! with `rust_decimal`, never through `f64`.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use std::str::FromStr;

use crate::error::{Error, Result};

pub const NANOS_PER_USD: u64 = 1_000_000_000;
pub const NANOS_PER_CENT: u64 = 10_000_000;

/// Parse a decimal USD string (`"0.000015"`, `"2"`, `"1.5e-6"`) into nanos.
///
/// Digits beyond the ninth decimal place round half away from zero.
pub fn parse_usd_to_nanos(raw: &str) -> Result<u64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::pricing("empty price"));
    }

    let amount = if trimmed.contains(['e', 'E']) {
        Decimal::from_scientific(trimmed)
    } else {
        Decimal::from_str(trimmed)
    }
    .map_err(|e| Error::pricing(format!("invalid price {:?}: {}", raw, e)))?;

    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(Error::pricing(format!("negative price {:?}", raw)));
    }

    amount
        .checked_mul(Decimal::from(NANOS_PER_USD))
        .map(|n| n.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero))
        .and_then(|n| n.to_u64())
        .ok_or_else(|| Error::pricing(format!("price {:?} is out of range", raw)))
}

/// Exact decimal rendering of a nano amount with trailing zeros removed.
pub fn format_usd_from_nanos_exact(nanos: u64) -> String {
    Decimal::from_i128_with_scale(nanos as i128, 9).normalize().to_string()
}

pub fn nanos_to_usd(nanos: u64) -> f64 {
    nanos as f64 / NANOS_PER_USD as f64
}

pub fn nanos_to_cents_ceil(nanos: u64) -> u64 {
    nanos / NANOS_PER_CENT + u64::from(nanos % NANOS_PER_CENT != 0)
}

pub fn nanos_to_cents_floor(nanos: u64) -> u64 {
    nanos / NANOS_PER_CENT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_exact() {
        assert_eq!(parse_usd_to_nanos("0.000015").unwrap(), 15_000);
        assert_eq!(parse_usd_to_nanos("2").unwrap(), 2_000_000_000);
        assert_eq!(parse_usd_to_nanos(" 0.1 ").unwrap(), 100_000_000);
        assert_eq!(parse_usd_to_nanos("0.000000001").unwrap(), 1);
        assert_eq!(parse_usd_to_nanos("0").unwrap(), 0);
    }

    #[test]
    fn test_parse_scientific() {
        assert_eq!(parse_usd_to_nanos("1.5e-6").unwrap(), 1_500);
        assert_eq!(parse_usd_to_nanos("3E-9").unwrap(), 3);
    }

    #[test]
    fn test_parse_rounds_sub_nano_digits() {
        assert_eq!(parse_usd_to_nanos("0.0000000015").unwrap(), 2);
        assert_eq!(parse_usd_to_nanos("0.0000000014").unwrap(), 1);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse_usd_to_nanos("").is_err());
        assert!(parse_usd_to_nanos("free").is_err());
        assert!(parse_usd_to_nanos("-0.01").is_err());
        assert!(parse_usd_to_nanos("99999999999999999999").is_err());
    }

    #[test]
    fn test_format() {
        assert_eq!(format_usd_from_nanos_exact(15_000), "0.000015");
        assert_eq!(format_usd_from_nanos_exact(30_000), "0.00003");
        assert_eq!(format_usd_from_nanos_exact(2_500_000_000), "2.5");
        assert_eq!(format_usd_from_nanos_exact(0), "0");
    }

    #[test]
    fn test_cent_rounding() {
        assert_eq!(nanos_to_cents_ceil(0), 0);
        assert_eq!(nanos_to_cents_ceil(1), 1);
        assert_eq!(nanos_to_cents_ceil(10_000_000), 1);
        assert_eq!(nanos_to_cents_ceil(10_000_001), 2);
        assert_eq!(nanos_to_cents_floor(19_999_999), 1);
        assert_eq!(nanos_to_cents_floor(9_999_999), 0);
    }
}
