//! Fixed-point price-ratio arithmetic over arbitrary-precision integers.
//!
//! Ratios and growth figures stay in integer form end to end; conversion
//! to a machine double happens only at the display boundary, and only
//! when the magnitude fits safely.

use std::fmt;
use std::str::FromStr;

use num_bigint::BigInt;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Fixed scale applied to the out/in ratio: 10^12.
pub const SCALE_DECIMALS: u32 = 12;

/// Growth clamp in basis points: ±1,000,000.00 % on illiquid routes.
pub const GROWTH_CLAMP_BPS: i64 = 100_000_000;

fn scale() -> BigInt {
    BigInt::from(1_000_000_000_000u64)
}

/// An `(amount_out / amount_in) * SCALE` price ratio. Stored and compared
/// as an integer; serialized as a decimal string to survive transport
/// without precision loss.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ScaledRatio(pub BigInt);

impl ScaledRatio {
    /// Computes `(amount_out * SCALE) / amount_in`. Returns `None` when
    /// `amount_in` is zero.
    pub fn compute(amount_in: u64, amount_out: u64) -> Option<Self> {
        if amount_in == 0 {
            return None;
        }

        let ratio = (BigInt::from(amount_out) * scale()) / BigInt::from(amount_in);
        Some(Self(ratio))
    }
}

impl fmt::Display for ScaledRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ScaledRatio {
    type Err = num_bigint::ParseBigIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(BigInt::from_str(s)?))
    }
}

impl Serialize for ScaledRatio {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for ScaledRatio {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Growth between two ratios in basis points: `((last - base) * 10000) /
/// base`, clamped to ±`GROWTH_CLAMP_BPS`. Returns `None` when `base` is
/// not positive.
pub fn growth_bps(base: &ScaledRatio, last: &ScaledRatio) -> Option<BigInt> {
    if base.0 <= BigInt::from(0) {
        return None;
    }

    let raw = ((&last.0 - &base.0) * BigInt::from(10_000)) / &base.0;
    Some(raw.clamp(
        BigInt::from(-GROWTH_CLAMP_BPS),
        BigInt::from(GROWTH_CLAMP_BPS),
    ))
}

/// Growth as a display percentage. Only for UI rendering; the clamp on
/// `growth_bps` keeps the result inside ±1,000,000.
pub fn growth_percent(base: &ScaledRatio, last: &ScaledRatio) -> Option<f64> {
    let bps = growth_bps(base, last)?;
    // Clamped bps always fits an i64.
    let bps = i64::try_from(bps).ok()?;
    Some(bps as f64 / 100.0)
}

/// Converts an integer figure to a display double, refusing magnitudes a
/// double cannot represent exactly.
pub fn to_display_f64(value: &BigInt) -> Option<f64> {
    const MAX_SAFE: i128 = 1 << 53;

    let v = i128::try_from(value.clone()).ok()?;
    if v.abs() > MAX_SAFE {
        return None;
    }
    Some(v as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_is_deterministic() {
        let a = ScaledRatio::compute(10_000_000, 123_456_789).unwrap();
        let b = ScaledRatio::compute(10_000_000, 123_456_789).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn zero_input_yields_none() {
        assert!(ScaledRatio::compute(0, 42).is_none());
    }

    #[test]
    fn growth_of_equal_ratios_is_zero() {
        let r = ScaledRatio::compute(5_000, 7_500).unwrap();
        assert_eq!(growth_bps(&r, &r).unwrap(), BigInt::from(0));
        assert_eq!(growth_percent(&r, &r).unwrap(), 0.0);
    }

    #[test]
    fn growth_requires_positive_base() {
        let zero = ScaledRatio(BigInt::from(0));
        let neg = ScaledRatio(BigInt::from(-10));
        let r = ScaledRatio::compute(1, 2).unwrap();
        assert!(growth_bps(&zero, &r).is_none());
        assert!(growth_bps(&neg, &r).is_none());
    }

    #[test]
    fn doubling_is_ten_thousand_bps() {
        let base = ScaledRatio::compute(1_000, 2_000).unwrap();
        let last = ScaledRatio::compute(1_000, 4_000).unwrap();
        assert_eq!(growth_bps(&base, &last).unwrap(), BigInt::from(10_000));
        assert_eq!(growth_percent(&base, &last).unwrap(), 100.0);
    }

    #[test]
    fn growth_percent_is_clamped() {
        // A ratio exploding by far more than the clamp on an illiquid route.
        let base = ScaledRatio::compute(1_000_000_000, 1).unwrap();
        let last = ScaledRatio::compute(1, 1_000_000_000).unwrap();
        assert_eq!(
            growth_bps(&base, &last).unwrap(),
            BigInt::from(GROWTH_CLAMP_BPS)
        );
        assert_eq!(growth_percent(&base, &last).unwrap(), 1_000_000.0);

        // The negative clamp binds symmetrically.
        let tiny_base = ScaledRatio(BigInt::from(1));
        let crashed = ScaledRatio(BigInt::from(-20_000_000_000i64));
        assert_eq!(
            growth_bps(&tiny_base, &crashed).unwrap(),
            BigInt::from(-GROWTH_CLAMP_BPS)
        );
        assert_eq!(growth_percent(&tiny_base, &crashed).unwrap(), -1_000_000.0);
    }

    #[test]
    fn full_collapse_is_minus_one_hundred_percent() {
        let base = ScaledRatio::compute(1_000, 2_000).unwrap();
        let dead = ScaledRatio(BigInt::from(0));
        assert_eq!(growth_percent(&base, &dead).unwrap(), -100.0);
    }

    #[test]
    fn serializes_as_decimal_string() {
        let r = ScaledRatio::compute(10_000_000, 123_456_789).unwrap();
        let json = serde_json::to_string(&r).unwrap();
        let back: ScaledRatio = serde_json::from_str(&json).unwrap();
        assert_eq!(r, back);
        assert!(json.starts_with('"') && json.ends_with('"'));
    }

    #[test]
    fn display_conversion_refuses_unsafe_magnitudes() {
        let safe = BigInt::from(9_007_199_254_740_992i64); // 2^53
        assert!(to_display_f64(&safe).is_some());

        let unsafe_value = BigInt::from(9_007_199_254_740_993i64);
        assert!(to_display_f64(&unsafe_value).is_none());
    }
}
