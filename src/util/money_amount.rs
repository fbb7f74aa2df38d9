//! Human-readable price parsing and minor-unit conversion.
//!
//! [`MoneyAmount`] parses decimal price strings (`"0.05"`, `"$0.05"`,
//! `"1,000"`) into precise decimal values and scales them to an asset's
//! minor-unit integer representation. The conversion is exact integer
//! arithmetic on the decimal mantissa: a 6-decimal token price of `"0.05"`
//! becomes `50000`, and inputs with more precision than the token supports
//! are rejected instead of rounded.

use regex::Regex;
use rust_decimal::Decimal;
use std::fmt;
use std::fmt::Display;
use std::str::FromStr;

/// A parsed, non-negative monetary amount with decimal precision.
///
/// The original input precision is preserved: `"10.50"` has scale 2 and
/// mantissa 1050. Scaling to minor units multiplies the mantissa by
/// `10^(decimals - scale)` and never goes through floating point.
#[derive(Debug, Clone, PartialEq)]
pub struct MoneyAmount(Decimal);

/// Errors that can occur when parsing or scaling a monetary amount.
#[derive(Debug, thiserror::Error)]
pub enum MoneyAmountError {
    /// The input string could not be parsed as a number.
    #[error("Invalid number format")]
    InvalidFormat,
    /// The value is outside the allowed range.
    #[error(
        "Amount must be between {} and {}",
        constants::MIN_STR,
        constants::MAX_STR
    )]
    OutOfRange,
    /// Negative values are not allowed.
    #[error("Negative value is not allowed")]
    Negative,
    /// The input has more decimal places than the asset supports.
    #[error("Too big of a precision: {money} vs {asset} on asset")]
    WrongPrecision {
        /// Decimal places in the input.
        money: u32,
        /// Decimal places supported by the asset.
        asset: u32,
    },
}

mod constants {
    use super::*;
    use std::sync::LazyLock;

    pub const MIN_STR: &str = "0.000000001";
    pub const MAX_STR: &str = "999999999";

    pub static MIN: LazyLock<Decimal> =
        LazyLock::new(|| Decimal::from_str(MIN_STR).expect("valid decimal"));
    pub static MAX: LazyLock<Decimal> =
        LazyLock::new(|| Decimal::from_str(MAX_STR).expect("valid decimal"));
}

impl MoneyAmount {
    /// Parses a human-readable price string into a [`MoneyAmount`].
    ///
    /// Currency symbols, thousand separators, and whitespace are stripped
    /// before parsing. The result must be a non-negative number within the
    /// allowed range. `"0"` is accepted and marks a free resource.
    pub fn parse(input: &str) -> Result<Self, MoneyAmountError> {
        // Remove anything that isn't digit, dot, minus
        let cleaned = Regex::new(r"[^\d\.\-]+")
            .expect("valid regex")
            .replace_all(input, "")
            .to_string();

        let parsed = Decimal::from_str(&cleaned).map_err(|_| MoneyAmountError::InvalidFormat)?;

        if parsed.is_sign_negative() {
            return Err(MoneyAmountError::Negative);
        }

        if !parsed.is_zero() && (parsed < *constants::MIN || parsed > *constants::MAX) {
            return Err(MoneyAmountError::OutOfRange);
        }

        Ok(MoneyAmount(parsed))
    }

    /// Returns the number of decimal places in the original input.
    pub fn scale(&self) -> u32 {
        self.0.scale()
    }

    /// True when the amount is exactly zero.
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Scales the amount to the integer minor-unit representation of an
    /// asset with `decimals` decimal places.
    ///
    /// `"0.05"` with 6 decimals yields `50000`. The computation multiplies
    /// the decimal mantissa by `10^(decimals - scale)`; it fails if the
    /// input carries more precision than the asset supports.
    pub fn as_minor_units(&self, decimals: u32) -> Result<u128, MoneyAmountError> {
        let scale = self.0.scale();
        if scale > decimals {
            return Err(MoneyAmountError::WrongPrecision {
                money: scale,
                asset: decimals,
            });
        }
        let mantissa = self.0.mantissa().unsigned_abs();
        let factor = 10u128
            .checked_pow(decimals - scale)
            .ok_or(MoneyAmountError::OutOfRange)?;
        mantissa
            .checked_mul(factor)
            .ok_or(MoneyAmountError::OutOfRange)
    }
}

impl FromStr for MoneyAmount {
    type Err = MoneyAmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MoneyAmount::parse(s)
    }
}

impl TryFrom<&str> for MoneyAmount {
    type Error = MoneyAmountError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        MoneyAmount::from_str(value)
    }
}

impl Display for MoneyAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.normalize())
    }
}

impl serde::Serialize for MoneyAmount {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for MoneyAmount {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        MoneyAmount::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_symbol_prefixed() {
        let plain = MoneyAmount::parse("0.05").unwrap();
        let dollar = MoneyAmount::parse("$0.05").unwrap();
        assert_eq!(plain, dollar);
        assert_eq!(plain.scale(), 2);
    }

    #[test]
    fn scales_to_six_decimal_minor_units() {
        let amount = MoneyAmount::parse("0.05").unwrap();
        assert_eq!(amount.as_minor_units(6).unwrap(), 50_000);
    }

    #[test]
    fn scaling_is_exact_for_awkward_decimals() {
        // 0.1 has no exact binary floating point representation; the
        // decimal path must still produce the exact integer.
        let amount = MoneyAmount::parse("0.1").unwrap();
        assert_eq!(amount.as_minor_units(6).unwrap(), 100_000);
        let amount = MoneyAmount::parse("19.99").unwrap();
        assert_eq!(amount.as_minor_units(6).unwrap(), 19_990_000);
    }

    #[test]
    fn rejects_precision_beyond_asset_decimals() {
        let amount = MoneyAmount::parse("0.0000001").unwrap();
        assert!(matches!(
            amount.as_minor_units(6),
            Err(MoneyAmountError::WrongPrecision { money: 7, asset: 6 })
        ));
    }

    #[test]
    fn zero_is_allowed_and_scales_to_zero() {
        let amount = MoneyAmount::parse("0").unwrap();
        assert!(amount.is_zero());
        assert_eq!(amount.as_minor_units(6).unwrap(), 0);
    }

    #[test]
    fn rejects_negative_and_garbage() {
        assert!(matches!(
            MoneyAmount::parse("-1"),
            Err(MoneyAmountError::Negative)
        ));
        assert!(matches!(
            MoneyAmount::parse("abc"),
            Err(MoneyAmountError::InvalidFormat)
        ));
    }
}
