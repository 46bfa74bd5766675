//! Decimal ⇄ minimal-unit conversion.
//!
//! All monetary arithmetic inside the proxy is exact integer math carried in
//! [`Decimal`] values that hold whole minimal units (satoshi, wei, drops).
//! Decimal strings only appear at the external boundary and in storage, and
//! every conversion for a given coin uses that coin's configured rounding.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Deserialize;
use std::str::FromStr;

use crate::error::{ProxyError, ProxyResult};

/// Rounding applied when a caller-supplied decimal has more fractional
/// digits than the coin carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Rounding {
    #[default]
    Truncate,
    HalfUp,
}

/// Largest supported coin precision. Keeps `10^decimals` comfortably inside
/// `Decimal`'s 96-bit mantissa.
pub const MAX_DECIMALS: u32 = 18;

fn factor(decimals: u32) -> Decimal {
    Decimal::from_i128_with_scale(10i128.pow(decimals), 0)
}

/// Parse a decimal string into whole minimal units.
///
/// Rejects negative values and garbage; excess precision is resolved by the
/// given rounding mode.
pub fn to_units(text: &str, decimals: u32, rounding: Rounding) -> ProxyResult<Decimal> {
    let value = Decimal::from_str(text.trim())
        .map_err(|_| ProxyError::InvalidAmount(format!("not a decimal number: {text}")))?;
    if value.is_sign_negative() {
        return Err(ProxyError::InvalidAmount(format!(
            "amount must not be negative: {text}"
        )));
    }
    let scaled = value * factor(decimals);
    let units = match rounding {
        Rounding::Truncate => scaled.trunc(),
        Rounding::HalfUp => {
            scaled.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        }
    };
    Ok(units.normalize())
}

/// Scale a value expressed in coin units (e.g. a daemon's float amount)
/// into whole minimal units, rounding away float fuzz.
pub fn scale_to_units(value: Decimal, decimals: u32) -> Decimal {
    (value * factor(decimals))
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .normalize()
}

/// Minimal units back to coin units, for daemons that speak decimals.
pub fn units_to_coins(units: Decimal, decimals: u32) -> Decimal {
    let mut value = units / factor(decimals);
    value.rescale(decimals);
    value
}

/// Render whole minimal units as a decimal string with exactly `decimals`
/// fractional digits (`5000` sat → `"0.00005000"`).
pub fn to_decimal_string(units: Decimal, decimals: u32) -> String {
    let mut value = units / factor(decimals);
    value.rescale(decimals);
    value.to_string()
}

/// Render minimal units as a plain integer string, the storage form.
pub fn to_unit_string(units: Decimal) -> String {
    units.normalize().to_string()
}

/// Parse the storage form back into minimal units.
pub fn from_unit_string(text: &str) -> ProxyResult<Decimal> {
    Decimal::from_str(text)
        .map_err(|_| ProxyError::MalformedResponse(format!("bad stored amount: {text}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_into_units() {
        assert_eq!(to_units("0.00005", 8, Rounding::Truncate).unwrap(), dec!(5000));
        assert_eq!(to_units("1", 6, Rounding::Truncate).unwrap(), dec!(1000000));
        assert_eq!(to_units("10.5", 6, Rounding::Truncate).unwrap(), dec!(10500000));
    }

    #[test]
    fn rounding_modes_differ() {
        // 0.0000015 BTC is 0.15 sat at 8 decimals
        assert_eq!(to_units("0.000000015", 8, Rounding::Truncate).unwrap(), dec!(1));
        assert_eq!(to_units("0.000000015", 8, Rounding::HalfUp).unwrap(), dec!(2));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(to_units("-1", 8, Rounding::Truncate).is_err());
        assert!(to_units("1.2.3", 8, Rounding::Truncate).is_err());
        assert!(to_units("", 8, Rounding::Truncate).is_err());
    }

    #[test]
    fn renders_fixed_width() {
        assert_eq!(to_decimal_string(dec!(5000), 8), "0.00005000");
        assert_eq!(to_decimal_string(dec!(0), 8), "0.00000000");
        assert_eq!(to_decimal_string(dec!(10000000), 6), "10.000000");
    }

    #[test]
    fn unit_string_round_trip() {
        let v = dec!(123456789);
        assert_eq!(from_unit_string(&to_unit_string(v)).unwrap(), v);
    }

    #[test]
    fn daemon_floats_scale_exactly() {
        // 0.00005 parsed from a daemon's float amount
        assert_eq!(scale_to_units(dec!(0.00005), 8), dec!(5000));
        // float fuzz one ulp off the true value still lands on the unit grid
        assert_eq!(scale_to_units(dec!(0.000049999999999999996), 8), dec!(5000));
        assert_eq!(units_to_coins(dec!(99500), 8), dec!(0.00099500));
    }
}
