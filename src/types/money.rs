//! Money utilities for the settlement ledger
//!
//! Every amount the ledger stores is an integer number of minor units
//! (`Cents`) tagged with a [`Currency`]. Decimal values only appear at the
//! edges: amounts typed by a person in major units, and formatted output.

use super::error::LedgerError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Integer amount in the currency's minor unit
pub type Cents = i64;

/// Currencies the ledger can settle in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Currency {
    #[default]
    Usd,
    Eur,
    Gbp,
    Cad,
    Aud,
    Jpy,
    Krw,
}

impl Currency {
    /// Currencies without a minor unit (1 yen is the smallest amount)
    pub fn is_single_unit(self) -> bool {
        matches!(self, Currency::Jpy | Currency::Krw)
    }

    /// Number of decimal places between major and minor units
    pub fn minor_unit_exponent(self) -> u32 {
        if self.is_single_unit() {
            0
        } else {
            2
        }
    }

    /// Convert an amount in major units to minor units
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::InvalidAmount` if the amount is negative, has
    /// more precision than the currency's minor unit, or does not fit in
    /// an `i64`.
    pub fn to_cents(self, amount: Decimal) -> Result<Cents, LedgerError> {
        if amount.is_sign_negative() && !amount.is_zero() {
            return Err(LedgerError::invalid_amount(&amount.to_string()));
        }

        let scaled = amount
            .checked_mul(Decimal::from(10_i64.pow(self.minor_unit_exponent())))
            .ok_or_else(|| LedgerError::invalid_amount(&amount.to_string()))?;

        if !scaled.fract().is_zero() {
            return Err(LedgerError::invalid_amount(&amount.to_string()));
        }

        i64::try_from(scaled.trunc()).map_err(|_| LedgerError::invalid_amount(&amount.to_string()))
    }

    /// Render minor units as a fixed-point major-unit string
    pub fn format_cents(self, cents: Cents) -> String {
        let exponent = self.minor_unit_exponent();
        let value = Decimal::new(cents, exponent);
        format!("{:.*}", exponent as usize, value)
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            Currency::Usd => "usd",
            Currency::Eur => "eur",
            Currency::Gbp => "gbp",
            Currency::Cad => "cad",
            Currency::Aud => "aud",
            Currency::Jpy => "jpy",
            Currency::Krw => "krw",
        };
        f.write_str(code)
    }
}

impl FromStr for Currency {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "usd" => Ok(Currency::Usd),
            "eur" => Ok(Currency::Eur),
            "gbp" => Ok(Currency::Gbp),
            "cad" => Ok(Currency::Cad),
            "aud" => Ok(Currency::Aud),
            "jpy" => Ok(Currency::Jpy),
            "krw" => Ok(Currency::Krw),
            other => Err(LedgerError::unknown_currency(other)),
        }
    }
}

/// An amount tagged with its currency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub currency: Currency,
    pub cents: Cents,
}

impl Money {
    pub fn new(currency: Currency, cents: Cents) -> Self {
        Money { currency, cents }
    }
}

/// `floor(amount * numerator / denominator)` without intermediate overflow
///
/// Ledger shares (tax portions, fee reversals) always round toward negative
/// infinity so the platform never returns more than it collected. A zero
/// denominator yields zero.
pub fn floor_share(amount: Cents, numerator: Cents, denominator: Cents) -> Cents {
    if denominator == 0 {
        return 0;
    }

    let product = i128::from(amount) * i128::from(numerator);
    let quotient = product.div_euclid(i128::from(denominator));
    let quotient = if denominator < 0 && product.rem_euclid(i128::from(denominator)) != 0 {
        quotient - 1
    } else {
        quotient
    };

    i64::try_from(quotient).unwrap_or(if quotient.is_negative() { i64::MIN } else { i64::MAX })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::whole_dollars(Currency::Usd, Decimal::new(50, 0), 5000)]
    #[case::two_places(Currency::Usd, Decimal::new(1999, 2), 1999)]
    #[case::one_place(Currency::Eur, Decimal::new(15, 1), 150)]
    #[case::zero(Currency::Gbp, Decimal::ZERO, 0)]
    #[case::single_unit(Currency::Jpy, Decimal::new(1200, 0), 1200)]
    fn test_to_cents(#[case] currency: Currency, #[case] amount: Decimal, #[case] expected: Cents) {
        assert_eq!(currency.to_cents(amount), Ok(expected));
    }

    #[rstest]
    #[case::negative(Currency::Usd, Decimal::new(-100, 2))]
    #[case::sub_cent(Currency::Usd, Decimal::new(12345, 3))]
    #[case::fractional_yen(Currency::Jpy, Decimal::new(15, 1))]
    fn test_to_cents_rejects(#[case] currency: Currency, #[case] amount: Decimal) {
        assert!(matches!(
            currency.to_cents(amount),
            Err(LedgerError::InvalidAmount { .. })
        ));
    }

    #[rstest]
    #[case(Currency::Usd, 5000, "50.00")]
    #[case(Currency::Usd, 7, "0.07")]
    #[case(Currency::Jpy, 1200, "1200")]
    fn test_format_cents(#[case] currency: Currency, #[case] cents: Cents, #[case] expected: &str) {
        assert_eq!(currency.format_cents(cents), expected);
    }

    #[rstest]
    #[case::exact(100, 50, 100, 50)]
    #[case::floors_down(5000, 823, 10822, 380)]
    #[case::never_rounds_up(1, 2, 3, 0)]
    #[case::zero_denominator(100, 5, 0, 0)]
    #[case::large_values(i64::MAX / 2, 2, 2, i64::MAX / 2)]
    fn test_floor_share(
        #[case] amount: Cents,
        #[case] numerator: Cents,
        #[case] denominator: Cents,
        #[case] expected: Cents,
    ) {
        assert_eq!(floor_share(amount, numerator, denominator), expected);
    }

    #[test]
    fn test_currency_round_trips_through_str() {
        assert_eq!("EUR".parse::<Currency>(), Ok(Currency::Eur));
        assert_eq!(Currency::Krw.to_string(), "krw");
        assert!("xyz".parse::<Currency>().is_err());
    }
}
