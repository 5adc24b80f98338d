//! Money amounts, cent rounding and the processor minimum-charge policy.
//!
//! All checkout arithmetic is done with [`Decimal`] in the cart's currency.
//! Intermediate figures (discounts, tax) are rounded to cents; the final
//! charge is only touched by [`MinimumCharge`].

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Deserializer, Serialize, de};

/// Smallest non-zero amount the funded rails can move.
///
/// Applied uniformly to every code path that produces a charge.
pub const PROCESSOR_MINIMUM: Decimal = Decimal::from_parts(25, 0, 0, false, 2);

/// Tolerance used when comparing two cart-level money figures.
pub const CENT: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// Default ISO currency code for carts that do not specify one.
pub const DEFAULT_CURRENCY: &str = "USD";

/// Rounds a money figure to two decimal places, half away from zero.
#[must_use]
pub fn round_cents(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Returns `true` when two amounts differ by no more than one cent.
#[must_use]
pub fn within_cent(a: Decimal, b: Decimal) -> bool {
    (a - b).abs() <= CENT
}

/// Which family of rails may settle a given charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChargeRail {
    /// Zero-value charge, proven by a signed claim instead of a transfer.
    SignatureClaim,
    /// Non-zero charge, settled by moving funds (direct transfer or aggregator).
    Funded,
}

/// Final amount to collect, after the minimum-charge policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Charge {
    /// Amount to collect.
    pub amount: Decimal,
    /// Rail family the amount must be routed to.
    pub rail: ChargeRail,
}

impl Charge {
    /// Returns `true` for a zero-value charge.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }
}

/// Payment-processor floor handling.
///
/// | Pre-rounding total | Final charge | Rail |
/// |---|---|---|
/// | `= 0` | `0` | Signature Claim |
/// | `(0, minimum)` | `minimum` | funded |
/// | `>= minimum` | unrounded | funded |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinimumCharge {
    minimum: Decimal,
}

impl Default for MinimumCharge {
    fn default() -> Self {
        Self {
            minimum: PROCESSOR_MINIMUM,
        }
    }
}

impl MinimumCharge {
    /// Returns the configured floor.
    #[must_use]
    pub const fn minimum(&self) -> Decimal {
        self.minimum
    }

    /// Applies the policy to a pre-rounding total.
    ///
    /// Negative totals are treated as zero. Applying the policy to its own
    /// output yields the same charge.
    #[must_use]
    pub fn apply(&self, total: Decimal) -> Charge {
        let total = total.max(Decimal::ZERO);
        if total.is_zero() {
            Charge {
                amount: Decimal::ZERO,
                rail: ChargeRail::SignatureClaim,
            }
        } else if total < self.minimum {
            Charge {
                amount: self.minimum,
                rail: ChargeRail::Funded,
            }
        } else {
            Charge {
                amount: total,
                rail: ChargeRail::Funded,
            }
        }
    }
}

/// Error returned when a money string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MoneyParseError {
    /// The input was empty after trimming symbols and separators.
    #[error("empty money string")]
    Empty,
    /// The input was not a decimal number.
    #[error("invalid money string: {0}")]
    Invalid(String),
    /// Negative amounts are not valid prices.
    #[error("negative money amount: {0}")]
    Negative(String),
}

/// A non-negative money amount parsed from a human-readable string.
///
/// Accepts a leading `$`, thousands separators and surrounding whitespace,
/// e.g. `"$1,299.50"`, `"0.25"`, `" 3 "`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MoneyAmount(pub Decimal);

impl FromStr for MoneyAmount {
    type Err = MoneyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned: String = s
            .trim()
            .trim_start_matches('$')
            .chars()
            .filter(|c| *c != ',' && !c.is_whitespace())
            .collect();
        if cleaned.is_empty() {
            return Err(MoneyParseError::Empty);
        }
        let value = Decimal::from_str(&cleaned)
            .map_err(|_| MoneyParseError::Invalid(s.to_owned()))?;
        if value.is_sign_negative() && !value.is_zero() {
            return Err(MoneyParseError::Negative(s.to_owned()));
        }
        Ok(Self(value))
    }
}

impl Display for MoneyAmount {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", round_cents(self.0))
    }
}

impl From<MoneyAmount> for Decimal {
    fn from(value: MoneyAmount) -> Self {
        value.0
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawMoney {
    Text(String),
    Number(Decimal),
}

impl RawMoney {
    fn into_decimal<E: de::Error>(self) -> Result<Decimal, E> {
        match self {
            Self::Text(text) => text.parse::<MoneyAmount>().map(Decimal::from).map_err(E::custom),
            Self::Number(value) => Ok(value),
        }
    }
}

/// Deserializes a money figure sent either as a JSON number or as a string
/// such as `"$5.00"`.
///
/// # Errors
///
/// Fails for strings [`MoneyAmount`] rejects.
pub fn deserialize_money<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Decimal, D::Error> {
    RawMoney::deserialize(deserializer)?.into_decimal()
}

/// Optional variant of [`deserialize_money`]; pair with `#[serde(default)]`.
///
/// # Errors
///
/// Fails for strings [`MoneyAmount`] rejects.
pub fn deserialize_money_opt<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Decimal>, D::Error> {
    Option::<RawMoney>::deserialize(deserializer)?
        .map(RawMoney::into_decimal)
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn zero_total_routes_to_signature_claim() {
        let charge = MinimumCharge::default().apply(Decimal::ZERO);
        assert_eq!(charge.amount, Decimal::ZERO);
        assert_eq!(charge.rail, ChargeRail::SignatureClaim);
    }

    #[test]
    fn sub_minimum_total_is_raised_to_minimum() {
        let charge = MinimumCharge::default().apply(dec!(0.10));
        assert_eq!(charge.amount, dec!(0.25));
        assert_eq!(charge.rail, ChargeRail::Funded);
    }

    #[test]
    fn totals_at_or_above_minimum_are_unrounded() {
        let policy = MinimumCharge::default();
        assert_eq!(policy.apply(dec!(0.25)).amount, dec!(0.25));
        assert_eq!(policy.apply(dec!(3.1849)).amount, dec!(3.1849));
    }

    #[test]
    fn negative_totals_clamp_to_zero() {
        let charge = MinimumCharge::default().apply(dec!(-4.00));
        assert!(charge.is_zero());
        assert_eq!(charge.rail, ChargeRail::SignatureClaim);
    }

    #[test]
    fn policy_is_idempotent() {
        let policy = MinimumCharge::default();
        for total in [dec!(0), dec!(0.01), dec!(0.24), dec!(0.25), dec!(44.60), dec!(-1)] {
            let once = policy.apply(total);
            let twice = policy.apply(once.amount);
            assert_eq!(once, twice, "policy not idempotent for {total}");
        }
    }

    #[test]
    fn round_cents_rounds_half_away_from_zero() {
        assert_eq!(round_cents(dec!(1.005)), dec!(1.01));
        assert_eq!(round_cents(dec!(1.004)), dec!(1.00));
        assert_eq!(round_cents(dec!(-1.005)), dec!(-1.01));
    }

    #[test]
    fn within_cent_tolerance() {
        assert!(within_cent(dec!(10.00), dec!(9.99)));
        assert!(!within_cent(dec!(10.00), dec!(9.98)));
    }

    #[test]
    fn parse_money_strings() {
        let amount: MoneyAmount = "$1,299.50".parse().unwrap();
        assert_eq!(amount.0, dec!(1299.50));
        let amount: MoneyAmount = " 3 ".parse().unwrap();
        assert_eq!(amount.0, dec!(3));
        assert_eq!("".parse::<MoneyAmount>(), Err(MoneyParseError::Empty));
        assert!(matches!("-2".parse::<MoneyAmount>(), Err(MoneyParseError::Negative(_))));
        assert!(matches!("abc".parse::<MoneyAmount>(), Err(MoneyParseError::Invalid(_))));
    }

    #[derive(Debug, Deserialize)]
    struct Priced {
        #[serde(deserialize_with = "deserialize_money")]
        price: Decimal,
        #[serde(default, deserialize_with = "deserialize_money_opt")]
        balance: Option<Decimal>,
    }

    #[test]
    fn backend_figures_accept_numbers_and_strings() {
        let priced: Priced = serde_json::from_str(r#"{"price": "$1,250.00", "balance": 7.5}"#).unwrap();
        assert_eq!(priced.price, dec!(1250.00));
        assert_eq!(priced.balance, Some(dec!(7.5)));

        let priced: Priced = serde_json::from_str(r#"{"price": 4}"#).unwrap();
        assert_eq!(priced.price, dec!(4));
        assert!(priced.balance.is_none());

        assert!(serde_json::from_str::<Priced>(r#"{"price": "-3"}"#).is_err());
    }
}
