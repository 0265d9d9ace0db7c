//! Exact-decimal currency amounts.
//!
//! Amounts are stored as `rust_decimal::Decimal` quantized to cents. Binary
//! floating point never enters the computation, so sums over many rows do not
//! drift by a cent.

use core::fmt;
use core::str::FromStr;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Number of decimal places kept for currency amounts.
pub const CURRENCY_SCALE: u32 = 2;

/// Ten significant digits with two decimals, matching the amount columns.
pub const MAX_AMOUNT: Money = Money(Decimal::from_parts(1_410_065_407, 2, 0, false, CURRENCY_SCALE));

/// A currency amount with two decimal places.
///
/// Construction always rounds half-up (midpoint away from zero) to cents,
/// deserialization included. Arithmetic is checked: sums that would overflow
/// fail with a domain error instead of panicking.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(from = "Decimal", into = "Decimal")]
pub struct Money(Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);

    /// Quantize an arbitrary decimal to cents.
    pub fn new(amount: Decimal) -> Self {
        Self(amount.round_dp_with_strategy(CURRENCY_SCALE, RoundingStrategy::MidpointAwayFromZero))
    }

    pub fn from_cents(cents: i64) -> Self {
        Self(Decimal::new(cents, CURRENCY_SCALE))
    }

    pub fn amount(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_negative(&self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    /// Reject negative amounts; `what` names the field in the error.
    pub fn ensure_non_negative(self, what: &str) -> DomainResult<Self> {
        if self.is_negative() {
            return Err(DomainError::validation(format!(
                "{what} must not be negative (got {self})"
            )));
        }
        Ok(self)
    }

    /// Reject amounts outside `0..=MAX_AMOUNT`; `what` names the field.
    pub fn ensure_storable(self, what: &str) -> DomainResult<Self> {
        self.ensure_non_negative(what)?;
        if self > MAX_AMOUNT {
            return Err(DomainError::amount_out_of_range(format!(
                "{what} {self} exceeds {MAX_AMOUNT}"
            )));
        }
        Ok(self)
    }

    /// `max(0, self)`.
    pub fn clamp_to_zero(self) -> Self {
        self.max(Self::ZERO)
    }

    pub fn checked_add(self, rhs: Money) -> DomainResult<Money> {
        self.0
            .checked_add(rhs.0)
            .map(Money)
            .ok_or_else(|| DomainError::amount_out_of_range(format!("{self} + {rhs} overflows")))
    }

    pub fn checked_sub(self, rhs: Money) -> DomainResult<Money> {
        self.0
            .checked_sub(rhs.0)
            .map(Money)
            .ok_or_else(|| DomainError::amount_out_of_range(format!("{self} - {rhs} overflows")))
    }

    /// Sum of `amounts`, failing instead of overflowing.
    pub fn try_sum<I>(amounts: I) -> DomainResult<Money>
    where
        I: IntoIterator<Item = Money>,
    {
        amounts
            .into_iter()
            .try_fold(Money::ZERO, |acc, amount| acc.checked_add(amount))
    }
}

impl From<Decimal> for Money {
    fn from(value: Decimal) -> Self {
        Self::new(value)
    }
}

impl From<Money> for Decimal {
    fn from(value: Money) -> Self {
        value.0
    }
}

impl FromStr for Money {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let amount = Decimal::from_str_exact(s.trim())
            .map_err(|e| DomainError::validation(format!("invalid amount '{s}': {e}")))?;
        Ok(Self::new(amount))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut value = self.0;
        value.rescale(CURRENCY_SCALE);
        fmt::Display::fmt(&value, f)
    }
}
