//! Exact fixed-point money.
//!
//! Amounts are held as signed minor units (cents, [`SCALE`] = 2) and stored
//! in SQLite as plain `INTEGER`s, so `SUM()` over a ledger column is exact.
//! [`rust_decimal::Decimal`] is only used at the boundary: parsing client
//! input and rendering `"25.00"`-style strings.

use std::fmt;
use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::{EscrowError, Result};

/// Number of decimal places carried by every amount.
pub const SCALE: u32 = 2;

const MINOR_PER_UNIT: i64 = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, sqlx::Type)]
#[sqlx(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_minor(minor: i64) -> Self {
        Money(minor)
    }

    pub const fn minor(self) -> i64 {
        self.0
    }

    /// Convert a decimal, rejecting anything finer than a cent.
    pub fn from_decimal(value: Decimal) -> Result<Self> {
        let value = value.normalize();
        if value.scale() > SCALE {
            return Err(EscrowError::Validation(format!(
                "amount {value} has more than {SCALE} decimal places"
            )));
        }
        (value * Decimal::from(MINOR_PER_UNIT))
            .to_i64()
            .map(Money)
            .ok_or_else(|| EscrowError::Validation(format!("amount {value} is out of range")))
    }

    pub fn to_decimal(self) -> Decimal {
        Decimal::new(self.0, SCALE)
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }

    pub fn checked_sub(self, other: Money) -> Option<Money> {
        self.0.checked_sub(other.0).map(Money)
    }

    /// `self × quantity`, `None` on overflow.
    pub fn checked_mul(self, quantity: i64) -> Option<Money> {
        self.0.checked_mul(quantity).map(Money)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_decimal())
    }
}

impl FromStr for Money {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self> {
        let value = Decimal::from_str(s.trim())
            .map_err(|e| EscrowError::Validation(format!("invalid amount {s:?}: {e}")))?;
        Money::from_decimal(value)
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(&self.to_decimal())
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = <Decimal as Deserialize>::deserialize(deserializer)?;
        Money::from_decimal(value).map_err(serde::de::Error::custom)
    }
}
