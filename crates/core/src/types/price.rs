//! Exact money representation in integer minor currency units.
//!
//! Every amount that takes part in a transaction is a [`Money`]: an `i64`
//! count of minor units (cents for USD) plus an ISO 4217 currency. Two
//! amounts are equal only if both the currency and the unit count match,
//! which is what the order reconciler relies on when it compares a captured
//! payment against the live cart total.

use core::fmt;
use core::str::FromStr;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when constructing or combining [`Money`] values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MoneyError {
    /// The currency code is not supported.
    #[error("unsupported currency: {0}")]
    UnsupportedCurrency(String),
    /// The decimal amount has more precision than the currency's minor unit.
    #[error("amount {amount} has sub-minor-unit precision for {currency}")]
    SubMinorPrecision {
        /// The offending amount.
        amount: String,
        /// The currency.
        currency: CurrencyCode,
    },
    /// The amount does not fit in an `i64` count of minor units.
    #[error("amount out of range")]
    Overflow,
    /// The operation mixed two currencies.
    #[error("currency mismatch: {left} vs {right}")]
    CurrencyMismatch {
        /// Currency of the left operand.
        left: CurrencyCode,
        /// Currency of the right operand.
        right: CurrencyCode,
    },
    /// A negative amount where only non-negative amounts are meaningful.
    #[error("amount must not be negative")]
    Negative,
}

/// ISO 4217 currency codes accepted by the storefront.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum CurrencyCode {
    #[default]
    USD,
    CAD,
    EUR,
    GBP,
    AUD,
    JPY,
}

impl CurrencyCode {
    /// Number of decimal places in the currency's minor unit.
    #[must_use]
    pub const fn exponent(self) -> u32 {
        match self {
            Self::JPY => 0,
            Self::USD | Self::CAD | Self::EUR | Self::GBP | Self::AUD => 2,
        }
    }

    /// Upper-case ISO code (e.g. `"USD"`).
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::USD => "USD",
            Self::CAD => "CAD",
            Self::EUR => "EUR",
            Self::GBP => "GBP",
            Self::AUD => "AUD",
            Self::JPY => "JPY",
        }
    }

    /// Lower-case ISO code, the form payment processors expect.
    #[must_use]
    pub fn lowercase(self) -> String {
        self.code().to_ascii_lowercase()
    }

    /// Display symbol.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::USD | Self::CAD | Self::AUD => "$",
            Self::EUR => "€",
            Self::GBP => "£",
            Self::JPY => "¥",
        }
    }
}

impl fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for CurrencyCode {
    type Err = MoneyError;

    /// Parse a currency code case-insensitively (`"usd"` and `"USD"` both work).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "USD" => Ok(Self::USD),
            "CAD" => Ok(Self::CAD),
            "EUR" => Ok(Self::EUR),
            "GBP" => Ok(Self::GBP),
            "AUD" => Ok(Self::AUD),
            "JPY" => Ok(Self::JPY),
            other => Err(MoneyError::UnsupportedCurrency(other.to_string())),
        }
    }
}

/// An amount of money in integer minor units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    /// Amount in the smallest currency unit (e.g., cents for USD).
    pub minor_units: i64,
    /// ISO 4217 currency code.
    pub currency: CurrencyCode,
}

impl Money {
    /// Create an amount from a count of minor units.
    #[must_use]
    pub const fn from_minor(minor_units: i64, currency: CurrencyCode) -> Self {
        Self {
            minor_units,
            currency,
        }
    }

    /// Zero in the given currency.
    #[must_use]
    pub const fn zero(currency: CurrencyCode) -> Self {
        Self::from_minor(0, currency)
    }

    /// Convert a major-unit decimal amount (e.g. `49.99`) into minor units.
    ///
    /// The conversion is exact: an amount with more decimal places than the
    /// currency allows is rejected rather than rounded.
    ///
    /// # Errors
    ///
    /// Returns `SubMinorPrecision` for fractional minor units and `Overflow`
    /// if the result does not fit in an `i64`.
    pub fn from_decimal(amount: Decimal, currency: CurrencyCode) -> Result<Self, MoneyError> {
        let scale = Decimal::from(10_i64.pow(currency.exponent()));
        let minor = amount.checked_mul(scale).ok_or(MoneyError::Overflow)?;

        if !minor.fract().is_zero() {
            return Err(MoneyError::SubMinorPrecision {
                amount: amount.to_string(),
                currency,
            });
        }

        let minor_units = minor.trunc().to_i64().ok_or(MoneyError::Overflow)?;
        Ok(Self::from_minor(minor_units, currency))
    }

    /// Convert back to a major-unit decimal.
    #[must_use]
    pub fn to_decimal(self) -> Decimal {
        Decimal::new(self.minor_units, self.currency.exponent())
    }

    /// Add two amounts of the same currency.
    ///
    /// # Errors
    ///
    /// Returns `CurrencyMismatch` or `Overflow`.
    pub fn checked_add(self, other: Self) -> Result<Self, MoneyError> {
        self.ensure_same_currency(other)?;
        let minor_units = self
            .minor_units
            .checked_add(other.minor_units)
            .ok_or(MoneyError::Overflow)?;
        Ok(Self::from_minor(minor_units, self.currency))
    }

    /// Multiply by a quantity.
    ///
    /// # Errors
    ///
    /// Returns `Overflow` if the product does not fit.
    pub fn checked_mul(self, quantity: u32) -> Result<Self, MoneyError> {
        let minor_units = self
            .minor_units
            .checked_mul(i64::from(quantity))
            .ok_or(MoneyError::Overflow)?;
        Ok(Self::from_minor(minor_units, self.currency))
    }

    /// Signed difference `self - other` in minor units.
    ///
    /// # Errors
    ///
    /// Returns `CurrencyMismatch` if the currencies differ.
    pub fn difference(self, other: Self) -> Result<i64, MoneyError> {
        self.ensure_same_currency(other)?;
        self.minor_units
            .checked_sub(other.minor_units)
            .ok_or(MoneyError::Overflow)
    }

    /// Whether the amount is below zero.
    #[must_use]
    pub const fn is_negative(self) -> bool {
        self.minor_units < 0
    }

    fn ensure_same_currency(self, other: Self) -> Result<(), MoneyError> {
        if self.currency == other.currency {
            Ok(())
        } else {
            Err(MoneyError::CurrencyMismatch {
                left: self.currency,
                right: other.currency,
            })
        }
    }

    /// Format for display (e.g., "$19.99").
    #[must_use]
    pub fn display(self) -> String {
        let decimal = self.to_decimal();
        let places = self.currency.exponent() as usize;
        format!("{}{decimal:.places$}", self.currency.symbol())
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.to_decimal(), self.currency)
    }
}
