//! Money Types
//!
//! All monetary amounts are carried as integer minor units (cents, pence)
//! together with an ISO 4217 currency code. Arithmetic is only defined
//! within a single currency; mixing currencies is a hard error, never a
//! silent coercion.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("currency mismatch: {left} vs {right}")]
    CurrencyMismatch { left: Currency, right: Currency },

    #[error("amount overflow")]
    Overflow,
}

/// ISO 4217 currency code (three uppercase letters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Currency(String);

impl Currency {
    pub fn new(code: &str) -> Self {
        Self(code.to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Currency {
    fn from(code: &str) -> Self {
        Self::new(code)
    }
}

/// A monetary amount in minor units of one currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub amount_minor: i64,
    pub currency: Currency,
}

impl Money {
    pub fn new(amount_minor: i64, currency: Currency) -> Self {
        Self {
            amount_minor,
            currency,
        }
    }

    pub fn zero(currency: Currency) -> Self {
        Self::new(0, currency)
    }

    pub fn is_zero(&self) -> bool {
        self.amount_minor == 0
    }

    pub fn is_positive(&self) -> bool {
        self.amount_minor > 0
    }

    pub fn is_negative(&self) -> bool {
        self.amount_minor < 0
    }

    pub fn abs(&self) -> Money {
        Money::new(self.amount_minor.abs(), self.currency.clone())
    }

    pub fn negate(&self) -> Money {
        Money::new(-self.amount_minor, self.currency.clone())
    }

    fn check_currency(&self, other: &Money) -> Result<(), MoneyError> {
        if self.currency != other.currency {
            return Err(MoneyError::CurrencyMismatch {
                left: self.currency.clone(),
                right: other.currency.clone(),
            });
        }
        Ok(())
    }

    pub fn add(&self, other: &Money) -> Result<Money, MoneyError> {
        self.check_currency(other)?;
        let sum = self
            .amount_minor
            .checked_add(other.amount_minor)
            .ok_or(MoneyError::Overflow)?;
        Ok(Money::new(sum, self.currency.clone()))
    }

    pub fn sub(&self, other: &Money) -> Result<Money, MoneyError> {
        self.check_currency(other)?;
        let diff = self
            .amount_minor
            .checked_sub(other.amount_minor)
            .ok_or(MoneyError::Overflow)?;
        Ok(Money::new(diff, self.currency.clone()))
    }

    /// Compare two amounts of the same currency. Ordering across
    /// currencies is undefined.
    pub fn compare(&self, other: &Money) -> Result<std::cmp::Ordering, MoneyError> {
        self.check_currency(other)?;
        Ok(self.amount_minor.cmp(&other.amount_minor))
    }

    /// Split into `parts` equal shares, distributing the remainder one
    /// minor unit at a time to the first `amount mod parts` shares so the
    /// allocation is deterministic and lossless.
    pub fn allocate(&self, parts: usize) -> Vec<Money> {
        if parts == 0 {
            return Vec::new();
        }

        let n = parts as i64;
        let base = self.amount_minor / n;
        let remainder = self.amount_minor % n;

        (0..n)
            .map(|i| {
                let extra = if i < remainder { 1 } else { 0 };
                Money::new(base + extra, self.currency.clone())
            })
            .collect()
    }

    /// Split proportionally to `ratios`; any rounding residue lands on
    /// the first share so the parts always sum to the whole.
    pub fn allocate_by_ratios(&self, ratios: &[i64]) -> Vec<Money> {
        let total: i64 = ratios.iter().sum();
        if ratios.is_empty() || total == 0 {
            return Vec::new();
        }

        let mut result: Vec<Money> = Vec::with_capacity(ratios.len());
        let mut allocated: i64 = 0;

        for ratio in ratios {
            let share = (self.amount_minor as i128 * *ratio as i128 / total as i128) as i64;
            allocated += share;
            result.push(Money::new(share, self.currency.clone()));
        }

        let residue = self.amount_minor - allocated;
        if residue != 0 {
            result[0].amount_minor += residue;
        }

        result
    }
}

/// Sum a sequence of same-currency amounts.
pub fn sum<'a, I>(amounts: I) -> Result<Option<Money>, MoneyError>
where
    I: IntoIterator<Item = &'a Money>,
{
    let mut iter = amounts.into_iter();
    let first = match iter.next() {
        Some(m) => m.clone(),
        None => return Ok(None),
    };

    let mut acc = first;
    for m in iter {
        acc = acc.add(m)?;
    }
    Ok(Some(acc))
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount_minor, self.currency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eur(amount: i64) -> Money {
        Money::new(amount, Currency::new("EUR"))
    }

    #[test]
    fn test_add_same_currency() {
        let total = eur(1000).add(&eur(250)).unwrap();
        assert_eq!(total, eur(1250));
    }

    #[test]
    fn test_add_currency_mismatch() {
        let result = eur(1000).add(&Money::new(1000, Currency::new("GBP")));
        assert!(matches!(result, Err(MoneyError::CurrencyMismatch { .. })));
    }

    #[test]
    fn test_sub_can_go_negative() {
        let diff = eur(100).sub(&eur(250)).unwrap();
        assert_eq!(diff.amount_minor, -150);
        assert!(diff.is_negative());
    }

    #[test]
    fn test_overflow_is_checked() {
        let result = eur(i64::MAX).add(&eur(1));
        assert_eq!(result, Err(MoneyError::Overflow));
    }

    #[test]
    fn test_allocate_distributes_remainder_to_first_parts() {
        let parts = eur(1001).allocate(3);
        assert_eq!(
            parts.iter().map(|m| m.amount_minor).collect::<Vec<_>>(),
            vec![334, 334, 333]
        );
        assert_eq!(parts.iter().map(|m| m.amount_minor).sum::<i64>(), 1001);
    }

    #[test]
    fn test_allocate_zero_parts() {
        assert!(eur(100).allocate(0).is_empty());
    }

    #[test]
    fn test_allocate_by_ratios_sums_to_whole() {
        let parts = eur(100).allocate_by_ratios(&[1, 2, 3]);
        assert_eq!(parts.iter().map(|m| m.amount_minor).sum::<i64>(), 100);
        assert_eq!(parts[1].amount_minor, 33);
        assert_eq!(parts[2].amount_minor, 50);
    }

    #[test]
    fn test_sum() {
        let amounts = vec![eur(1), eur(2), eur(3)];
        assert_eq!(sum(&amounts).unwrap(), Some(eur(6)));

        let empty: Vec<Money> = Vec::new();
        assert_eq!(sum(&empty).unwrap(), None);
    }

    #[test]
    fn test_currency_normalized_to_uppercase() {
        assert_eq!(Currency::new("eur").as_str(), "EUR");
    }

    #[test]
    fn test_serde_shape() {
        let json = serde_json::to_value(eur(2500)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"amount_minor": 2500, "currency": "EUR"})
        );
    }
}
