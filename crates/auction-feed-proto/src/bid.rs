use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A bid amount that has passed local validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BidAmount(i64);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BidValidationError {
    #[error("bid amount is missing")]
    Missing,
    #[error("bid amount {0:?} is not a whole number")]
    NotANumber(String),
    #[error("bid amount must be positive, got {0}")]
    NotPositive(i64),
}

impl BidAmount {
    pub fn new(amount: i64) -> Result<Self, BidValidationError> {
        if amount <= 0 {
            return Err(BidValidationError::NotPositive(amount));
        }
        Ok(Self(amount))
    }

    /// Parses operator input. Blank input counts as an absent amount.
    pub fn parse(input: &str) -> Result<Self, BidValidationError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(BidValidationError::Missing);
        }
        let amount: i64 = trimmed
            .parse()
            .map_err(|_| BidValidationError::NotANumber(trimmed.to_string()))?;
        Self::new(amount)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl TryFrom<i64> for BidAmount {
    type Error = BidValidationError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}
