use rust_decimal::{Decimal, prelude::Zero};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("Amount must be greater than zero, got {amount}")]
    InvalidAmount { amount: Decimal },
    #[error("Insufficient funds: balance {balance} cannot cover {amount}")]
    InsufficientFunds { balance: Decimal, amount: Decimal },
    #[error("Balance {balance} cannot absorb {amount} without overflowing")]
    Overflow { balance: Decimal, amount: Decimal },
}

/// Decides whether `amount` may leave an account holding `balance`.
///
/// Runs before any mutation; nothing is written when it rejects.
pub fn validate(balance: Decimal, amount: Decimal) -> Result<(), InvariantViolation> {
    if amount <= Decimal::zero() {
        return Err(InvariantViolation::InvalidAmount { amount });
    }
    if balance < amount {
        return Err(InvariantViolation::InsufficientFunds { balance, amount });
    }
    Ok(())
}
