use std::fmt;

use rust_decimal::{Decimal, prelude::Zero};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    audit::Audit,
    invariant::{self, InvariantViolation},
    transaction::TransactionId,
};

/// Optimistic concurrency token. Every committed write bumps it by one.
pub type Version = u64;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CustomerId(String);

impl CustomerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for CustomerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CustomerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// What a posting does to a balance and why.
///
/// Withdrawals and clawbacks take money out; deposits and refunds put it in.
/// They are kept apart so the overdraft policy can treat a clawback
/// differently from a sender spending their own funds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostingKind {
    Withdrawal,
    Deposit,
    Refund,
    Clawback,
}

impl PostingKind {
    pub fn is_debit(self) -> bool {
        matches!(self, PostingKind::Withdrawal | PostingKind::Clawback)
    }
}

/// A balance movement requested against one customer on behalf of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posting {
    pub customer_id: CustomerId,
    pub transaction_id: TransactionId,
    pub kind: PostingKind,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceEventKind {
    Debited,
    Credited,
}

/// `balance` is the balance once the event is applied, computed when the
/// posting was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceEvent {
    pub transaction_id: TransactionId,
    pub amount: Decimal,
    pub kind: BalanceEventKind,
    pub balance: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Customer {
    id: CustomerId,
    balance: Decimal,
    active: bool,
    pub account_id: Option<Uuid>,
    pub audit: Audit,
    version: Version,
}

impl Customer {
    pub fn open(id: CustomerId, opening_balance: Decimal, created_by: Option<String>) -> Self {
        Self {
            id,
            balance: opening_balance,
            active: true,
            account_id: None,
            audit: Audit::created(created_by),
            version: 0,
        }
    }

    pub fn id(&self) -> &CustomerId {
        &self.id
    }

    pub fn balance(&self) -> Decimal {
        self.balance
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Called by a store when it publishes this row.
    pub fn bump_version(&mut self) {
        self.version += 1;
    }

    pub fn close(&mut self, by: Option<&str>) {
        self.active = false;
        self.audit.touch(by);
    }

    pub fn apply(&mut self, event: &BalanceEvent) {
        self.balance = event.balance;
    }

    /// Turns a posting into the event that applies it, rejecting debits the
    /// balance cannot cover.
    ///
    /// A clawback skips the funds check when `allow_overdraft` is set, which
    /// is the only way a committed balance can end up below zero. A result
    /// outside the decimal range is rejected as an overflow.
    pub fn handle_posting(
        &self,
        posting: &Posting,
        allow_overdraft: bool,
    ) -> Result<BalanceEvent, InvariantViolation> {
        let kind = match posting.kind {
            PostingKind::Withdrawal => {
                invariant::validate(self.balance, posting.amount)?;
                BalanceEventKind::Debited
            }
            PostingKind::Clawback if allow_overdraft => {
                if posting.amount <= Decimal::zero() {
                    return Err(InvariantViolation::InvalidAmount {
                        amount: posting.amount,
                    });
                }
                BalanceEventKind::Debited
            }
            PostingKind::Clawback => {
                invariant::validate(self.balance, posting.amount)?;
                BalanceEventKind::Debited
            }
            PostingKind::Deposit | PostingKind::Refund => {
                if posting.amount <= Decimal::zero() {
                    return Err(InvariantViolation::InvalidAmount {
                        amount: posting.amount,
                    });
                }
                BalanceEventKind::Credited
            }
        };
        let balance = match kind {
            BalanceEventKind::Debited => self.balance.checked_sub(posting.amount),
            BalanceEventKind::Credited => self.balance.checked_add(posting.amount),
        }
        .ok_or(InvariantViolation::Overflow {
            balance: self.balance,
            amount: posting.amount,
        })?;
        Ok(BalanceEvent {
            transaction_id: posting.transaction_id,
            amount: posting.amount,
            kind,
            balance,
        })
    }
}
