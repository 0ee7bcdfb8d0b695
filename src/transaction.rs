use std::fmt;

use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    audit::Audit,
    customer::{CustomerId, Posting, PostingKind, Version},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct TransactionId(Uuid);

impl TransactionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// `Active` is initial, `Inactive` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransactionState {
    Active,
    Inactive,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Transaction {id} is already deleted")]
    AlreadyDeleted { id: TransactionId },
}

/// A stored transfer.
///
/// Sender, recipient and amount are only written through [`TransactionRecord::amend`],
/// and are all that is needed to undo the record's balance effect.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionRecord {
    id: TransactionId,
    sender_id: CustomerId,
    recipient_id: CustomerId,
    transferred_amount: Decimal,
    state: TransactionState,
    pub audit: Audit,
    version: Version,
}

/// New values for an existing transfer. Missing parties keep their old value.
#[derive(Debug, Clone)]
pub struct Amendment {
    pub sender_id: Option<CustomerId>,
    pub recipient_id: Option<CustomerId>,
    pub amount: Decimal,
}

/// Balance postings needed to move a record from its current values to an
/// [`Amendment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmendmentPlan {
    /// Same parties: only the signed difference between the amounts moves.
    Adjust {
        sender_id: CustomerId,
        recipient_id: CustomerId,
        postings: Vec<Posting>,
    },
    /// A party changed: the old effect is undone in full, then the new one applied.
    Replace {
        undo: [Posting; 2],
        apply: [Posting; 2],
    },
}

impl TransactionRecord {
    pub fn new(
        sender_id: CustomerId,
        recipient_id: CustomerId,
        transferred_amount: Decimal,
        created_by: Option<String>,
    ) -> Self {
        Self {
            id: TransactionId::generate(),
            sender_id,
            recipient_id,
            transferred_amount,
            state: TransactionState::Active,
            audit: Audit::created(created_by),
            version: 0,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn sender_id(&self) -> &CustomerId {
        &self.sender_id
    }

    pub fn recipient_id(&self) -> &CustomerId {
        &self.recipient_id
    }

    pub fn transferred_amount(&self) -> Decimal {
        self.transferred_amount
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Called by a store when it publishes this row.
    pub fn bump_version(&mut self) {
        self.version += 1;
    }

    /// Postings that carry out this transfer: debit the sender, credit the recipient.
    pub fn postings(&self) -> [Posting; 2] {
        self.postings_for(&self.sender_id, &self.recipient_id, self.transferred_amount)
    }

    /// Postings that undo this transfer: refund the sender, claw back from the recipient.
    pub fn reversal_postings(&self) -> [Posting; 2] {
        [
            Posting {
                customer_id: self.sender_id.clone(),
                transaction_id: self.id,
                kind: PostingKind::Refund,
                amount: self.transferred_amount,
            },
            Posting {
                customer_id: self.recipient_id.clone(),
                transaction_id: self.id,
                kind: PostingKind::Clawback,
                amount: self.transferred_amount,
            },
        ]
    }

    pub fn plan_amendment(&self, amendment: &Amendment) -> AmendmentPlan {
        let sender_id = amendment
            .sender_id
            .clone()
            .unwrap_or_else(|| self.sender_id.clone());
        let recipient_id = amendment
            .recipient_id
            .clone()
            .unwrap_or_else(|| self.recipient_id.clone());

        if sender_id != self.sender_id || recipient_id != self.recipient_id {
            return AmendmentPlan::Replace {
                undo: self.reversal_postings(),
                apply: self.postings_for(&sender_id, &recipient_id, amendment.amount),
            };
        }

        let difference = amendment.amount - self.transferred_amount;
        let postings = if difference > Decimal::ZERO {
            self.postings_for(&sender_id, &recipient_id, difference).to_vec()
        } else if difference < Decimal::ZERO {
            let returned = -difference;
            vec![
                Posting {
                    customer_id: sender_id.clone(),
                    transaction_id: self.id,
                    kind: PostingKind::Refund,
                    amount: returned,
                },
                Posting {
                    customer_id: recipient_id.clone(),
                    transaction_id: self.id,
                    kind: PostingKind::Clawback,
                    amount: returned,
                },
            ]
        } else {
            Vec::new()
        };

        AmendmentPlan::Adjust {
            sender_id,
            recipient_id,
            postings,
        }
    }

    /// Overwrites parties and amount. Only active records can be amended.
    pub fn amend(
        &mut self,
        sender_id: CustomerId,
        recipient_id: CustomerId,
        amount: Decimal,
        by: Option<&str>,
    ) -> Result<(), LifecycleError> {
        self.ensure_active()?;
        self.sender_id = sender_id;
        self.recipient_id = recipient_id;
        self.transferred_amount = amount;
        self.audit.touch(by);
        Ok(())
    }

    pub fn deactivate(&mut self, by: Option<&str>) -> Result<(), LifecycleError> {
        self.ensure_active()?;
        self.state = TransactionState::Inactive;
        self.audit.touch(by);
        Ok(())
    }

    pub fn ensure_active(&self) -> Result<(), LifecycleError> {
        match self.state {
            TransactionState::Active => Ok(()),
            TransactionState::Inactive => Err(LifecycleError::AlreadyDeleted { id: self.id }),
        }
    }

    fn postings_for(
        &self,
        sender_id: &CustomerId,
        recipient_id: &CustomerId,
        amount: Decimal,
    ) -> [Posting; 2] {
        [
            Posting {
                customer_id: sender_id.clone(),
                transaction_id: self.id,
                kind: PostingKind::Withdrawal,
                amount,
            },
            Posting {
                customer_id: recipient_id.clone(),
                transaction_id: self.id,
                kind: PostingKind::Deposit,
                amount,
            },
        ]
    }
}
