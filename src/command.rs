use std::fmt;

use rust_decimal::{Decimal, prelude::Zero};
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    customer::CustomerId,
    transaction::{Amendment, TransactionId},
};

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    Create,
    Amend,
    Reverse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartyRole {
    Sender,
    Recipient,
    Customer,
}

impl fmt::Display for PartyRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PartyRole::Sender => "Sender",
            PartyRole::Recipient => "Recipient",
            PartyRole::Customer => "Customer",
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Amount is required for {kind:?}")]
    AmountRequired { kind: TransferKind },
    #[error("{role} id is empty")]
    EmptyCustomerId { role: PartyRole },
    #[error("Transaction id is empty")]
    EmptyTransactionId,
    #[error("Cannot transfer to the same customer {id}")]
    SameParty { id: CustomerId },
    #[error("The transferred amount must be greater than zero, got {amount}")]
    NonPositiveAmount { amount: Decimal },
    #[error("Opening balance must not be negative, got {balance}")]
    NegativeOpeningBalance { balance: Decimal },
    #[error("Customer {id} already exists")]
    DuplicateCustomer { id: CustomerId },
}

#[derive(Debug, Clone)]
pub struct OpenCustomerCommand {
    pub customer_id: CustomerId,
    pub opening_balance: Decimal,
    pub account_id: Option<Uuid>,
    pub created_by: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreateTransferCommand {
    pub sender_id: CustomerId,
    pub recipient_id: CustomerId,
    pub amount: Decimal,
    pub created_by: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AmendTransferCommand {
    pub transaction_id: TransactionId,
    pub amendment: Amendment,
    pub updated_by: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReverseTransferCommand {
    pub transaction_id: TransactionId,
    pub updated_by: Option<String>,
}

impl OpenCustomerCommand {
    pub fn parse(
        customer_id: CustomerId,
        opening_balance: Decimal,
        account_id: Option<Uuid>,
        created_by: Option<String>,
    ) -> Result<Self, CommandError> {
        ensure_customer_id(&customer_id, PartyRole::Customer)?;
        if opening_balance < Decimal::zero() {
            return Err(CommandError::NegativeOpeningBalance {
                balance: opening_balance,
            });
        }
        Ok(Self {
            customer_id,
            opening_balance,
            account_id,
            created_by,
        })
    }
}

impl CreateTransferCommand {
    /// Checks, in order: both ids present, ids distinct, amount positive.
    pub fn parse(
        sender_id: CustomerId,
        recipient_id: CustomerId,
        amount: Option<Decimal>,
        created_by: Option<String>,
    ) -> Result<Self, CommandError> {
        ensure_customer_id(&sender_id, PartyRole::Sender)?;
        ensure_customer_id(&recipient_id, PartyRole::Recipient)?;
        ensure_distinct(&sender_id, &recipient_id)?;
        let amount = ensure_amount(amount, TransferKind::Create)?;
        Ok(Self {
            sender_id,
            recipient_id,
            amount,
            created_by,
        })
    }
}

impl AmendTransferCommand {
    /// Parties that are supplied must be non-empty and distinct from each other.
    /// Whether the effective parties differ is only known once the stored
    /// record is loaded, so the engine checks that again.
    pub fn parse(
        transaction_id: TransactionId,
        amount: Option<Decimal>,
        sender_id: Option<CustomerId>,
        recipient_id: Option<CustomerId>,
        updated_by: Option<String>,
    ) -> Result<Self, CommandError> {
        ensure_transaction_id(transaction_id)?;
        if let Some(id) = &sender_id {
            ensure_customer_id(id, PartyRole::Sender)?;
        }
        if let Some(id) = &recipient_id {
            ensure_customer_id(id, PartyRole::Recipient)?;
        }
        if let (Some(sender), Some(recipient)) = (&sender_id, &recipient_id) {
            ensure_distinct(sender, recipient)?;
        }
        let amount = ensure_amount(amount, TransferKind::Amend)?;
        Ok(Self {
            transaction_id,
            amendment: Amendment {
                sender_id,
                recipient_id,
                amount,
            },
            updated_by,
        })
    }
}

impl ReverseTransferCommand {
    pub fn parse(
        transaction_id: TransactionId,
        updated_by: Option<String>,
    ) -> Result<Self, CommandError> {
        ensure_transaction_id(transaction_id)?;
        Ok(Self {
            transaction_id,
            updated_by,
        })
    }
}

pub(crate) fn ensure_customer_id(id: &CustomerId, role: PartyRole) -> Result<(), CommandError> {
    if id.is_empty() {
        Err(CommandError::EmptyCustomerId { role })
    } else {
        Ok(())
    }
}

pub(crate) fn ensure_transaction_id(id: TransactionId) -> Result<(), CommandError> {
    if id.is_nil() {
        Err(CommandError::EmptyTransactionId)
    } else {
        Ok(())
    }
}

pub(crate) fn ensure_distinct(
    sender_id: &CustomerId,
    recipient_id: &CustomerId,
) -> Result<(), CommandError> {
    if sender_id == recipient_id {
        Err(CommandError::SameParty {
            id: sender_id.clone(),
        })
    } else {
        Ok(())
    }
}

fn ensure_amount(amount: Option<Decimal>, kind: TransferKind) -> Result<Decimal, CommandError> {
    let Some(amount) = amount else {
        return Err(CommandError::AmountRequired { kind });
    };
    if amount > Decimal::zero() {
        Ok(amount)
    } else {
        Err(CommandError::NonPositiveAmount { amount })
    }
}
