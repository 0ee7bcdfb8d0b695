use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::{
    command::{CommandError, PartyRole},
    customer::CustomerId,
    invariant::InvariantViolation,
    store::StoreError,
    transaction::{LifecycleError, TransactionId},
};

/// Coarse classification of every failure a caller can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    InvalidArgument,
    InvalidAmount,
    NotFound,
    AlreadyDeleted,
    InsufficientFunds,
    ConcurrencyConflict,
    StorageFailure,
}

impl ErrorKind {
    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::InvalidArgument
            | ErrorKind::InvalidAmount
            | ErrorKind::InsufficientFunds => 400,
            ErrorKind::NotFound | ErrorKind::AlreadyDeleted => 404,
            ErrorKind::ConcurrencyConflict => 409,
            ErrorKind::StorageFailure => 500,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{role} customer {id} not found or already deleted")]
    CustomerNotFound { role: PartyRole, id: CustomerId },
    #[error("Customer {id} is already deleted")]
    CustomerAlreadyClosed { id: CustomerId },
    #[error("Transaction {id} not found")]
    TransactionNotFound { id: TransactionId },
    #[error("Operation did not finish within {0:?}")]
    Timeout(Duration),
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::Command(_) => ErrorKind::InvalidArgument,
            TransferError::Invariant(
                InvariantViolation::InvalidAmount { .. } | InvariantViolation::Overflow { .. },
            ) => ErrorKind::InvalidAmount,
            TransferError::Invariant(InvariantViolation::InsufficientFunds { .. }) => {
                ErrorKind::InsufficientFunds
            }
            TransferError::Lifecycle(LifecycleError::AlreadyDeleted { .. })
            | TransferError::CustomerAlreadyClosed { .. } => ErrorKind::AlreadyDeleted,
            TransferError::Store(StoreError::Conflict { .. }) => ErrorKind::ConcurrencyConflict,
            TransferError::Store(_) | TransferError::Timeout(_) => ErrorKind::StorageFailure,
            TransferError::CustomerNotFound { .. } | TransferError::TransactionNotFound { .. } => {
                ErrorKind::NotFound
            }
        }
    }

    pub fn status_code(&self) -> u16 {
        self.kind().status_code()
    }
}
