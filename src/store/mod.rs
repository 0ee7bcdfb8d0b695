use async_trait::async_trait;
use thiserror::Error;

use crate::{
    customer::{Customer, CustomerId},
    transaction::{TransactionId, TransactionRecord},
};

pub mod in_memory;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{entity} {id} was modified concurrently")]
    Conflict { entity: &'static str, id: String },
    #[error("{entity} {id} already exists")]
    Duplicate { entity: &'static str, id: String },
    #[error("{entity} {id} does not exist")]
    Missing { entity: &'static str, id: String },
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Default)]
pub struct CustomerFilter {
    pub active: Option<bool>,
}

impl CustomerFilter {
    pub fn matches(&self, customer: &Customer) -> bool {
        self.active.is_none_or(|active| customer.is_active() == active)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub sender_id: Option<CustomerId>,
    pub recipient_id: Option<CustomerId>,
    pub active: Option<bool>,
}

impl TransactionFilter {
    pub fn matches(&self, record: &TransactionRecord) -> bool {
        self.sender_id
            .as_ref()
            .is_none_or(|id| record.sender_id() == id)
            && self
                .recipient_id
                .as_ref()
                .is_none_or(|id| record.recipient_id() == id)
            && self.active.is_none_or(|active| record.is_active() == active)
    }
}

/// Source of store transactions.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    type Transaction: StoreTransaction;

    async fn begin(&self) -> Result<Self::Transaction, StoreError>;
}

/// One all-or-nothing unit of work.
///
/// Reads see the transaction's own staged writes. Updates are compare-and-swap
/// on the row version: they fail with [`StoreError::Conflict`] when the version
/// passed in is not the one currently stored. Nothing becomes visible to other
/// transactions before [`StoreTransaction::commit`], and dropping a transaction
/// without committing it discards every write.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn customer(&mut self, id: &CustomerId) -> Result<Option<Customer>, StoreError>;

    async fn customers(&mut self, filter: &CustomerFilter) -> Result<Vec<Customer>, StoreError>;

    async fn add_customer(&mut self, customer: Customer) -> Result<(), StoreError>;

    async fn update_customer(&mut self, customer: &Customer) -> Result<(), StoreError>;

    async fn transaction(
        &mut self,
        id: TransactionId,
    ) -> Result<Option<TransactionRecord>, StoreError>;

    async fn transactions(
        &mut self,
        filter: &TransactionFilter,
    ) -> Result<Vec<TransactionRecord>, StoreError>;

    async fn add_transaction(&mut self, record: TransactionRecord) -> Result<(), StoreError>;

    async fn update_transaction(&mut self, record: &TransactionRecord) -> Result<(), StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}
