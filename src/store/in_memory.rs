use std::{
    collections::{BTreeMap, HashMap},
    fmt::Display,
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use tracing::debug;

use crate::{
    customer::{Customer, CustomerId, Version},
    transaction::{TransactionId, TransactionRecord},
};

use super::{CustomerFilter, LedgerStore, StoreError, StoreTransaction, TransactionFilter};

#[derive(Debug, Default)]
struct LedgerState {
    customers: HashMap<CustomerId, Customer>,
    transactions: HashMap<TransactionId, TransactionRecord>,
}

/// Process-local store. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedgerStore {
    state: Arc<Mutex<LedgerState>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    type Transaction = InMemoryTransaction;

    async fn begin(&self) -> Result<Self::Transaction, StoreError> {
        Ok(InMemoryTransaction {
            state: Arc::clone(&self.state),
            customers: BTreeMap::new(),
            transactions: BTreeMap::new(),
        })
    }
}

trait Row: Clone {
    type Key: Ord + Hash + Clone + Display;
    const ENTITY: &'static str;

    fn key(&self) -> Self::Key;
    fn version(&self) -> Version;
    fn bump_version(&mut self);
}

impl Row for Customer {
    type Key = CustomerId;
    const ENTITY: &'static str = "Customer";

    fn key(&self) -> CustomerId {
        self.id().clone()
    }

    fn version(&self) -> Version {
        Customer::version(self)
    }

    fn bump_version(&mut self) {
        Customer::bump_version(self)
    }
}

impl Row for TransactionRecord {
    type Key = TransactionId;
    const ENTITY: &'static str = "Transaction";

    fn key(&self) -> TransactionId {
        self.id()
    }

    fn version(&self) -> Version {
        TransactionRecord::version(self)
    }

    fn bump_version(&mut self) {
        TransactionRecord::bump_version(self)
    }
}

/// A write waiting for commit. `base` is the committed version it was made
/// against, `None` for rows inserted by this transaction.
#[derive(Debug)]
struct Staged<T> {
    row: T,
    base: Option<Version>,
}

type StagedRows<T> = BTreeMap<<T as Row>::Key, Staged<T>>;

/// Writes are kept here and published on commit, in ascending key order.
#[derive(Debug)]
pub struct InMemoryTransaction {
    state: Arc<Mutex<LedgerState>>,
    customers: StagedRows<Customer>,
    transactions: StagedRows<TransactionRecord>,
}

impl InMemoryTransaction {
    fn lock(&self) -> Result<MutexGuard<'_, LedgerState>, StoreError> {
        lock(&self.state)
    }

    fn staged_count(&self) -> usize {
        self.customers.len() + self.transactions.len()
    }
}

fn lock(state: &Mutex<LedgerState>) -> Result<MutexGuard<'_, LedgerState>, StoreError> {
    state
        .lock()
        .map_err(|_| StoreError::Unavailable("ledger state lock poisoned".to_string()))
}

fn read<T: Row>(staged: &StagedRows<T>, committed: &HashMap<T::Key, T>, key: &T::Key) -> Option<T> {
    staged
        .get(key)
        .map(|staged| staged.row.clone())
        .or_else(|| committed.get(key).cloned())
}

fn scan<T: Row>(
    staged: &StagedRows<T>,
    committed: &HashMap<T::Key, T>,
    matches: impl Fn(&T) -> bool,
) -> Vec<T> {
    let mut rows: BTreeMap<T::Key, T> = committed
        .iter()
        .filter(|(key, _)| !staged.contains_key(*key))
        .filter(|(_, row)| matches(row))
        .map(|(key, row)| (key.clone(), row.clone()))
        .collect();
    rows.extend(
        staged
            .iter()
            .filter(|(_, staged)| matches(&staged.row))
            .map(|(key, staged)| (key.clone(), staged.row.clone())),
    );
    rows.into_values().collect()
}

fn stage_insert<T: Row>(
    staged: &mut StagedRows<T>,
    committed: &HashMap<T::Key, T>,
    row: T,
) -> Result<(), StoreError> {
    let key = row.key();
    if staged.contains_key(&key) || committed.contains_key(&key) {
        return Err(StoreError::Duplicate {
            entity: T::ENTITY,
            id: key.to_string(),
        });
    }
    staged.insert(key, Staged { row, base: None });
    Ok(())
}

fn stage_update<T: Row>(
    staged: &mut StagedRows<T>,
    committed: &HashMap<T::Key, T>,
    row: &T,
) -> Result<(), StoreError> {
    let key = row.key();
    let (current, base) = match staged.get(&key) {
        Some(staged) => (staged.row.version(), staged.base),
        None => match committed.get(&key) {
            Some(committed) => (committed.version(), Some(committed.version())),
            None => {
                return Err(StoreError::Missing {
                    entity: T::ENTITY,
                    id: key.to_string(),
                });
            }
        },
    };
    if current != row.version() {
        return Err(StoreError::Conflict {
            entity: T::ENTITY,
            id: key.to_string(),
        });
    }
    staged.insert(
        key,
        Staged {
            row: row.clone(),
            base,
        },
    );
    Ok(())
}

fn verify<T: Row>(staged: &StagedRows<T>, committed: &HashMap<T::Key, T>) -> Result<(), StoreError> {
    for (key, staged) in staged {
        let unchanged = match (committed.get(key), staged.base) {
            (Some(row), Some(base)) => row.version() == base,
            (None, None) => true,
            _ => false,
        };
        if !unchanged {
            return Err(StoreError::Conflict {
                entity: T::ENTITY,
                id: key.to_string(),
            });
        }
    }
    Ok(())
}

fn publish<T: Row>(staged: StagedRows<T>, committed: &mut HashMap<T::Key, T>) {
    for (key, Staged { mut row, base }) in staged {
        if base.is_some() {
            row.bump_version();
        }
        committed.insert(key, row);
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn customer(&mut self, id: &CustomerId) -> Result<Option<Customer>, StoreError> {
        let state = self.lock()?;
        Ok(read(&self.customers, &state.customers, id))
    }

    async fn customers(&mut self, filter: &CustomerFilter) -> Result<Vec<Customer>, StoreError> {
        let state = self.lock()?;
        Ok(scan(&self.customers, &state.customers, |customer| {
            filter.matches(customer)
        }))
    }

    async fn add_customer(&mut self, customer: Customer) -> Result<(), StoreError> {
        let state = lock(&self.state)?;
        stage_insert(&mut self.customers, &state.customers, customer)
    }

    async fn update_customer(&mut self, customer: &Customer) -> Result<(), StoreError> {
        let state = lock(&self.state)?;
        stage_update(&mut self.customers, &state.customers, customer)
    }

    async fn transaction(
        &mut self,
        id: TransactionId,
    ) -> Result<Option<TransactionRecord>, StoreError> {
        let state = self.lock()?;
        Ok(read(&self.transactions, &state.transactions, &id))
    }

    async fn transactions(
        &mut self,
        filter: &TransactionFilter,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let state = self.lock()?;
        Ok(scan(&self.transactions, &state.transactions, |record| {
            filter.matches(record)
        }))
    }

    async fn add_transaction(&mut self, record: TransactionRecord) -> Result<(), StoreError> {
        let state = lock(&self.state)?;
        stage_insert(&mut self.transactions, &state.transactions, record)
    }

    async fn update_transaction(&mut self, record: &TransactionRecord) -> Result<(), StoreError> {
        let state = lock(&self.state)?;
        stage_update(&mut self.transactions, &state.transactions, record)
    }

    async fn commit(self) -> Result<(), StoreError> {
        let staged = self.staged_count();
        let mut state = lock(&self.state)?;
        verify(&self.customers, &state.customers)?;
        verify(&self.transactions, &state.transactions)?;
        publish(self.customers, &mut state.customers);
        publish(self.transactions, &mut state.transactions);
        debug!(staged, "in-memory transaction committed");
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        debug!(
            staged = self.staged_count(),
            "in-memory transaction rolled back"
        );
        Ok(())
    }
}
