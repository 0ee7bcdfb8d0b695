use std::{collections::BTreeMap, future::Future};

use tracing::{debug, error, info, warn};

use crate::{
    command::{
        self, AmendTransferCommand, CommandError, CreateTransferCommand, OpenCustomerCommand,
        PartyRole, ReverseTransferCommand,
    },
    config::EngineConfig,
    customer::{Customer, CustomerId, Posting},
    error::TransferError,
    invariant,
    store::{CustomerFilter, LedgerStore, StoreTransaction, TransactionFilter},
    transaction::{AmendmentPlan, TransactionId, TransactionRecord},
};

/// The central transfer engine.
///
/// Every operation opens one store transaction, does all of its reads and
/// writes through that handle, and either commits it or rolls it back before
/// returning. The engine never retries; a conflict is reported to the caller.
#[derive(Debug)]
pub struct TransferEngine<S> {
    store: S,
    config: EngineConfig,
}

/// Customers touched by one operation, keyed by id so they are always written
/// in the same order regardless of which side of a transfer they are on.
#[derive(Debug, Default)]
struct Parties(BTreeMap<CustomerId, Customer>);

impl Parties {
    fn insert(&mut self, customer: Customer) {
        self.0.entry(customer.id().clone()).or_insert(customer);
    }

    fn contains(&self, id: &CustomerId) -> bool {
        self.0.contains_key(id)
    }

    fn get(&self, id: &CustomerId) -> Option<&Customer> {
        self.0.get(id)
    }

    /// Applies postings in order; the first rejected posting aborts the rest.
    fn post(&mut self, postings: &[Posting], allow_overdraft: bool) -> Result<(), TransferError> {
        for posting in postings {
            let customer = self.0.get_mut(&posting.customer_id).ok_or_else(|| {
                TransferError::CustomerNotFound {
                    role: PartyRole::Customer,
                    id: posting.customer_id.clone(),
                }
            })?;
            let event = customer.handle_posting(posting, allow_overdraft)?;
            customer.apply(&event);
            debug!(
                customer = %posting.customer_id,
                transaction = %posting.transaction_id,
                kind = ?posting.kind,
                amount = %posting.amount,
                balance = %customer.balance(),
                "posting applied"
            );
        }
        Ok(())
    }

    async fn persist<T: StoreTransaction>(
        self,
        tx: &mut T,
        by: Option<&str>,
    ) -> Result<(), TransferError> {
        for (_, mut customer) in self.0 {
            customer.audit.touch(by);
            tx.update_customer(&customer).await?;
        }
        Ok(())
    }
}

impl<S: LedgerStore> TransferEngine<S> {
    pub fn new(store: S, config: EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Moves `amount` from sender to recipient and records the transfer.
    pub async fn create_transfer(
        &self,
        command: CreateTransferCommand,
    ) -> Result<TransactionId, TransferError> {
        self.bounded("create_transfer", async {
            let mut tx = self.store.begin().await?;
            let outcome = self.create_within(&mut tx, &command).await;
            settle(tx, outcome, "create_transfer").await
        })
        .await
        .inspect(|id| {
            info!(
                transaction = %id,
                sender = %command.sender_id,
                recipient = %command.recipient_id,
                amount = %command.amount,
                "transfer created"
            )
        })
    }

    /// Changes the amount, and optionally the parties, of an active transfer.
    pub async fn amend_transfer(
        &self,
        command: AmendTransferCommand,
    ) -> Result<TransactionId, TransferError> {
        self.bounded("amend_transfer", async {
            let mut tx = self.store.begin().await?;
            let outcome = self.amend_within(&mut tx, &command).await;
            settle(tx, outcome, "amend_transfer").await
        })
        .await
        .inspect(|id| {
            info!(
                transaction = %id,
                amount = %command.amendment.amount,
                "transfer amended"
            )
        })
    }

    /// Undoes the balance effect of an active transfer and marks it inactive.
    pub async fn reverse_transfer(
        &self,
        command: ReverseTransferCommand,
    ) -> Result<TransactionId, TransferError> {
        self.bounded("reverse_transfer", async {
            let mut tx = self.store.begin().await?;
            let outcome = self.reverse_within(&mut tx, &command).await;
            settle(tx, outcome, "reverse_transfer").await
        })
        .await
        .inspect(|id| info!(transaction = %id, "transfer reversed"))
    }

    /// An active transfer. Reversed transfers are reported as already deleted.
    pub async fn transfer(&self, id: TransactionId) -> Result<TransactionRecord, TransferError> {
        command::ensure_transaction_id(id)?;
        self.bounded("transfer", async {
            let mut tx = self.store.begin().await?;
            let outcome: Result<_, TransferError> = async {
                let record = load_record(&mut tx, id).await?;
                record.ensure_active()?;
                Ok(record)
            }
            .await;
            release(tx, outcome).await
        })
        .await
    }

    /// All active transfers.
    pub async fn transfers(&self) -> Result<Vec<TransactionRecord>, TransferError> {
        self.active_transfers(TransactionFilter::default()).await
    }

    pub async fn transfers_by_sender(
        &self,
        sender_id: &CustomerId,
    ) -> Result<Vec<TransactionRecord>, TransferError> {
        command::ensure_customer_id(sender_id, PartyRole::Sender)?;
        self.active_transfers(TransactionFilter {
            sender_id: Some(sender_id.clone()),
            ..Default::default()
        })
        .await
    }

    pub async fn transfers_by_recipient(
        &self,
        recipient_id: &CustomerId,
    ) -> Result<Vec<TransactionRecord>, TransferError> {
        command::ensure_customer_id(recipient_id, PartyRole::Recipient)?;
        self.active_transfers(TransactionFilter {
            recipient_id: Some(recipient_id.clone()),
            ..Default::default()
        })
        .await
    }

    pub async fn open_customer(
        &self,
        command: OpenCustomerCommand,
    ) -> Result<CustomerId, TransferError> {
        self.bounded("open_customer", async {
            let mut tx = self.store.begin().await?;
            let outcome: Result<_, TransferError> = async {
                if tx.customer(&command.customer_id).await?.is_some() {
                    return Err(CommandError::DuplicateCustomer {
                        id: command.customer_id.clone(),
                    }
                    .into());
                }
                let mut customer = Customer::open(
                    command.customer_id.clone(),
                    command.opening_balance,
                    command.created_by.clone(),
                );
                customer.account_id = command.account_id;
                tx.add_customer(customer).await?;
                Ok(command.customer_id.clone())
            }
            .await;
            settle(tx, outcome, "open_customer").await
        })
        .await
        .inspect(|id| info!(customer = %id, balance = %command.opening_balance, "customer opened"))
    }

    /// Soft-deletes a customer. Its transfers stay queryable.
    pub async fn close_customer(
        &self,
        id: &CustomerId,
        by: Option<&str>,
    ) -> Result<CustomerId, TransferError> {
        command::ensure_customer_id(id, PartyRole::Customer)?;
        self.bounded("close_customer", async {
            let mut tx = self.store.begin().await?;
            let outcome: Result<_, TransferError> = async {
                let mut customer = tx.customer(id).await?.ok_or_else(|| {
                    TransferError::CustomerNotFound {
                        role: PartyRole::Customer,
                        id: id.clone(),
                    }
                })?;
                if !customer.is_active() {
                    return Err(TransferError::CustomerAlreadyClosed { id: id.clone() });
                }
                customer.close(by);
                tx.update_customer(&customer).await?;
                Ok(id.clone())
            }
            .await;
            settle(tx, outcome, "close_customer").await
        })
        .await
        .inspect(|id| info!(customer = %id, "customer closed"))
    }

    /// An active customer.
    pub async fn customer(&self, id: &CustomerId) -> Result<Customer, TransferError> {
        command::ensure_customer_id(id, PartyRole::Customer)?;
        self.bounded("customer", async {
            let mut tx = self.store.begin().await?;
            let outcome = load_customer(&mut tx, id, PartyRole::Customer).await;
            release(tx, outcome).await
        })
        .await
    }

    /// Every customer, closed ones included, ordered by id.
    pub async fn customers(&self) -> Result<Vec<Customer>, TransferError> {
        self.bounded("customers", async {
            let mut tx = self.store.begin().await?;
            let outcome = tx
                .customers(&CustomerFilter::default())
                .await
                .map_err(TransferError::from);
            release(tx, outcome).await
        })
        .await
    }

    async fn active_transfers(
        &self,
        filter: TransactionFilter,
    ) -> Result<Vec<TransactionRecord>, TransferError> {
        let filter = TransactionFilter {
            active: Some(true),
            ..filter
        };
        self.bounded("transfers", async {
            let mut tx = self.store.begin().await?;
            let outcome = tx.transactions(&filter).await.map_err(TransferError::from);
            release(tx, outcome).await
        })
        .await
    }

    async fn create_within(
        &self,
        tx: &mut S::Transaction,
        command: &CreateTransferCommand,
    ) -> Result<TransactionId, TransferError> {
        let sender = load_customer(tx, &command.sender_id, PartyRole::Sender).await?;
        invariant::validate(sender.balance(), command.amount)?;
        let recipient = load_customer(tx, &command.recipient_id, PartyRole::Recipient).await?;

        let record = TransactionRecord::new(
            command.sender_id.clone(),
            command.recipient_id.clone(),
            command.amount,
            command.created_by.clone(),
        );

        let mut parties = Parties::default();
        parties.insert(sender);
        parties.insert(recipient);
        parties.post(&record.postings(), self.config.allow_reversal_overdraft)?;
        parties.persist(tx, command.created_by.as_deref()).await?;

        let id = record.id();
        tx.add_transaction(record).await?;
        Ok(id)
    }

    async fn reverse_within(
        &self,
        tx: &mut S::Transaction,
        command: &ReverseTransferCommand,
    ) -> Result<TransactionId, TransferError> {
        let by = command.updated_by.as_deref();
        let mut record = load_record(tx, command.transaction_id).await?;
        record.ensure_active()?;

        let mut parties = Parties::default();
        parties.insert(load_customer(tx, record.sender_id(), PartyRole::Sender).await?);
        parties.insert(load_customer(tx, record.recipient_id(), PartyRole::Recipient).await?);
        parties.post(
            &record.reversal_postings(),
            self.config.allow_reversal_overdraft,
        )?;
        parties.persist(tx, by).await?;

        record.deactivate(by)?;
        tx.update_transaction(&record).await?;
        Ok(record.id())
    }

    async fn amend_within(
        &self,
        tx: &mut S::Transaction,
        command: &AmendTransferCommand,
    ) -> Result<TransactionId, TransferError> {
        let by = command.updated_by.as_deref();
        let amount = command.amendment.amount;
        let mut record = load_record(tx, command.transaction_id).await?;
        record.ensure_active()?;

        let mut parties = Parties::default();
        let (sender_id, recipient_id) = match record.plan_amendment(&command.amendment) {
            AmendmentPlan::Adjust {
                sender_id,
                recipient_id,
                postings,
            } => {
                let sender = load_customer(tx, &sender_id, PartyRole::Sender).await?;
                // the sender has to cover the whole new amount, not just the difference
                invariant::validate(sender.balance(), amount)?;
                parties.insert(sender);
                parties.insert(load_customer(tx, &recipient_id, PartyRole::Recipient).await?);
                parties.post(&postings, self.config.allow_reversal_overdraft)?;
                (sender_id, recipient_id)
            }
            AmendmentPlan::Replace { undo, apply } => {
                let [new_sender, new_recipient] = [&apply[0], &apply[1]]
                    .map(|posting| posting.customer_id.clone());
                command::ensure_distinct(&new_sender, &new_recipient)?;
                debug!(
                    transaction = %record.id(),
                    old_sender = %record.sender_id(),
                    old_recipient = %record.recipient_id(),
                    new_sender = %new_sender,
                    new_recipient = %new_recipient,
                    "parties changed, replacing the whole transfer"
                );

                for (id, role) in [
                    (record.sender_id(), PartyRole::Sender),
                    (record.recipient_id(), PartyRole::Recipient),
                    (&new_sender, PartyRole::Sender),
                    (&new_recipient, PartyRole::Recipient),
                ] {
                    if !parties.contains(id) {
                        parties.insert(load_customer(tx, id, role).await?);
                    }
                }
                parties.post(&undo, self.config.allow_reversal_overdraft)?;
                if let Some(sender) = parties.get(&new_sender) {
                    invariant::validate(sender.balance(), amount)?;
                }
                parties.post(&apply, self.config.allow_reversal_overdraft)?;
                (new_sender, new_recipient)
            }
        };
        parties.persist(tx, by).await?;

        record.amend(sender_id, recipient_id, amount, by)?;
        tx.update_transaction(&record).await?;
        Ok(record.id())
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        work: impl Future<Output = Result<T, TransferError>>,
    ) -> Result<T, TransferError> {
        let limit = self.config.operation_timeout();
        match tokio::time::timeout(limit, work).await {
            Ok(outcome) => outcome,
            Err(_) => {
                // the store handle was dropped with the future, nothing was committed
                warn!(operation, ?limit, "operation timed out");
                Err(TransferError::Timeout(limit))
            }
        }
    }
}

async fn load_customer<T: StoreTransaction>(
    tx: &mut T,
    id: &CustomerId,
    role: PartyRole,
) -> Result<Customer, TransferError> {
    match tx.customer(id).await? {
        Some(customer) if customer.is_active() => Ok(customer),
        _ => Err(TransferError::CustomerNotFound {
            role,
            id: id.clone(),
        }),
    }
}

async fn load_record<T: StoreTransaction>(
    tx: &mut T,
    id: TransactionId,
) -> Result<TransactionRecord, TransferError> {
    tx.transaction(id)
        .await?
        .ok_or(TransferError::TransactionNotFound { id })
}

/// Commits on success, rolls back on failure.
async fn settle<T, X: StoreTransaction>(
    tx: X,
    outcome: Result<T, TransferError>,
    operation: &'static str,
) -> Result<T, TransferError> {
    match outcome {
        Ok(value) => match tx.commit().await {
            Ok(()) => Ok(value),
            Err(err) => {
                warn!(operation, %err, "commit rejected");
                Err(err.into())
            }
        },
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                error!(operation, %rollback_err, "rollback failed");
            }
            warn!(operation, %err, kind = ?err.kind(), "operation rolled back");
            Err(err)
        }
    }
}

/// Ends a read-only transaction.
async fn release<T, X: StoreTransaction>(
    tx: X,
    outcome: Result<T, TransferError>,
) -> Result<T, TransferError> {
    if let Err(err) = tx.rollback().await {
        error!(%err, "failed to release read transaction");
    }
    outcome
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use async_trait::async_trait;
    use rust_decimal::{Decimal, prelude::FromPrimitive};
    use tokio::sync::{Notify, Semaphore};

    use crate::{
        customer::PostingKind,
        error::ErrorKind,
        store::{
            StoreError,
            in_memory::{InMemoryLedgerStore, InMemoryTransaction},
        },
    };

    use super::*;

    fn dec(value: i32) -> Decimal {
        Decimal::from_i32(value).unwrap()
    }

    async fn engine_with<S: LedgerStore>(
        store: S,
        config: EngineConfig,
        customers: &[(&str, i32)],
    ) -> TransferEngine<S> {
        let engine = TransferEngine::new(store, config);
        for (id, balance) in customers {
            engine
                .open_customer(
                    OpenCustomerCommand::parse((*id).into(), dec(*balance), None, None).unwrap(),
                )
                .await
                .unwrap();
        }
        engine
    }

    async fn ledger(customers: &[(&str, i32)]) -> TransferEngine<InMemoryLedgerStore> {
        engine_with(InMemoryLedgerStore::new(), EngineConfig::default(), customers).await
    }

    async fn balance<S: LedgerStore>(engine: &TransferEngine<S>, id: &str) -> Decimal {
        engine.customer(&id.into()).await.unwrap().balance()
    }

    fn create(sender: &str, recipient: &str, amount: i32) -> CreateTransferCommand {
        CreateTransferCommand::parse(
            sender.into(),
            recipient.into(),
            Some(dec(amount)),
            Some("teller".to_string()),
        )
        .unwrap()
    }

    fn amend(id: TransactionId, amount: i32) -> AmendTransferCommand {
        AmendTransferCommand::parse(id, Some(dec(amount)), None, None, None).unwrap()
    }

    fn reverse(id: TransactionId) -> ReverseTransferCommand {
        ReverseTransferCommand::parse(id, Some("auditor".to_string())).unwrap()
    }

    #[tokio::test]
    async fn create_amend_reverse_scenario() {
        let engine = ledger(&[("alice", 500), ("bob", 0)]).await;

        let id = engine
            .create_transfer(create("alice", "bob", 200))
            .await
            .unwrap();
        assert_eq!(balance(&engine, "alice").await, dec(300));
        assert_eq!(balance(&engine, "bob").await, dec(200));

        assert_eq!(engine.amend_transfer(amend(id, 50)).await.unwrap(), id);
        assert_eq!(balance(&engine, "alice").await, dec(450));
        assert_eq!(balance(&engine, "bob").await, dec(50));
        assert_eq!(
            engine.transfer(id).await.unwrap().transferred_amount(),
            dec(50)
        );

        assert_eq!(engine.reverse_transfer(reverse(id)).await.unwrap(), id);
        assert_eq!(balance(&engine, "alice").await, dec(500));
        assert_eq!(balance(&engine, "bob").await, dec(0));
    }

    #[tokio::test]
    async fn insufficient_funds_changes_nothing() {
        let engine = ledger(&[("alice", 50), ("bob", 0)]).await;
        let err = engine
            .create_transfer(create("alice", "bob", 100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientFunds);
        assert_eq!(err.status_code(), 400);
        assert_eq!(balance(&engine, "alice").await, dec(50));
        assert_eq!(balance(&engine, "bob").await, dec(0));
        assert!(engine.transfers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn funds_are_checked_before_the_recipient_is_looked_up() {
        let engine = ledger(&[("alice", 50)]).await;
        let err = engine
            .create_transfer(create("alice", "nobody", 100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientFunds);
    }

    #[tokio::test]
    async fn transfer_to_self_is_an_invalid_argument() {
        let err = CreateTransferCommand::parse("alice".into(), "alice".into(), Some(dec(10)), None)
            .map_err(TransferError::from)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn transfers_conserve_the_total() {
        let engine = ledger(&[("alice", 500), ("bob", 120), ("carol", 7)]).await;
        let total = dec(627);
        let moves = [
            ("alice", "bob", 200),
            ("bob", "carol", 300),
            ("carol", "alice", 307),
            ("alice", "carol", 1_000), // rejected
            ("bob", "alice", 20),
        ];
        for (sender, recipient, amount) in moves {
            let _ = engine
                .create_transfer(create(sender, recipient, amount))
                .await;
            let mut sum = Decimal::ZERO;
            for customer in engine.customers().await.unwrap() {
                assert!(customer.balance() >= Decimal::ZERO);
                sum += customer.balance();
            }
            assert_eq!(sum, total);
        }
        assert_eq!(engine.transfers().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn reversing_twice_is_rejected_without_side_effects() {
        let engine = ledger(&[("alice", 500), ("bob", 0)]).await;
        let id = engine
            .create_transfer(create("alice", "bob", 100))
            .await
            .unwrap();
        engine.reverse_transfer(reverse(id)).await.unwrap();

        let err = engine.reverse_transfer(reverse(id)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyDeleted);
        assert_eq!(err.status_code(), 404);
        assert_eq!(balance(&engine, "alice").await, dec(500));
        assert_eq!(balance(&engine, "bob").await, dec(0));

        let err = engine.transfer(id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyDeleted);
        let err = engine.amend_transfer(amend(id, 10)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyDeleted);
    }

    #[tokio::test]
    async fn unknown_transactions_are_not_found() {
        let engine = ledger(&[]).await;
        let id = TransactionId::generate();
        for err in [
            engine.reverse_transfer(reverse(id)).await.unwrap_err(),
            engine.amend_transfer(amend(id, 10)).await.unwrap_err(),
            engine.transfer(id).await.unwrap_err(),
        ] {
            assert_eq!(err.kind(), ErrorKind::NotFound);
        }
    }

    #[tokio::test]
    async fn missing_or_closed_recipient_leaves_sender_untouched() {
        let engine = ledger(&[("alice", 500), ("bob", 0)]).await;
        let err = engine
            .create_transfer(create("alice", "nobody", 100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(
            err.to_string(),
            "Recipient customer nobody not found or already deleted"
        );

        engine.close_customer(&"bob".into(), None).await.unwrap();
        let err = engine
            .create_transfer(create("alice", "bob", 100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        assert_eq!(balance(&engine, "alice").await, dec(500));
        assert_eq!(
            engine.customer(&"alice".into()).await.unwrap().version(),
            0
        );
        assert!(engine.transfers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reversal_cannot_overdraw_the_recipient_by_default() {
        let engine = ledger(&[("alice", 500), ("bob", 0), ("carol", 0)]).await;
        let id = engine
            .create_transfer(create("alice", "bob", 200))
            .await
            .unwrap();
        engine
            .create_transfer(create("bob", "carol", 150))
            .await
            .unwrap();

        let err = engine.reverse_transfer(reverse(id)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientFunds);
        assert_eq!(balance(&engine, "alice").await, dec(300));
        assert_eq!(balance(&engine, "bob").await, dec(50));
        assert!(engine.transfer(id).await.unwrap().is_active());
    }

    #[tokio::test]
    async fn reversal_may_overdraw_when_configured() {
        let config = EngineConfig {
            allow_reversal_overdraft: true,
            ..Default::default()
        };
        let engine = engine_with(
            InMemoryLedgerStore::new(),
            config,
            &[("alice", 500), ("bob", 0), ("carol", 0)],
        )
        .await;
        let id = engine
            .create_transfer(create("alice", "bob", 200))
            .await
            .unwrap();
        engine
            .create_transfer(create("bob", "carol", 150))
            .await
            .unwrap();

        engine.reverse_transfer(reverse(id)).await.unwrap();
        assert_eq!(balance(&engine, "alice").await, dec(500));
        assert_eq!(balance(&engine, "bob").await, dec(-150));
    }

    #[tokio::test]
    async fn amendment_requires_cover_for_the_new_total() {
        let engine = ledger(&[("alice", 500), ("bob", 0)]).await;
        let id = engine
            .create_transfer(create("alice", "bob", 200))
            .await
            .unwrap();

        engine.amend_transfer(amend(id, 250)).await.unwrap();
        assert_eq!(balance(&engine, "alice").await, dec(250));
        assert_eq!(balance(&engine, "bob").await, dec(250));

        // only 150 more would move, but 250 cannot cover a 400 transfer
        let err = engine.amend_transfer(amend(id, 400)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientFunds);
        assert_eq!(balance(&engine, "alice").await, dec(250));
        assert_eq!(
            engine.transfer(id).await.unwrap().transferred_amount(),
            dec(250)
        );
    }

    #[tokio::test]
    async fn changing_recipient_moves_funds_from_the_old_one() {
        let engine = ledger(&[("alice", 500), ("bob", 0), ("carol", 0)]).await;
        let id = engine
            .create_transfer(create("alice", "bob", 200))
            .await
            .unwrap();

        let command = AmendTransferCommand::parse(
            id,
            Some(dec(100)),
            None,
            Some("carol".into()),
            Some("teller".to_string()),
        )
        .unwrap();
        engine.amend_transfer(command).await.unwrap();

        assert_eq!(balance(&engine, "alice").await, dec(400));
        assert_eq!(balance(&engine, "bob").await, dec(0));
        assert_eq!(balance(&engine, "carol").await, dec(100));

        let record = engine.transfer(id).await.unwrap();
        assert_eq!(record.sender_id().as_str(), "alice");
        assert_eq!(record.recipient_id().as_str(), "carol");
        assert_eq!(record.audit.update_by.as_deref(), Some("teller"));

        // the reversal now follows the amended parties
        engine.reverse_transfer(reverse(id)).await.unwrap();
        assert_eq!(balance(&engine, "alice").await, dec(500));
        assert_eq!(balance(&engine, "carol").await, dec(0));
    }

    #[tokio::test]
    async fn changing_parties_into_a_self_transfer_is_rejected() {
        let engine = ledger(&[("alice", 500), ("bob", 0)]).await;
        let id = engine
            .create_transfer(create("alice", "bob", 200))
            .await
            .unwrap();
        let command =
            AmendTransferCommand::parse(id, Some(dec(100)), None, Some("alice".into()), None)
                .unwrap();
        let err = engine.amend_transfer(command).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(balance(&engine, "alice").await, dec(300));
    }

    #[tokio::test]
    async fn reads_only_return_active_transfers() {
        let engine = ledger(&[("alice", 500), ("bob", 100), ("carol", 0)]).await;
        let first = engine
            .create_transfer(create("alice", "bob", 10))
            .await
            .unwrap();
        let second = engine
            .create_transfer(create("bob", "carol", 20))
            .await
            .unwrap();
        let third = engine
            .create_transfer(create("alice", "carol", 30))
            .await
            .unwrap();
        engine.reverse_transfer(reverse(third)).await.unwrap();

        let ids = |records: Vec<TransactionRecord>| {
            records.iter().map(TransactionRecord::id).collect::<Vec<_>>()
        };
        assert_eq!(
            ids(engine.transfers_by_sender(&"alice".into()).await.unwrap()),
            vec![first]
        );
        assert_eq!(
            ids(engine.transfers_by_recipient(&"carol".into()).await.unwrap()),
            vec![second]
        );
        assert_eq!(engine.transfers().await.unwrap().len(), 2);

        let err = engine
            .transfers_by_sender(&"".into())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn customer_registry() {
        let engine = ledger(&[("alice", 10)]).await;
        let err = engine
            .open_customer(OpenCustomerCommand::parse("alice".into(), dec(1), None, None).unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(err.to_string(), "Customer alice already exists");

        engine.close_customer(&"alice".into(), Some("admin")).await.unwrap();
        let err = engine
            .close_customer(&"alice".into(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyDeleted);
        assert_eq!(
            engine.customer(&"alice".into()).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );

        // closed customers are still listed
        let customers = engine.customers().await.unwrap();
        assert_eq!(customers.len(), 1);
        assert!(!customers[0].is_active());
        assert_eq!(customers[0].audit.update_by.as_deref(), Some("admin"));
    }

    /// Wraps the in memory store to inject failures and pauses.
    #[derive(Clone, Default)]
    struct FlakyStore {
        inner: InMemoryLedgerStore,
        fail_add_transaction: bool,
        commit_delay: Option<Duration>,
        gate: Option<Gate>,
    }

    /// Holds a commit until the test releases it.
    #[derive(Clone)]
    struct Gate {
        reached: Arc<Notify>,
        release: Arc<Semaphore>,
    }

    impl Gate {
        fn new() -> Self {
            Self {
                reached: Arc::new(Notify::new()),
                release: Arc::new(Semaphore::new(0)),
            }
        }
    }

    struct FlakyTransaction {
        inner: InMemoryTransaction,
        fail_add_transaction: bool,
        commit_delay: Option<Duration>,
        gate: Option<Gate>,
    }

    #[async_trait]
    impl LedgerStore for FlakyStore {
        type Transaction = FlakyTransaction;

        async fn begin(&self) -> Result<FlakyTransaction, StoreError> {
            Ok(FlakyTransaction {
                inner: self.inner.begin().await?,
                fail_add_transaction: self.fail_add_transaction,
                commit_delay: self.commit_delay,
                gate: self.gate.clone(),
            })
        }
    }

    #[async_trait]
    impl StoreTransaction for FlakyTransaction {
        async fn customer(&mut self, id: &CustomerId) -> Result<Option<Customer>, StoreError> {
            self.inner.customer(id).await
        }

        async fn customers(
            &mut self,
            filter: &CustomerFilter,
        ) -> Result<Vec<Customer>, StoreError> {
            self.inner.customers(filter).await
        }

        async fn add_customer(&mut self, customer: Customer) -> Result<(), StoreError> {
            self.inner.add_customer(customer).await
        }

        async fn update_customer(&mut self, customer: &Customer) -> Result<(), StoreError> {
            self.inner.update_customer(customer).await
        }

        async fn transaction(
            &mut self,
            id: TransactionId,
        ) -> Result<Option<TransactionRecord>, StoreError> {
            self.inner.transaction(id).await
        }

        async fn transactions(
            &mut self,
            filter: &TransactionFilter,
        ) -> Result<Vec<TransactionRecord>, StoreError> {
            self.inner.transactions(filter).await
        }

        async fn add_transaction(&mut self, record: TransactionRecord) -> Result<(), StoreError> {
            if self.fail_add_transaction {
                return Err(StoreError::Unavailable("disk full".to_string()));
            }
            self.inner.add_transaction(record).await
        }

        async fn update_transaction(
            &mut self,
            record: &TransactionRecord,
        ) -> Result<(), StoreError> {
            self.inner.update_transaction(record).await
        }

        async fn commit(self) -> Result<(), StoreError> {
            let FlakyTransaction {
                inner,
                commit_delay,
                gate,
                ..
            } = self;
            if let Some(gate) = gate {
                gate.reached.notify_one();
                let _permit = gate
                    .release
                    .acquire()
                    .await
                    .map_err(|_| StoreError::Unavailable("gate closed".to_string()))?;
            }
            if let Some(delay) = commit_delay {
                tokio::time::sleep(delay).await;
            }
            inner.commit().await
        }

        async fn rollback(self) -> Result<(), StoreError> {
            self.inner.rollback().await
        }
    }

    #[tokio::test]
    async fn late_storage_failure_rolls_back_balances() {
        let shared = InMemoryLedgerStore::new();
        let seeded = engine_with(
            shared.clone(),
            EngineConfig::default(),
            &[("alice", 500), ("bob", 0)],
        )
        .await;
        let flaky = TransferEngine::new(
            FlakyStore {
                inner: shared,
                fail_add_transaction: true,
                ..Default::default()
            },
            EngineConfig::default(),
        );

        let err = flaky
            .create_transfer(create("alice", "bob", 100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StorageFailure);
        assert_eq!(err.status_code(), 500);
        assert_eq!(balance(&seeded, "alice").await, dec(500));
        assert_eq!(balance(&seeded, "bob").await, dec(0));
    }

    #[tokio::test]
    async fn slow_commit_times_out_without_effect() {
        let shared = InMemoryLedgerStore::new();
        let seeded = engine_with(
            shared.clone(),
            EngineConfig::default(),
            &[("alice", 500), ("bob", 0)],
        )
        .await;
        let slow = TransferEngine::new(
            FlakyStore {
                inner: shared,
                commit_delay: Some(Duration::from_millis(500)),
                ..Default::default()
            },
            EngineConfig {
                operation_timeout_ms: 20,
                ..Default::default()
            },
        );

        let err = slow
            .create_transfer(create("alice", "bob", 100))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Timeout(_)));
        assert_eq!(err.kind(), ErrorKind::StorageFailure);
        assert_eq!(balance(&seeded, "alice").await, dec(500));
        assert!(seeded.transfers().await.unwrap().is_empty());
    }

    async fn gated_ledger() -> (
        TransferEngine<InMemoryLedgerStore>,
        Arc<TransferEngine<FlakyStore>>,
        Gate,
        TransactionId,
    ) {
        let shared = InMemoryLedgerStore::new();
        let plain = engine_with(
            shared.clone(),
            EngineConfig::default(),
            &[("alice", 500), ("bob", 0)],
        )
        .await;
        let id = plain
            .create_transfer(create("alice", "bob", 200))
            .await
            .unwrap();
        let gate = Gate::new();
        let gated = TransferEngine::new(
            FlakyStore {
                inner: shared,
                gate: Some(gate.clone()),
                ..Default::default()
            },
            EngineConfig::default(),
        );
        (plain, Arc::new(gated), gate, id)
    }

    #[tokio::test]
    async fn concurrent_write_surfaces_conflict() {
        let (plain, gated, gate, id) = gated_ledger().await;

        let reversal = tokio::spawn({
            let gated = Arc::clone(&gated);
            async move { gated.reverse_transfer(reverse(id)).await }
        });
        gate.reached.notified().await;

        // someone else credits bob while the reversal waits to commit
        let mut other = plain.store().begin().await.unwrap();
        let mut bob = other.customer(&"bob".into()).await.unwrap().unwrap();
        let credit = Posting {
            customer_id: "bob".into(),
            transaction_id: TransactionId::generate(),
            kind: PostingKind::Deposit,
            amount: dec(10),
        };
        let event = bob.handle_posting(&credit, false).unwrap();
        bob.apply(&event);
        other.update_customer(&bob).await.unwrap();
        other.commit().await.unwrap();

        gate.release.add_permits(1);
        let err = reversal.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConcurrencyConflict);
        assert_eq!(err.status_code(), 409);

        assert_eq!(balance(&plain, "alice").await, dec(300));
        assert_eq!(balance(&plain, "bob").await, dec(210));
        assert!(plain.transfer(id).await.unwrap().is_active());
    }

    #[tokio::test]
    async fn racing_amend_and_reverse_let_exactly_one_win() {
        let (plain, gated, gate, id) = gated_ledger().await;

        let amendment = tokio::spawn({
            let gated = Arc::clone(&gated);
            async move { gated.amend_transfer(amend(id, 50)).await }
        });
        gate.reached.notified().await;
        let reversal = tokio::spawn({
            let gated = Arc::clone(&gated);
            async move { gated.reverse_transfer(reverse(id)).await }
        });
        gate.reached.notified().await;

        // both read the same committed state; release them together
        gate.release.add_permits(2);
        let amended = amendment.await.unwrap();
        let reversed = reversal.await.unwrap();

        let conflicts = [amended.as_ref().err(), reversed.as_ref().err()]
            .into_iter()
            .flatten()
            .inspect(|err| assert_eq!(err.kind(), ErrorKind::ConcurrencyConflict))
            .count();
        assert_eq!(conflicts, 1);

        if amended.is_ok() {
            assert_eq!(balance(&plain, "alice").await, dec(450));
            assert_eq!(balance(&plain, "bob").await, dec(50));
            assert_eq!(
                plain.transfer(id).await.unwrap().transferred_amount(),
                dec(50)
            );
        } else {
            assert_eq!(balance(&plain, "alice").await, dec(500));
            assert_eq!(balance(&plain, "bob").await, dec(0));
            assert!(plain.transfers().await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn cancelled_operation_leaves_no_effect() {
        let (plain, gated, gate, id) = gated_ledger().await;

        let amendment = tokio::spawn({
            let gated = Arc::clone(&gated);
            async move { gated.amend_transfer(amend(id, 50)).await }
        });
        gate.reached.notified().await;
        amendment.abort();
        assert!(amendment.await.unwrap_err().is_cancelled());

        assert_eq!(balance(&plain, "alice").await, dec(300));
        assert_eq!(balance(&plain, "bob").await, dec(200));
        assert_eq!(
            plain.transfer(id).await.unwrap().transferred_amount(),
            dec(200)
        );
    }
}
