//! This module could be a separate crate on its own, to bootstrap [`crate::engine`]
//! within binary, but it is kept here so integration tests can replay the same files.

use std::{
    collections::HashMap,
    io::{Read, Write},
};

use crate::{
    command::{
        AmendTransferCommand, CreateTransferCommand, OpenCustomerCommand, ReverseTransferCommand,
        TransferKind,
    },
    config::EngineConfig,
    customer::CustomerId,
    engine::TransferEngine,
    error::TransferError,
    store::in_memory::InMemoryLedgerStore,
    transaction::TransactionId,
};
use anyhow::{Context, Result};
use csv_parser::{CsvRowParser, CustomerRow, TransferRow};
use csv_printer::{CustomerBalance, print_customers};
use thiserror::Error;
use tracing::debug;

pub mod csv_parser;
pub mod csv_printer;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("Malformed row: {0}")]
    Parse(#[from] csv::Error),
    #[error("Transfer label {0} was already used")]
    DuplicateLabel(u32),
    #[error("Transfer label {0} does not refer to a created transfer")]
    UnknownLabel(u32),
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

pub struct Service<'w, C, T, W: 'w> {
    pub customers: C,
    pub transfers: T,
    pub output: &'w mut W,
    pub config: EngineConfig,
    pub error_printer: Box<dyn FnMut(u64, ReplayError)>,
}

impl<'w, C, T, W> Service<'w, C, T, W>
where
    C: Read,
    T: Read,
    W: Write + 'w,
{
    pub async fn run(mut self) -> Result<()> {
        let engine = TransferEngine::new(InMemoryLedgerStore::new(), self.config.clone());

        for (line, row) in CsvRowParser::<_, CustomerRow>::new(self.customers) {
            let row = row.with_context(|| format!("Malformed customer at line {line}"))?;
            let command =
                OpenCustomerCommand::parse(CustomerId::new(row.customer), row.balance, None, None)
                    .with_context(|| format!("Invalid customer at line {line}"))?;
            engine
                .open_customer(command)
                .await
                .with_context(|| format!("Failed to open customer at line {line}"))?;
        }

        let mut labels = HashMap::new();
        for (line, row) in CsvRowParser::<_, TransferRow>::new(self.transfers) {
            let outcome = match row {
                Ok(row) => replay(&engine, &mut labels, row).await,
                Err(err) => Err(err.into()),
            };
            if let Err(err) = outcome {
                (self.error_printer)(line, err);
            }
        }

        let customers = engine.customers().await?;
        print_customers(
            self.output,
            customers.into_iter().map(|customer| CustomerBalance {
                customer: customer.id().to_string(),
                balance: customer.balance(),
                active: customer.is_active(),
            }),
        )
    }
}

async fn replay(
    engine: &TransferEngine<InMemoryLedgerStore>,
    labels: &mut HashMap<u32, TransactionId>,
    row: TransferRow,
) -> Result<(), ReplayError> {
    let by = Some("replay".to_string());
    match row.kind {
        TransferKind::Create => {
            if labels.contains_key(&row.tx) {
                return Err(ReplayError::DuplicateLabel(row.tx));
            }
            let command = CreateTransferCommand::parse(
                customer_id(row.sender),
                customer_id(row.recipient),
                row.amount,
                by,
            )
            .map_err(TransferError::from)?;
            let id = engine.create_transfer(command).await?;
            debug!(label = row.tx, transaction = %id, "label bound");
            labels.insert(row.tx, id);
        }
        TransferKind::Amend => {
            let id = *labels.get(&row.tx).ok_or(ReplayError::UnknownLabel(row.tx))?;
            let command = AmendTransferCommand::parse(
                id,
                row.amount,
                row.sender.map(CustomerId::new),
                row.recipient.map(CustomerId::new),
                by,
            )
            .map_err(TransferError::from)?;
            engine.amend_transfer(command).await?;
        }
        TransferKind::Reverse => {
            let id = *labels.get(&row.tx).ok_or(ReplayError::UnknownLabel(row.tx))?;
            let command = ReverseTransferCommand::parse(id, by).map_err(TransferError::from)?;
            engine.reverse_transfer(command).await?;
        }
    }
    Ok(())
}

fn customer_id(id: Option<String>) -> CustomerId {
    CustomerId::new(id.unwrap_or_default())
}
