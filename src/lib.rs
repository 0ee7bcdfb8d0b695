/// Customer balances. State is modified using events, which are created by
/// handling postings against the current balance.
pub mod customer;

/// Transfer records and their lifecycle: creation, amendment, soft delete,
/// and the balance postings each of those implies.
pub mod transaction;

/// Pure balance checks run before any mutation.
pub mod invariant;

/// Validated transfer commands that later are executed by [`engine`].
pub mod command;

/// Ledger store interface, plus "in memory" implementation.
///
/// The engine only talks to the [`store::LedgerStore`] trait, so a relational
/// backend can replace the in memory one without touching transfer logic.
pub mod store;

/// Coordinates reads, checks and writes of every transfer operation inside a
/// single store transaction.
pub mod engine;

pub mod config;
pub mod error;
pub mod result;

/// Bootstraps [`engine`] from CSV input. Lives here so integration tests can
/// drive it the same way the binary does.
pub mod bin_utils;

mod audit;

pub use audit::Audit;
