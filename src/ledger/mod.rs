//! Double-Entry Ledger
//!
//! Append-only book of balanced batches. Accounts are tenant-scoped;
//! every batch commits atomically with debits equal to credits, and the
//! per-account running balance lives on the latest entry.

pub mod error;
pub mod models;
pub mod service;
pub mod store;

pub use error::LedgerError;
pub use models::{
    calculate_balance, signed_contribution, system_accounts, Account, AccountStatus, AccountType,
    Batch, BatchBuilder, BatchStatus, Entry, EntryType, NormalBalance, Position, SourceType,
};
pub use service::{CreateAccountRequest, EntryRequest, LedgerService, PostEntriesRequest};
pub use store::{LedgerStore, MemoryLedgerStore, PostgresLedgerStore};
