//! Wallet Funding Pipeline
//!
//! The orchestrator over funding intents: idempotent creation, inbound
//! credit matching, settlement into the ledger, reversal, and expiry.

pub mod error;
pub mod intent;
pub mod matching;
pub mod service;
pub mod store;
pub mod worker;

#[cfg(test)]
mod integration_tests;

pub use error::FundingError;
pub use intent::{
    AttemptStatus, BankDetails, FundingAttempt, FundingIntent, IntentStatus, Method,
};
pub use service::{CreateIntentRequest, CreateIntentResponse, FundingService};
pub use store::{FundingStore, MemoryFundingStore, PostgresFundingStore};
pub use worker::{ExpiryWorker, ExpiryWorkerConfig};
