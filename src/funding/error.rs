use thiserror::Error;

use crate::ledger::LedgerError;
use crate::rails::RailError;

#[derive(Debug, Error)]
pub enum FundingError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("provider not configured for method {0}")]
    ProviderNotConfigured(String),

    #[error("rail error: {0}")]
    Rail(#[from] RailError),

    /// The rail reported settlement but the ledger post failed. Money
    /// has moved externally; an operator must resolve it.
    #[error("orphan settlement for intent {intent_id}: {reason}")]
    OrphanSettlement { intent_id: String, reason: String },

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl FundingError {
    pub fn code(&self) -> &'static str {
        match self {
            FundingError::Validation(_) => "VALIDATION",
            FundingError::NotFound(_) => "NOT_FOUND",
            FundingError::InvalidState(_) => "INVALID_STATE",
            FundingError::Duplicate(_) => "DUPLICATE",
            FundingError::ProviderNotConfigured(_) => "VALIDATION",
            FundingError::Rail(e) => e.code(),
            FundingError::OrphanSettlement { .. } => "INTERNAL",
            FundingError::Ledger(e) => e.code(),
            FundingError::Database(_) | FundingError::Serde(_) => "INTERNAL",
        }
    }
}
