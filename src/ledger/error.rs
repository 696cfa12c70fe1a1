use thiserror::Error;

use crate::money::MoneyError;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("parent mismatch: {0}")]
    ParentMismatch(String),

    #[error("placeholder account cannot take entries: {0}")]
    PlaceholderAccount(String),

    #[error("batch is not balanced: debits={debits} credits={credits}")]
    Unbalanced { debits: i64, credits: i64 },

    #[error("currency mismatch: {0}")]
    CurrencyMismatch(String),

    #[error("batch is not posted: {0}")]
    NotPosted(String),

    #[error("batch already reversed: {0}")]
    AlreadyReversed(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("serialization failure, retry exhausted")]
    SerializationFailure,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<MoneyError> for LedgerError {
    fn from(err: MoneyError) -> Self {
        match err {
            MoneyError::CurrencyMismatch { .. } => LedgerError::CurrencyMismatch(err.to_string()),
            MoneyError::Overflow => LedgerError::Validation(err.to_string()),
        }
    }
}

impl LedgerError {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::Validation(_) => "VALIDATION",
            LedgerError::NotFound(_) => "NOT_FOUND",
            LedgerError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            LedgerError::Duplicate(_) => "DUPLICATE",
            LedgerError::ParentMismatch(_) => "PARENT_MISMATCH",
            LedgerError::PlaceholderAccount(_) => "PLACEHOLDER_ACCOUNT",
            LedgerError::Unbalanced { .. } => "UNBALANCED",
            LedgerError::CurrencyMismatch(_) => "CURRENCY_MISMATCH",
            LedgerError::NotPosted(_) => "NOT_POSTED",
            LedgerError::AlreadyReversed(_) => "ALREADY_REVERSED",
            LedgerError::InvalidState(_) => "INVALID_STATE",
            LedgerError::SerializationFailure => "SERIALIZATION_FAILURE",
            LedgerError::Database(_) | LedgerError::Serde(_) => "INTERNAL",
        }
    }

    /// True when the caller may retry the operation as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::SerializationFailure)
    }
}
