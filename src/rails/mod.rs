//! Payment Rail Adapters
//!
//! One adapter per rail. Each owns its rail-local record store, speaks
//! the rail's protocol outward, and translates terminal states upward
//! into normalized funding events so the orchestrator never sees rail
//! grammar.
//!
//! The orchestrator and the adapters need each other; the cycle is cut
//! into two narrow capability sets. Adapters expose submit/status/
//! recall/refund to the orchestrator; the orchestrator exposes
//! [`FundingCallbacks`] to the adapters, injected after construction.

pub mod card;
pub mod fps;
pub mod http;
pub mod openbanking;
pub mod sepa;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::events::{FundingUpdateData, InboundCreditEvent};
use crate::funding::intent::FundingIntent;
use crate::funding::FundingError;
use crate::money::Money;

#[derive(Debug, Error)]
pub enum RailError {
    #[error("upstream unavailable: {0}")]
    Upstream(String),

    #[error("provider rejected request: {code}: {message}")]
    Rejected { code: String, message: String },

    #[error("payment not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl RailError {
    pub fn code(&self) -> &'static str {
        match self {
            RailError::Upstream(_) => "UPSTREAM_UNAVAILABLE",
            RailError::Rejected { .. } => "VALIDATION",
            RailError::NotFound(_) => "NOT_FOUND",
            RailError::InvalidState(_) => "INVALID_STATE",
            RailError::Database(_) | RailError::Serde(_) => "INTERNAL",
        }
    }

    /// Transient upstream trouble the caller may retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, RailError::Upstream(_))
    }
}

/// Poll result from a rail status query.
#[derive(Debug, Clone)]
pub struct RailStatus {
    pub status: String,
    pub settled_at: Option<DateTime<Utc>>,
}

/// FPS funding provider.
#[async_trait]
pub trait FpsProvider: Send + Sync {
    /// Register the expected payment with the provider. Returns the
    /// end-to-end id as the stable provider reference.
    async fn submit(&self, intent: &FundingIntent, attempt_id: &str) -> Result<String, RailError>;

    async fn get_status(&self, provider_ref: &str) -> Result<RailStatus, RailError>;
}

/// SEPA SCT funding provider.
#[async_trait]
pub trait SepaProvider: Send + Sync {
    /// Returns a composite provider reference `msg_id:pmt_inf_id`.
    async fn submit(&self, intent: &FundingIntent, attempt_id: &str) -> Result<String, RailError>;

    async fn get_status(&self, provider_ref: &str) -> Result<RailStatus, RailError>;
}

/// Open Banking payment initiation.
#[async_trait]
pub trait OpenBankingProvider: Send + Sync {
    /// Start the redirect flow. Returns `(auth_url, provider_ref)`.
    async fn initiate(&self, intent: &FundingIntent) -> Result<(String, String), RailError>;
}

/// Card acquiring.
#[async_trait]
pub trait CardProvider: Send + Sync {
    /// Charge a tokenized card. Returns the acquirer transaction id.
    async fn charge(
        &self,
        intent: &FundingIntent,
        card_token: &str,
        three_ds: Option<&ThreeDsData>,
    ) -> Result<String, RailError>;

    async fn capture(&self, transaction_id: &str) -> Result<(), RailError>;

    async fn refund(&self, transaction_id: &str, amount: &Money) -> Result<(), RailError>;
}

/// 3-D Secure authentication evidence passed through to the acquirer.
#[derive(Debug, Clone)]
pub struct ThreeDsData {
    pub version: String,
    pub cavv: String,
    pub eci: String,
    pub transaction_id: String,
}

/// The orchestrator capability injected into adapters.
#[async_trait]
pub trait FundingCallbacks: Send + Sync {
    /// A credit observed on a bank statement or settlement webhook,
    /// to be matched against an intent by reference.
    async fn process_inbound_credit(&self, event: &InboundCreditEvent)
        -> Result<(), FundingError>;

    /// Card capture outcome for a known intent.
    async fn process_card_payment(
        &self,
        tenant_id: &str,
        intent_id: &str,
        transaction_id: &str,
        captured: bool,
    ) -> Result<(), FundingError>;

    /// Post-settlement reversal (chargeback, recall, return).
    async fn process_chargeback(
        &self,
        tenant_id: &str,
        intent_id: &str,
        reason: &str,
    ) -> Result<(), FundingError>;

    /// Normalized terminal-state update from a rail that already knows
    /// the intent (Open Banking completion, FPS settlement webhooks).
    async fn process_funding_update(&self, update: &FundingUpdateData)
        -> Result<(), FundingError>;
}

/// Timestamp helper shared by adapters parsing provider payloads.
pub fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rail_error_codes() {
        assert_eq!(RailError::Upstream("down".into()).code(), "UPSTREAM_UNAVAILABLE");
        assert!(RailError::Upstream("down".into()).is_transient());
        assert_eq!(
            RailError::Rejected {
                code: "AC03".into(),
                message: "bad account".into()
            }
            .code(),
            "VALIDATION"
        );
        assert!(!RailError::NotFound("x".into()).is_transient());
    }

    #[test]
    fn test_parse_rfc3339() {
        let ts = parse_rfc3339("2026-03-01T12:30:00Z").unwrap();
        assert_eq!(ts.timestamp(), 1772368200);
        assert!(parse_rfc3339("not a date").is_none());
    }
}
