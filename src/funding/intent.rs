//! Funding Intent
//!
//! The orchestrator's primary aggregate: one customer request to move
//! money into a wallet. The status graph is narrow on purpose:
//!
//! ```text
//! created ──> pending ──> settled ──> reversed
//!    │            │
//!    ├────────────┴──> failed
//!    └──> expired     (created/pending only, after TTL)
//! ```
//!
//! `settled` may also be reached straight from `created` for rails where
//! the first signal we see is already the settlement (inbound bank
//! credits). Every other transition is INVALID_STATE.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use super::error::FundingError;
use crate::money::Money;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    #[serde(rename = "OPEN_BANKING")]
    OpenBanking,
    #[serde(rename = "SEPA")]
    Sepa,
    #[serde(rename = "FPS")]
    Fps,
    #[serde(rename = "CARD")]
    Card,
    #[serde(rename = "ACH")]
    Ach,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::OpenBanking => "OPEN_BANKING",
            Method::Sepa => "SEPA",
            Method::Fps => "FPS",
            Method::Card => "CARD",
            Method::Ach => "ACH",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "OPEN_BANKING" => Some(Method::OpenBanking),
            "SEPA" => Some(Method::Sepa),
            "FPS" => Some(Method::Fps),
            "CARD" => Some(Method::Card),
            "ACH" => Some(Method::Ach),
            _ => None,
        }
    }

    /// Rails where the customer pushes funds and we match the credit by
    /// reference.
    pub fn is_inbound_bank_rail(&self) -> bool {
        matches!(self, Method::Sepa | Method::Fps)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentStatus {
    Created,
    Pending,
    Settled,
    Failed,
    Expired,
    Reversed,
}

impl IntentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::Created => "created",
            IntentStatus::Pending => "pending",
            IntentStatus::Settled => "settled",
            IntentStatus::Failed => "failed",
            IntentStatus::Expired => "expired",
            IntentStatus::Reversed => "reversed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "created" => Some(IntentStatus::Created),
            "pending" => Some(IntentStatus::Pending),
            "settled" => Some(IntentStatus::Settled),
            "failed" => Some(IntentStatus::Failed),
            "expired" => Some(IntentStatus::Expired),
            "reversed" => Some(IntentStatus::Reversed),
            _ => None,
        }
    }

    /// No forward motion from these states. Reversal is a separate
    /// branch out of `settled`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IntentStatus::Settled
                | IntentStatus::Failed
                | IntentStatus::Expired
                | IntentStatus::Reversed
        )
    }
}

impl fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Bank account details returned for inbound transfers. The reference is
/// the token the customer must put on the payment so the credit can be
/// matched back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iban: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bic: Option<String>,
    pub reference: String,
}

/// A customer request to fund a wallet, across any rail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingIntent {
    pub id: String,
    pub tenant_id: String,
    pub wallet_id: String,
    pub customer_id: String,
    pub amount: Money,
    pub method: Method,
    pub status: IntentStatus,
    pub idempotency_key: String,

    // Rail artifacts, populated per method
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bank_details: Option<BankDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_session: Option<String>,

    // Tracking
    pub attempt_count: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reversed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reversal_reason: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_batch_id: Option<String>,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub error_code: String,
    #[serde(default)]
    pub error_message: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl FundingIntent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: &str,
        tenant_id: &str,
        wallet_id: &str,
        customer_id: &str,
        amount: Money,
        method: Method,
        idempotency_key: &str,
        expiry: Duration,
    ) -> Result<Self, FundingError> {
        if id.is_empty() {
            return Err(FundingError::Validation("id is required".into()));
        }
        if tenant_id.is_empty() {
            return Err(FundingError::Validation("tenant_id is required".into()));
        }
        if wallet_id.is_empty() {
            return Err(FundingError::Validation("wallet_id is required".into()));
        }
        if !amount.is_positive() {
            return Err(FundingError::Validation("amount must be positive".into()));
        }
        if idempotency_key.is_empty() {
            return Err(FundingError::Validation("idempotency_key is required".into()));
        }

        let now = Utc::now();
        Ok(Self {
            id: id.to_string(),
            tenant_id: tenant_id.to_string(),
            wallet_id: wallet_id.to_string(),
            customer_id: customer_id.to_string(),
            amount,
            method,
            status: IntentStatus::Created,
            idempotency_key: idempotency_key.to_string(),
            provider_ref: None,
            redirect_url: None,
            bank_details: None,
            payment_session: None,
            attempt_count: 0,
            last_attempt_at: None,
            settled_at: None,
            reversed_at: None,
            reversal_reason: String::new(),
            ledger_batch_id: None,
            metadata: HashMap::new(),
            error_code: String::new(),
            error_message: String::new(),
            created_at: now,
            updated_at: now,
            expires_at: Some(now + expiry),
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn mark_pending(&mut self, provider_ref: &str) -> Result<(), FundingError> {
        if self.status != IntentStatus::Created {
            return Err(FundingError::InvalidState(format!(
                "cannot mark {} intent pending",
                self.status
            )));
        }
        self.status = IntentStatus::Pending;
        self.provider_ref = Some(provider_ref.to_string());
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_settled(&mut self, ledger_batch_id: &str) -> Result<(), FundingError> {
        if !matches!(self.status, IntentStatus::Created | IntentStatus::Pending) {
            return Err(FundingError::InvalidState(format!(
                "cannot settle {} intent",
                self.status
            )));
        }
        let now = Utc::now();
        self.status = IntentStatus::Settled;
        self.ledger_batch_id = Some(ledger_batch_id.to_string());
        self.settled_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_failed(&mut self, error_code: &str, error_message: &str) -> Result<(), FundingError> {
        if !matches!(self.status, IntentStatus::Created | IntentStatus::Pending) {
            return Err(FundingError::InvalidState(format!(
                "cannot fail {} intent",
                self.status
            )));
        }
        self.status = IntentStatus::Failed;
        self.error_code = error_code.to_string();
        self.error_message = error_message.to_string();
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_expired(&mut self) -> Result<(), FundingError> {
        if !matches!(self.status, IntentStatus::Created | IntentStatus::Pending) {
            return Err(FundingError::InvalidState(format!(
                "cannot expire {} intent",
                self.status
            )));
        }
        self.status = IntentStatus::Expired;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_reversed(&mut self, reason: &str) -> Result<(), FundingError> {
        if self.status != IntentStatus::Settled {
            return Err(FundingError::InvalidState(format!(
                "cannot reverse {} intent",
                self.status
            )));
        }
        let now = Utc::now();
        self.status = IntentStatus::Reversed;
        self.reversed_at = Some(now);
        self.reversal_reason = reason.to_string();
        self.updated_at = now;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Pending,
    Submitted,
    Settled,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Pending => "pending",
            AttemptStatus::Submitted => "submitted",
            AttemptStatus::Settled => "settled",
            AttemptStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(AttemptStatus::Pending),
            "submitted" => Some(AttemptStatus::Submitted),
            "settled" => Some(AttemptStatus::Settled),
            "failed" => Some(AttemptStatus::Failed),
            _ => None,
        }
    }
}

/// One interaction with one rail for an intent. Retries across rails
/// produce further attempts with increasing `attempt_number`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingAttempt {
    pub id: String,
    pub intent_id: String,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_ref: Option<String>,
    pub status: AttemptStatus,
    pub attempt_number: i32,
    #[serde(default)]
    pub error_code: String,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub provider_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settled_at: Option<DateTime<Utc>>,
}

impl FundingAttempt {
    pub fn new(id: &str, intent_id: &str, provider: &str, attempt_number: i32) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            intent_id: intent_id.to_string(),
            provider: provider.to_string(),
            provider_ref: None,
            status: AttemptStatus::Pending,
            attempt_number,
            error_code: String::new(),
            error_message: String::new(),
            provider_data: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
            submitted_at: None,
            settled_at: None,
        }
    }

    pub fn mark_submitted(&mut self, provider_ref: &str) {
        let now = Utc::now();
        self.status = AttemptStatus::Submitted;
        self.provider_ref = Some(provider_ref.to_string());
        self.submitted_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_settled(&mut self) {
        let now = Utc::now();
        self.status = AttemptStatus::Settled;
        self.settled_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, error_code: &str, error_message: &str) {
        self.status = AttemptStatus::Failed;
        self.error_code = error_code.to_string();
        self.error_message = error_message.to_string();
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Currency;

    fn intent() -> FundingIntent {
        FundingIntent::new(
            "01J00000000000000000000001",
            "tenant-a",
            "wal-1",
            "cus-1",
            Money::new(1000, Currency::new("EUR")),
            Method::Sepa,
            "idem-1",
            Duration::hours(24),
        )
        .unwrap()
    }

    #[test]
    fn test_new_intent_defaults() {
        let i = intent();
        assert_eq!(i.status, IntentStatus::Created);
        assert!(i.expires_at.is_some());
        assert!(!i.is_terminal());
    }

    #[test]
    fn test_rejects_non_positive_amount() {
        let err = FundingIntent::new(
            "id",
            "t",
            "w",
            "c",
            Money::new(0, Currency::new("EUR")),
            Method::Card,
            "k",
            Duration::hours(24),
        )
        .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut i = intent();
        i.mark_pending("prov-1").unwrap();
        assert_eq!(i.status, IntentStatus::Pending);
        assert_eq!(i.provider_ref.as_deref(), Some("prov-1"));

        i.mark_settled("batch-1").unwrap();
        assert_eq!(i.status, IntentStatus::Settled);
        assert!(i.settled_at.is_some());
        assert_eq!(i.ledger_batch_id.as_deref(), Some("batch-1"));
    }

    #[test]
    fn test_settle_from_created_allowed() {
        // Inbound bank credits can settle an intent that never went pending.
        let mut i = intent();
        i.mark_settled("batch-1").unwrap();
        assert_eq!(i.status, IntentStatus::Settled);
    }

    #[test]
    fn test_settled_cannot_fail_or_expire() {
        let mut i = intent();
        i.mark_settled("batch-1").unwrap();
        assert_eq!(i.mark_failed("X", "y").unwrap_err().code(), "INVALID_STATE");
        assert_eq!(i.mark_expired().unwrap_err().code(), "INVALID_STATE");
    }

    #[test]
    fn test_reversal_only_from_settled() {
        let mut i = intent();
        assert_eq!(i.mark_reversed("fraud").unwrap_err().code(), "INVALID_STATE");

        i.mark_settled("batch-1").unwrap();
        i.mark_reversed("fraud").unwrap();
        assert_eq!(i.status, IntentStatus::Reversed);
        assert!(i.reversed_at.is_some());
        assert_eq!(i.reversal_reason, "fraud");

        // Reversal is itself terminal
        assert_eq!(i.mark_reversed("again").unwrap_err().code(), "INVALID_STATE");
    }

    #[test]
    fn test_failed_is_terminal() {
        let mut i = intent();
        i.mark_failed("CARD_DECLINED", "declined").unwrap();
        assert!(i.is_terminal());
        assert_eq!(i.mark_pending("p").unwrap_err().code(), "INVALID_STATE");
        assert_eq!(i.mark_settled("b").unwrap_err().code(), "INVALID_STATE");
    }

    #[test]
    fn test_expire_from_pending() {
        let mut i = intent();
        i.mark_pending("prov-1").unwrap();
        i.mark_expired().unwrap();
        assert_eq!(i.status, IntentStatus::Expired);
    }

    #[test]
    fn test_attempt_lifecycle() {
        let mut attempt = FundingAttempt::new("a1", "i1", "sepa", 1);
        assert_eq!(attempt.status, AttemptStatus::Pending);

        attempt.mark_submitted("MSG1:PMT1");
        assert_eq!(attempt.status, AttemptStatus::Submitted);
        assert!(attempt.submitted_at.is_some());

        attempt.mark_failed("UPSTREAM_UNAVAILABLE", "timeout");
        assert_eq!(attempt.status, AttemptStatus::Failed);
        assert_eq!(attempt.error_code, "UPSTREAM_UNAVAILABLE");
    }

    #[test]
    fn test_method_round_trip() {
        for m in [
            Method::OpenBanking,
            Method::Sepa,
            Method::Fps,
            Method::Card,
            Method::Ach,
        ] {
            assert_eq!(Method::from_str(m.as_str()), Some(m));
        }
        assert_eq!(Method::from_str("WIRE"), None);
        assert!(Method::Sepa.is_inbound_bank_rail());
        assert!(!Method::Card.is_inbound_bank_rail());
    }
}
