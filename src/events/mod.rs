//! Domain Events
//!
//! Every message that crosses a component boundary is wrapped in an
//! [`Envelope`]. The `data` payload is opaque JSON whose schema is
//! selected by `event_type`; typed payload structs for the known types
//! live here so producers and consumers share one definition.

pub mod bus;

pub use bus::{BroadcastBus, EventPublisher, RecordingPublisher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::money::Money;

// Event types carried in Envelope::event_type.
pub const EVENT_INTENT_CREATED: &str = "funding.intent.created";
pub const EVENT_FUNDING_PENDING: &str = "funding.pending";
pub const EVENT_FUNDING_SETTLED: &str = "funding.settled";
pub const EVENT_FUNDING_FAILED: &str = "funding.failed";
pub const EVENT_FUNDING_EXPIRED: &str = "funding.expired";
pub const EVENT_FUNDING_REVERSED: &str = "funding.reversed";
pub const EVENT_INBOUND_CREDIT: &str = "bank.inbound_credit";
pub const EVENT_LEDGER_BATCH_POSTED: &str = "ledger.batch.posted";
pub const EVENT_RECON_MISMATCH: &str = "recon.mismatch.detected";

/// Common wrapper for every event on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub tenant_id: String,
    pub correlation_id: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new<T: Serialize>(
        event_type: &str,
        tenant_id: &str,
        aggregate_type: &str,
        aggregate_id: &str,
        data: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: Ulid::new().to_string(),
            event_type: event_type.to_string(),
            tenant_id: tenant_id.to_string(),
            correlation_id: aggregate_id.to_string(),
            aggregate_type: aggregate_type.to_string(),
            aggregate_id: aggregate_id.to_string(),
            timestamp: Utc::now(),
            data: serde_json::to_value(data)?,
        })
    }

    pub fn with_correlation(mut self, correlation_id: &str) -> Self {
        self.correlation_id = correlation_id.to_string();
        self
    }

    /// Decode the payload into its typed form.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}

/// Published when a funding intent is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentCreatedData {
    pub intent_id: String,
    pub wallet_id: String,
    pub customer_id: String,
    pub amount: Money,
    pub method: String,
    pub idempotency_key: String,
}

/// Normalized lifecycle update from any rail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingUpdateData {
    pub intent_id: String,
    pub wallet_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_ref: Option<String>,
    pub rail: String,
    pub amount: Money,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_batch_id: Option<String>,
}

/// A credit observed on a bank statement (SEPA/FPS inbound).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundCreditEvent {
    pub statement_id: String,
    pub rail: String,
    pub reference: String,
    pub amount: Money,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_account: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Published when reconciliation finds a discrepancy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconMismatchData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_id: Option<String>,
    pub statement_ref: String,
    pub expected_amount: Money,
    pub actual_amount: Money,
    /// "amount", "duplicate", or "orphan_settlement"
    pub mismatch_type: String,
    pub detected_at: DateTime<Utc>,
}

/// Published after a ledger batch commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerBatchPostedData {
    pub batch_id: String,
    pub source_type: String,
    pub source_id: String,
    pub entry_count: usize,
    pub total_debits: i64,
    pub total_credits: i64,
    pub currency: String,
}

/// Instruction to the ledger from the funding orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerPostCommand {
    pub intent_id: String,
    pub tenant_id: String,
    pub wallet_id: String,
    pub amount: Money,
    pub source_type: String,
    pub source_id: String,
    pub reference: String,
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Currency;

    #[test]
    fn test_envelope_round_trip() {
        let data = IntentCreatedData {
            intent_id: "01J0000000000000000000000".to_string(),
            wallet_id: "wal_1".to_string(),
            customer_id: "cus_1".to_string(),
            amount: Money::new(1000, Currency::new("EUR")),
            method: "SEPA".to_string(),
            idempotency_key: "k1".to_string(),
        };

        let env = Envelope::new(
            EVENT_INTENT_CREATED,
            "tenant-a",
            "funding_intent",
            &data.intent_id,
            &data,
        )
        .unwrap();

        assert_eq!(env.event_type, EVENT_INTENT_CREATED);
        assert_eq!(env.aggregate_id, data.intent_id);
        assert_eq!(env.correlation_id, data.intent_id);
        assert!(!env.id.is_empty());

        let decoded: IntentCreatedData = env.decode().unwrap();
        assert_eq!(decoded.amount.amount_minor, 1000);
        assert_eq!(decoded.idempotency_key, "k1");
    }

    #[test]
    fn test_envelope_ids_are_unique() {
        let a = Envelope::new(EVENT_FUNDING_SETTLED, "t", "funding_intent", "i1", &()).unwrap();
        let b = Envelope::new(EVENT_FUNDING_SETTLED, "t", "funding_intent", "i1", &()).unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_type_field_rename() {
        let env = Envelope::new(EVENT_RECON_MISMATCH, "t", "funding_intent", "i1", &()).unwrap();
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], EVENT_RECON_MISMATCH);
    }
}
