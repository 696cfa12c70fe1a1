//! UK Faster Payments Adapter
//!
//! State machine per payment: SUBMITTED -> ACCEPTED -> SETTLED, with
//! FAILED as the error exit and RECALLED/RETURNED reachable only after
//! settlement. The `end_to_end_id` is the natural key everywhere: it
//! deduplicates webhooks and is the provider reference handed upward.

pub mod store;
pub mod webhook;

pub use store::{FpsStore, MemoryFpsStore, PostgresFpsStore};
pub use webhook::{FpsWebhookHandler, FpsWebhookPayload};

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use ulid::Ulid;

use super::http::RailHttpClient;
use super::{parse_rfc3339, FundingCallbacks, FpsProvider, RailError, RailStatus};
use crate::config::RailConfig;
use crate::funding::intent::FundingIntent;

/// FPS recall window, measured from settlement.
pub const RECALL_WINDOW_MINUTES: i64 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FpsStatus {
    Submitted,
    Accepted,
    Settled,
    Failed,
    Recalled,
    Returned,
}

impl FpsStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FpsStatus::Submitted => "SUBMITTED",
            FpsStatus::Accepted => "ACCEPTED",
            FpsStatus::Settled => "SETTLED",
            FpsStatus::Failed => "FAILED",
            FpsStatus::Recalled => "RECALLED",
            FpsStatus::Returned => "RETURNED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "SUBMITTED" => Some(FpsStatus::Submitted),
            "ACCEPTED" => Some(FpsStatus::Accepted),
            "SETTLED" => Some(FpsStatus::Settled),
            "FAILED" => Some(FpsStatus::Failed),
            "RECALLED" => Some(FpsStatus::Recalled),
            "RETURNED" => Some(FpsStatus::Returned),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, FpsStatus::Submitted | FpsStatus::Accepted)
    }
}

/// FPS payment record, keyed by `end_to_end_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FpsPayment {
    pub id: String,
    pub attempt_id: String,
    pub intent_id: String,
    pub end_to_end_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_payment_id: Option<String>,
    /// Matching reference issued with the intent's bank details.
    pub reference: String,
    pub amount_minor: i64,
    pub currency: String,
    pub status: FpsStatus,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recalled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recall_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returned_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Raw provider payloads, kept for audit only.
    #[serde(default)]
    pub response_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct SubmitRequest {
    end_to_end_id: String,
    amount_minor: i64,
    currency: String,
    reference: String,
    sort_code: String,
    account_number: String,
    intent_id: String,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    provider_payment_id: String,
    status: String,
    #[serde(default)]
    #[allow(dead_code)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    settled_at: Option<String>,
}

pub struct FpsAdapter {
    config: RailConfig,
    http: RailHttpClient,
    store: Arc<dyn FpsStore>,
    callbacks: RwLock<Option<Arc<dyn FundingCallbacks>>>,
}

impl FpsAdapter {
    pub fn new(config: RailConfig, store: Arc<dyn FpsStore>) -> Self {
        let http = RailHttpClient::new(&config.base_url, &config.api_key, config.timeout());
        Self {
            config,
            http,
            store,
            callbacks: RwLock::new(None),
        }
    }

    /// Inject the orchestrator capability (called once at wiring).
    pub fn set_callbacks(&self, callbacks: Arc<dyn FundingCallbacks>) {
        *self.callbacks.write().unwrap() = Some(callbacks);
    }

    fn callbacks(&self) -> Option<Arc<dyn FundingCallbacks>> {
        self.callbacks.read().unwrap().clone()
    }

    pub fn webhook_path(&self) -> &str {
        &self.config.webhook_path
    }

    /// Sender-initiated recall of a settled payment. FPS gives roughly
    /// fifteen minutes from settlement.
    pub async fn recall(&self, end_to_end_id: &str, reason: &str) -> Result<(), RailError> {
        let payment = self
            .store
            .get_by_end_to_end_id(end_to_end_id)
            .await?
            .ok_or_else(|| RailError::NotFound(end_to_end_id.to_string()))?;

        if payment.status != FpsStatus::Settled {
            return Err(RailError::InvalidState(format!(
                "can only recall settled payments, current status {}",
                payment.status.as_str()
            )));
        }

        let settled_at = payment
            .settled_at
            .ok_or_else(|| RailError::InvalidState("settled payment without settled_at".into()))?;
        if Utc::now() - settled_at > Duration::minutes(RECALL_WINDOW_MINUTES) {
            return Err(RailError::InvalidState(format!(
                "recall window expired (settled at {settled_at})"
            )));
        }

        let body = serde_json::json!({ "reason": reason });
        let _: serde_json::Value = self
            .http
            .post_json(&format!("/payments/{end_to_end_id}/recall"), &body)
            .await?;

        self.store
            .mark_recalled(end_to_end_id, reason, Utc::now())
            .await?;

        info!(end_to_end_id = %end_to_end_id, reason = %reason, "FPS recall initiated");

        if let Some(callbacks) = self.callbacks() {
            if let Err(e) = callbacks
                .process_chargeback("", &payment.intent_id, &format!("FPS recall: {reason}"))
                .await
            {
                warn!(intent_id = %payment.intent_id, error = %e, "Recall reversal failed");
            }
        }

        Ok(())
    }
}

#[async_trait]
impl FpsProvider for FpsAdapter {
    async fn submit(&self, intent: &FundingIntent, attempt_id: &str) -> Result<String, RailError> {
        let end_to_end_id = format!("E2E{}", Ulid::new());
        let details = intent.bank_details.as_ref();
        let reference = details.map(|d| d.reference.clone()).unwrap_or_default();

        let payment = FpsPayment {
            id: Ulid::new().to_string(),
            attempt_id: attempt_id.to_string(),
            intent_id: intent.id.clone(),
            end_to_end_id: end_to_end_id.clone(),
            provider_payment_id: None,
            reference: reference.clone(),
            amount_minor: intent.amount.amount_minor,
            currency: intent.amount.currency.as_str().to_string(),
            status: FpsStatus::Submitted,
            submitted_at: Utc::now(),
            accepted_at: None,
            settled_at: None,
            recalled_at: None,
            recall_reason: None,
            returned_at: None,
            return_reason: None,
            error_code: None,
            error_message: None,
            response_data: serde_json::Value::Null,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.store.create(&payment).await?;

        let request = SubmitRequest {
            end_to_end_id: end_to_end_id.clone(),
            amount_minor: intent.amount.amount_minor,
            currency: intent.amount.currency.as_str().to_string(),
            reference,
            sort_code: details.and_then(|d| d.sort_code.clone()).unwrap_or_default(),
            account_number: details
                .and_then(|d| d.account_number.clone())
                .unwrap_or_default(),
            intent_id: intent.id.clone(),
        };

        info!(
            intent_id = %intent.id,
            end_to_end_id = %end_to_end_id,
            amount = intent.amount.amount_minor,
            "Submitting FPS payment"
        );

        match self
            .http
            .post_json::<_, SubmitResponse>("/payments", &request)
            .await
        {
            Ok(response) => {
                let status =
                    FpsStatus::from_str(&response.status).unwrap_or(FpsStatus::Submitted);
                self.store
                    .update_status(
                        &end_to_end_id,
                        status,
                        Some(&response.provider_payment_id),
                        serde_json::json!({ "submit": { "status": response.status } }),
                    )
                    .await?;
                Ok(end_to_end_id)
            }
            Err(e) => {
                self.store
                    .mark_failed(&end_to_end_id, "SUBMIT_ERROR", &e.to_string())
                    .await?;
                Err(e)
            }
        }
    }

    async fn get_status(&self, provider_ref: &str) -> Result<RailStatus, RailError> {
        let response: StatusResponse = self
            .http
            .get_json(&format!("/payments/{provider_ref}"))
            .await?;

        Ok(RailStatus {
            status: response.status,
            settled_at: response.settled_at.as_deref().and_then(parse_rfc3339),
        })
    }
}
