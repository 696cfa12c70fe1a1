//! SEPA SCT Adapter
//!
//! State machine per payment: SUBMITTED -> ACCEPTED -> SETTLED, with
//! REJECTED as the scheme refusal and RECALLED/RETURNED reachable after
//! settlement. The natural key is `(msg_id, pmt_inf_id)`; the provider
//! reference handed upward is the composite `msg_id:pmt_inf_id`.
//!
//! Authoritative settlement evidence arrives as ISO 20022 report files
//! (camt.053 statements, pain.002 status reports) handled in
//! [`report`].

pub mod report;
pub mod store;

pub use report::{ReportIngester, StatusUpdate};
pub use store::{
    MemorySepaReportStore, MemorySepaStore, PostgresSepaReportStore, PostgresSepaStore,
    ReportStatus, SepaReport, SepaReportStore, SepaStore,
};

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use ulid::Ulid;

use super::http::RailHttpClient;
use super::{parse_rfc3339, FundingCallbacks, RailError, RailStatus, SepaProvider};
use crate::config::SepaConfig;
use crate::funding::intent::FundingIntent;

/// SEPA SCT recall window, measured in days from settlement.
pub const RECALL_WINDOW_DAYS: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SepaStatus {
    Submitted,
    Accepted,
    Settled,
    Rejected,
    Recalled,
    Returned,
}

impl SepaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SepaStatus::Submitted => "SUBMITTED",
            SepaStatus::Accepted => "ACCEPTED",
            SepaStatus::Settled => "SETTLED",
            SepaStatus::Rejected => "REJECTED",
            SepaStatus::Recalled => "RECALLED",
            SepaStatus::Returned => "RETURNED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "SUBMITTED" => Some(SepaStatus::Submitted),
            "ACCEPTED" => Some(SepaStatus::Accepted),
            "SETTLED" => Some(SepaStatus::Settled),
            "REJECTED" => Some(SepaStatus::Rejected),
            "RECALLED" => Some(SepaStatus::Recalled),
            "RETURNED" => Some(SepaStatus::Returned),
            _ => None,
        }
    }
}

/// ISO 20022 recall reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SepaRecallReason {
    /// DUPL - duplicate payment
    Duplicate,
    /// FRAD - fraudulent origin
    Fraud,
    /// TECH - technical problems
    TechnicalIssue,
    /// CUST - customer requested
    CustomerRequest,
    /// AM09 - wrong amount
    WrongAmount,
    /// AC03 - wrong account
    WrongAccount,
}

impl SepaRecallReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SepaRecallReason::Duplicate => "DUPL",
            SepaRecallReason::Fraud => "FRAD",
            SepaRecallReason::TechnicalIssue => "TECH",
            SepaRecallReason::CustomerRequest => "CUST",
            SepaRecallReason::WrongAmount => "AM09",
            SepaRecallReason::WrongAccount => "AC03",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "DUPL" => Some(SepaRecallReason::Duplicate),
            "FRAD" => Some(SepaRecallReason::Fraud),
            "TECH" => Some(SepaRecallReason::TechnicalIssue),
            "CUST" => Some(SepaRecallReason::CustomerRequest),
            "AM09" => Some(SepaRecallReason::WrongAmount),
            "AC03" => Some(SepaRecallReason::WrongAccount),
            _ => None,
        }
    }
}

/// SEPA payment record, keyed by `(msg_id, pmt_inf_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SepaPayment {
    pub id: String,
    pub attempt_id: String,
    pub intent_id: String,
    pub msg_id: String,
    pub pmt_inf_id: String,
    pub end_to_end_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iban: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bic: Option<String>,
    pub amount_minor: i64,
    pub currency: String,
    pub status: SepaStatus,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recalled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recall_reason: Option<SepaRecallReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recall_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recall_additional_info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returned_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_reason_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_reason_desc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_report_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_report_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub response_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Split a composite provider reference back into `(msg_id, pmt_inf_id)`.
pub fn split_provider_ref(provider_ref: &str) -> Result<(&str, &str), RailError> {
    provider_ref.split_once(':').ok_or_else(|| {
        RailError::InvalidState("invalid provider ref, expected msg_id:pmt_inf_id".into())
    })
}

#[derive(Debug, Serialize)]
struct SubmitRequest {
    msg_id: String,
    pmt_inf_id: String,
    end_to_end_id: String,
    amount_minor: i64,
    currency: String,
    creditor_iban: String,
    creditor_bic: String,
    reference: String,
    intent_id: String,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
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

#[derive(Debug, Serialize)]
struct RecallRequest {
    msg_id: String,
    pmt_inf_id: String,
    reason: String,
    additional_info: String,
}

#[derive(Debug, Deserialize)]
pub struct RecallResponse {
    pub recall_ref: String,
    /// ACCEPTED, PENDING or REJECTED
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// An inbound pacs.004-style return notification.
#[derive(Debug, Clone, Deserialize)]
pub struct ReturnNotification {
    pub original_msg_id: String,
    pub original_pmt_inf_id: String,
    /// AC03, AM04, ...
    pub return_reason: String,
    #[serde(default)]
    pub return_reason_desc: String,
    pub returned_at: Option<String>,
    pub amount_minor: i64,
}

pub struct SepaAdapter {
    config: SepaConfig,
    http: RailHttpClient,
    store: Arc<dyn SepaStore>,
    callbacks: RwLock<Option<Arc<dyn FundingCallbacks>>>,
}

impl SepaAdapter {
    pub fn new(config: SepaConfig, store: Arc<dyn SepaStore>) -> Self {
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

    pub fn report_poll_interval(&self) -> std::time::Duration {
        self.config.report_poll_interval()
    }

    /// Initiate an SCT recall. The scheme allows ten days from
    /// settlement.
    pub async fn recall(
        &self,
        msg_id: &str,
        pmt_inf_id: &str,
        reason: SepaRecallReason,
        additional_info: &str,
    ) -> Result<RecallResponse, RailError> {
        let payment = self
            .store
            .get_by_msg_and_pmt_inf(msg_id, pmt_inf_id)
            .await?
            .ok_or_else(|| RailError::NotFound(format!("{msg_id}:{pmt_inf_id}")))?;

        if !matches!(payment.status, SepaStatus::Settled | SepaStatus::Accepted) {
            return Err(RailError::InvalidState(format!(
                "can only recall settled or accepted payments, current status {}",
                payment.status.as_str()
            )));
        }

        if let Some(settled_at) = payment.settled_at {
            if Utc::now() - settled_at > Duration::days(RECALL_WINDOW_DAYS) {
                return Err(RailError::InvalidState(format!(
                    "recall window expired (settled at {settled_at})"
                )));
            }
        }

        info!(
            msg_id = %msg_id,
            pmt_inf_id = %pmt_inf_id,
            reason = reason.as_str(),
            "Initiating SEPA recall"
        );

        let request = RecallRequest {
            msg_id: msg_id.to_string(),
            pmt_inf_id: pmt_inf_id.to_string(),
            reason: reason.as_str().to_string(),
            additional_info: additional_info.to_string(),
        };
        let response: RecallResponse = self.http.post_json("/payments/recall", &request).await?;

        if matches!(response.status.as_str(), "ACCEPTED" | "PENDING") {
            self.store
                .mark_recalled(
                    msg_id,
                    pmt_inf_id,
                    &response.recall_ref,
                    reason,
                    additional_info,
                    Utc::now(),
                )
                .await?;
        }

        info!(
            msg_id = %msg_id,
            pmt_inf_id = %pmt_inf_id,
            recall_ref = %response.recall_ref,
            status = %response.status,
            "SEPA recall initiated"
        );

        Ok(response)
    }

    /// Process an inbound return of a previously settled payment. The
    /// rail record flips to RETURNED and the funding side posts the
    /// compensating reversal.
    pub async fn handle_return(&self, notification: &ReturnNotification) -> Result<(), RailError> {
        info!(
            original_msg_id = %notification.original_msg_id,
            original_pmt_inf_id = %notification.original_pmt_inf_id,
            return_reason = %notification.return_reason,
            "Processing SEPA return"
        );

        let payment = self
            .store
            .get_by_msg_and_pmt_inf(
                &notification.original_msg_id,
                &notification.original_pmt_inf_id,
            )
            .await?
            .ok_or_else(|| {
                RailError::NotFound(format!(
                    "{}:{}",
                    notification.original_msg_id, notification.original_pmt_inf_id
                ))
            })?;

        let returned_at = notification
            .returned_at
            .as_deref()
            .and_then(parse_rfc3339)
            .unwrap_or_else(Utc::now);

        let transitioned = self
            .store
            .mark_returned(
                &notification.original_msg_id,
                &notification.original_pmt_inf_id,
                &notification.return_reason,
                returned_at,
            )
            .await?;

        if !transitioned {
            warn!(
                msg_id = %notification.original_msg_id,
                pmt_inf_id = %notification.original_pmt_inf_id,
                current_status = payment.status.as_str(),
                "Return for payment not in a returnable state, ignoring"
            );
            return Ok(());
        }

        if let Some(callbacks) = self.callbacks() {
            if !payment.intent_id.is_empty() {
                let reason = format!(
                    "SEPA return: {} - {}",
                    notification.return_reason, notification.return_reason_desc
                );
                if let Err(e) = callbacks
                    .process_chargeback("", &payment.intent_id, &reason)
                    .await
                {
                    warn!(
                        intent_id = %payment.intent_id,
                        error = %e,
                        "Return reversal failed"
                    );
                }
            }
        }

        info!(
            msg_id = %notification.original_msg_id,
            pmt_inf_id = %notification.original_pmt_inf_id,
            amount = notification.amount_minor,
            "SEPA payment returned"
        );

        Ok(())
    }
}

#[async_trait]
impl SepaProvider for SepaAdapter {
    async fn submit(&self, intent: &FundingIntent, attempt_id: &str) -> Result<String, RailError> {
        let msg_id = format!("MSG{}", Ulid::new());
        let pmt_inf_id = format!("PMT{}", Ulid::new());
        let end_to_end_id = format!("E2E{}", Ulid::new());

        let details = intent.bank_details.as_ref();
        let iban = details.and_then(|d| d.iban.clone());
        let bic = details.and_then(|d| d.bic.clone());
        let reference = details.map(|d| d.reference.clone()).unwrap_or_default();

        let payment = SepaPayment {
            id: Ulid::new().to_string(),
            attempt_id: attempt_id.to_string(),
            intent_id: intent.id.clone(),
            msg_id: msg_id.clone(),
            pmt_inf_id: pmt_inf_id.clone(),
            end_to_end_id: end_to_end_id.clone(),
            iban: iban.clone(),
            bic: bic.clone(),
            amount_minor: intent.amount.amount_minor,
            currency: intent.amount.currency.as_str().to_string(),
            status: SepaStatus::Submitted,
            submitted_at: Utc::now(),
            accepted_at: None,
            settled_at: None,
            recalled_at: None,
            recall_reason: None,
            recall_ref: None,
            recall_additional_info: None,
            returned_at: None,
            return_reason: None,
            reject_reason_code: None,
            reject_reason_desc: None,
            last_report_id: None,
            last_report_at: None,
            response_data: serde_json::Value::Null,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.store.create(&payment).await?;

        let request = SubmitRequest {
            msg_id: msg_id.clone(),
            pmt_inf_id: pmt_inf_id.clone(),
            end_to_end_id,
            amount_minor: intent.amount.amount_minor,
            currency: intent.amount.currency.as_str().to_string(),
            creditor_iban: iban.unwrap_or_default(),
            creditor_bic: bic.unwrap_or_default(),
            reference,
            intent_id: intent.id.clone(),
        };

        info!(
            intent_id = %intent.id,
            msg_id = %msg_id,
            pmt_inf_id = %pmt_inf_id,
            amount = intent.amount.amount_minor,
            "Submitting SEPA payment"
        );

        match self
            .http
            .post_json::<_, SubmitResponse>("/payments", &request)
            .await
        {
            Ok(response) => {
                let status =
                    SepaStatus::from_str(&response.status).unwrap_or(SepaStatus::Submitted);
                self.store
                    .update_status(
                        &msg_id,
                        &pmt_inf_id,
                        status,
                        serde_json::json!({ "submit": { "status": response.status } }),
                    )
                    .await?;
                Ok(format!("{msg_id}:{pmt_inf_id}"))
            }
            Err(e) => {
                self.store
                    .mark_rejected(&msg_id, &pmt_inf_id, "SUBMIT_ERROR", &e.to_string())
                    .await?;
                Err(e)
            }
        }
    }

    async fn get_status(&self, provider_ref: &str) -> Result<RailStatus, RailError> {
        let (msg_id, pmt_inf_id) = split_provider_ref(provider_ref)?;

        let response: StatusResponse = self
            .http
            .get_json(&format!("/payments/{msg_id}/{pmt_inf_id}"))
            .await?;

        Ok(RailStatus {
            status: response.status,
            settled_at: response.settled_at.as_deref().and_then(parse_rfc3339),
        })
    }
}
