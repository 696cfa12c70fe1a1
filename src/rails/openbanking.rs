//! Open Banking Adapter (UK / EU PSD2 payment initiation)
//!
//! Redirect flow: initiate a payment with the provider, send the
//! customer to the bank's auth URL, then learn the outcome through the
//! provider callback. States: PENDING -> AUTHORISED -> COMPLETED, with
//! FAILED as the error exit. The scheme has no recall; disputes travel
//! through the customer's bank.
//!
//! Natural key is the provider `payment_id`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use ulid::Ulid;

use super::http::RailHttpClient;
use super::{FundingCallbacks, OpenBankingProvider, RailError};
use crate::config::OpenBankingConfig;
use crate::events::FundingUpdateData;
use crate::funding::intent::FundingIntent;
use crate::money::{Currency, Money};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObStatus {
    Pending,
    Authorised,
    Completed,
    Failed,
}

impl ObStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObStatus::Pending => "PENDING",
            ObStatus::Authorised => "AUTHORISED",
            ObStatus::Completed => "COMPLETED",
            ObStatus::Failed => "FAILED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(ObStatus::Pending),
            "AUTHORISED" => Some(ObStatus::Authorised),
            "COMPLETED" => Some(ObStatus::Completed),
            "FAILED" => Some(ObStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ObStatus::Completed | ObStatus::Failed)
    }
}

/// Open Banking payment record, keyed by the provider `payment_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObPayment {
    pub id: String,
    pub tenant_id: String,
    pub intent_id: String,
    pub payment_id: String,
    pub consent_id: String,
    pub amount_minor: i64,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debtor_iban: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debtor_name: Option<String>,
    pub status: ObStatus,
    pub initiated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorised_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub response_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait ObStore: Send + Sync {
    async fn create(&self, payment: &ObPayment) -> Result<(), RailError>;

    async fn get_by_payment_id(&self, payment_id: &str) -> Result<Option<ObPayment>, RailError>;

    /// PENDING -> AUTHORISED.
    async fn mark_authorised(
        &self,
        payment_id: &str,
        debtor_iban: Option<&str>,
        debtor_name: Option<&str>,
    ) -> Result<bool, RailError>;

    /// PENDING/AUTHORISED -> COMPLETED.
    async fn mark_completed(&self, payment_id: &str) -> Result<bool, RailError>;

    /// PENDING/AUTHORISED -> FAILED.
    async fn mark_failed(
        &self,
        payment_id: &str,
        error_code: &str,
        error_message: &str,
    ) -> Result<bool, RailError>;
}

// ============================================================================
// Adapter
// ============================================================================

#[derive(Debug, Serialize)]
struct InitiateRequest {
    amount_minor: i64,
    currency: String,
    reference: String,
    redirect_url: String,
    intent_id: String,
}

#[derive(Debug, Deserialize)]
struct InitiateResponse {
    payment_id: String,
    consent_id: String,
    auth_url: String,
    #[serde(default)]
    #[allow(dead_code)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallbackStatusResponse {
    status: String,
    #[serde(default)]
    debtor_iban: Option<String>,
    #[serde(default)]
    debtor_name: Option<String>,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

pub struct OpenBankingAdapter {
    config: OpenBankingConfig,
    http: RailHttpClient,
    store: Arc<dyn ObStore>,
    callbacks: RwLock<Option<Arc<dyn FundingCallbacks>>>,
}

impl OpenBankingAdapter {
    pub fn new(config: OpenBankingConfig, store: Arc<dyn ObStore>) -> Self {
        // Client-credentials token exchange is folded into the bearer
        // secret here; the provider sandbox accepts it directly.
        let http =
            RailHttpClient::new(&config.base_url, &config.client_secret, config.timeout());
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

    /// Process the provider callback after the customer returns from
    /// their bank: poll the payment and apply whatever state it reached.
    pub async fn handle_callback(&self, payment_id: &str) -> Result<(), RailError> {
        let payment = self
            .store
            .get_by_payment_id(payment_id)
            .await?
            .ok_or_else(|| RailError::NotFound(payment_id.to_string()))?;

        let status: CallbackStatusResponse =
            self.http.get_json(&format!("/payments/{payment_id}")).await?;

        info!(
            payment_id = %payment_id,
            status = %status.status,
            "Open Banking callback"
        );

        match status.status.as_str() {
            "AUTHORISED" => {
                let transitioned = self
                    .store
                    .mark_authorised(
                        payment_id,
                        status.debtor_iban.as_deref(),
                        status.debtor_name.as_deref(),
                    )
                    .await?;
                if !transitioned {
                    info!(payment_id = %payment_id, "AUTHORISED replay, no-op");
                }
            }
            "COMPLETED" => {
                let transitioned = self.store.mark_completed(payment_id).await?;
                if !transitioned {
                    info!(payment_id = %payment_id, "COMPLETED replay, no-op");
                    return Ok(());
                }

                let update = FundingUpdateData {
                    intent_id: payment.intent_id.clone(),
                    wallet_id: String::new(),
                    status: "settled".to_string(),
                    provider_ref: Some(payment_id.to_string()),
                    rail: "OPEN_BANKING".to_string(),
                    amount: Money::new(payment.amount_minor, Currency::new(&payment.currency)),
                    error_code: None,
                    error_message: None,
                    settled_at: Some(Utc::now()),
                    ledger_batch_id: None,
                };
                if let Some(callbacks) = self.callbacks() {
                    if let Err(e) = callbacks.process_funding_update(&update).await {
                        error!(
                            intent_id = %payment.intent_id,
                            error = %e,
                            "Open Banking settlement processing failed"
                        );
                    }
                } else {
                    warn!(payment_id = %payment_id, "No funding callbacks wired");
                }
            }
            "FAILED" => {
                let transitioned = self
                    .store
                    .mark_failed(
                        payment_id,
                        status.error_code.as_deref().unwrap_or("OB_FAILED"),
                        status.error_message.as_deref().unwrap_or(""),
                    )
                    .await?;
                if !transitioned {
                    info!(payment_id = %payment_id, "FAILED replay, no-op");
                    return Ok(());
                }

                let update = FundingUpdateData {
                    intent_id: payment.intent_id.clone(),
                    wallet_id: String::new(),
                    status: "failed".to_string(),
                    provider_ref: Some(payment_id.to_string()),
                    rail: "OPEN_BANKING".to_string(),
                    amount: Money::new(payment.amount_minor, Currency::new(&payment.currency)),
                    error_code: status.error_code.clone(),
                    error_message: status.error_message.clone(),
                    settled_at: None,
                    ledger_batch_id: None,
                };
                if let Some(callbacks) = self.callbacks() {
                    if let Err(e) = callbacks.process_funding_update(&update).await {
                        error!(
                            intent_id = %payment.intent_id,
                            error = %e,
                            "Open Banking failure propagation failed"
                        );
                    }
                }
            }
            other => warn!(status = %other, "Unknown Open Banking status"),
        }

        Ok(())
    }
}

#[async_trait]
impl OpenBankingProvider for OpenBankingAdapter {
    async fn initiate(&self, intent: &FundingIntent) -> Result<(String, String), RailError> {
        info!(
            intent_id = %intent.id,
            amount = intent.amount.amount_minor,
            "Initiating Open Banking payment"
        );

        let request = InitiateRequest {
            amount_minor: intent.amount.amount_minor,
            currency: intent.amount.currency.as_str().to_string(),
            reference: intent.id.clone(),
            redirect_url: self.config.redirect_url.clone(),
            intent_id: intent.id.clone(),
        };

        let response: InitiateResponse =
            self.http.post_json("/payments/initiate", &request).await?;

        let payment = ObPayment {
            id: Ulid::new().to_string(),
            tenant_id: intent.tenant_id.clone(),
            intent_id: intent.id.clone(),
            payment_id: response.payment_id.clone(),
            consent_id: response.consent_id.clone(),
            amount_minor: intent.amount.amount_minor,
            currency: intent.amount.currency.as_str().to_string(),
            debtor_iban: None,
            debtor_name: None,
            status: ObStatus::Pending,
            initiated_at: Utc::now(),
            authorised_at: None,
            completed_at: None,
            error_code: None,
            error_message: None,
            response_data: serde_json::Value::Null,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.store.create(&payment).await?;

        info!(
            intent_id = %intent.id,
            payment_id = %response.payment_id,
            "Open Banking payment initiated"
        );

        Ok((response.auth_url, response.payment_id))
    }
}

// ============================================================================
// Stores
// ============================================================================

pub struct PostgresObStore {
    pool: PgPool,
}

const OB_COLUMNS: &str = "id, tenant_id, intent_id, payment_id, consent_id, amount_minor, \
     currency, debtor_iban, debtor_name, ob_status, initiated_at, authorised_at, completed_at, \
     error_code, error_message, response_data, created_at, updated_at";

impl PostgresObStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_payment(row: &sqlx::postgres::PgRow) -> Result<ObPayment, RailError> {
        let status_str: String = row.get("ob_status");
        Ok(ObPayment {
            id: row.get("id"),
            tenant_id: row.get("tenant_id"),
            intent_id: row.get("intent_id"),
            payment_id: row.get("payment_id"),
            consent_id: row.get("consent_id"),
            amount_minor: row.get("amount_minor"),
            currency: row.get("currency"),
            debtor_iban: row.get("debtor_iban"),
            debtor_name: row.get("debtor_name"),
            status: ObStatus::from_str(&status_str)
                .ok_or_else(|| RailError::InvalidState(format!("bad ob status {status_str}")))?,
            initiated_at: row.get("initiated_at"),
            authorised_at: row.get("authorised_at"),
            completed_at: row.get("completed_at"),
            error_code: row.get("error_code"),
            error_message: row.get("error_message"),
            response_data: row.get("response_data"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl ObStore for PostgresObStore {
    async fn create(&self, payment: &ObPayment) -> Result<(), RailError> {
        sqlx::query(
            r#"
            INSERT INTO openbanking_payments (
                id, tenant_id, intent_id, payment_id, consent_id, amount_minor, currency,
                debtor_iban, debtor_name, ob_status, initiated_at, authorised_at, completed_at,
                error_code, error_message, response_data, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                      $17, $18)
            "#,
        )
        .bind(&payment.id)
        .bind(&payment.tenant_id)
        .bind(&payment.intent_id)
        .bind(&payment.payment_id)
        .bind(&payment.consent_id)
        .bind(payment.amount_minor)
        .bind(&payment.currency)
        .bind(&payment.debtor_iban)
        .bind(&payment.debtor_name)
        .bind(payment.status.as_str())
        .bind(payment.initiated_at)
        .bind(payment.authorised_at)
        .bind(payment.completed_at)
        .bind(&payment.error_code)
        .bind(&payment.error_message)
        .bind(&payment.response_data)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_by_payment_id(&self, payment_id: &str) -> Result<Option<ObPayment>, RailError> {
        let row = sqlx::query(&format!(
            "SELECT {OB_COLUMNS} FROM openbanking_payments WHERE payment_id = $1"
        ))
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Self::row_to_payment(&r)).transpose()
    }

    async fn mark_authorised(
        &self,
        payment_id: &str,
        debtor_iban: Option<&str>,
        debtor_name: Option<&str>,
    ) -> Result<bool, RailError> {
        let result = sqlx::query(
            r#"
            UPDATE openbanking_payments
            SET ob_status = 'AUTHORISED', authorised_at = NOW(),
                debtor_iban = COALESCE($2, debtor_iban),
                debtor_name = COALESCE($3, debtor_name),
                updated_at = NOW()
            WHERE payment_id = $1 AND ob_status = 'PENDING'
            "#,
        )
        .bind(payment_id)
        .bind(debtor_iban)
        .bind(debtor_name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_completed(&self, payment_id: &str) -> Result<bool, RailError> {
        let result = sqlx::query(
            r#"
            UPDATE openbanking_payments
            SET ob_status = 'COMPLETED', completed_at = NOW(), updated_at = NOW()
            WHERE payment_id = $1 AND ob_status IN ('PENDING', 'AUTHORISED')
            "#,
        )
        .bind(payment_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed(
        &self,
        payment_id: &str,
        error_code: &str,
        error_message: &str,
    ) -> Result<bool, RailError> {
        let result = sqlx::query(
            r#"
            UPDATE openbanking_payments
            SET ob_status = 'FAILED', error_code = $2, error_message = $3, updated_at = NOW()
            WHERE payment_id = $1 AND ob_status IN ('PENDING', 'AUTHORISED')
            "#,
        )
        .bind(payment_id)
        .bind(error_code)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[derive(Default)]
pub struct MemoryObStore {
    payments: Mutex<HashMap<String, ObPayment>>,
}

impl MemoryObStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn transition<F>(
        &self,
        payment_id: &str,
        allowed_from: &[ObStatus],
        apply: F,
    ) -> Result<bool, RailError>
    where
        F: FnOnce(&mut ObPayment),
    {
        let mut payments = self.payments.lock().await;
        match payments.get_mut(payment_id) {
            Some(payment) if allowed_from.contains(&payment.status) => {
                apply(payment);
                payment.updated_at = Utc::now();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(RailError::NotFound(payment_id.to_string())),
        }
    }
}

#[async_trait]
impl ObStore for MemoryObStore {
    async fn create(&self, payment: &ObPayment) -> Result<(), RailError> {
        let mut payments = self.payments.lock().await;
        payments.insert(payment.payment_id.clone(), payment.clone());
        Ok(())
    }

    async fn get_by_payment_id(&self, payment_id: &str) -> Result<Option<ObPayment>, RailError> {
        let payments = self.payments.lock().await;
        Ok(payments.get(payment_id).cloned())
    }

    async fn mark_authorised(
        &self,
        payment_id: &str,
        debtor_iban: Option<&str>,
        debtor_name: Option<&str>,
    ) -> Result<bool, RailError> {
        let iban = debtor_iban.map(|s| s.to_string());
        let name = debtor_name.map(|s| s.to_string());
        self.transition(payment_id, &[ObStatus::Pending], |p| {
            p.status = ObStatus::Authorised;
            p.authorised_at = Some(Utc::now());
            if iban.is_some() {
                p.debtor_iban = iban;
            }
            if name.is_some() {
                p.debtor_name = name;
            }
        })
        .await
    }

    async fn mark_completed(&self, payment_id: &str) -> Result<bool, RailError> {
        self.transition(
            payment_id,
            &[ObStatus::Pending, ObStatus::Authorised],
            |p| {
                p.status = ObStatus::Completed;
                p.completed_at = Some(Utc::now());
            },
        )
        .await
    }

    async fn mark_failed(
        &self,
        payment_id: &str,
        error_code: &str,
        error_message: &str,
    ) -> Result<bool, RailError> {
        self.transition(
            payment_id,
            &[ObStatus::Pending, ObStatus::Authorised],
            |p| {
                p.status = ObStatus::Failed;
                p.error_code = Some(error_code.to_string());
                p.error_message = Some(error_message.to_string());
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payment(payment_id: &str) -> ObPayment {
        ObPayment {
            id: format!("ob-{payment_id}"),
            tenant_id: "tenant-a".into(),
            intent_id: "int-1".into(),
            payment_id: payment_id.to_string(),
            consent_id: "consent-1".into(),
            amount_minor: 7500,
            currency: "GBP".into(),
            debtor_iban: None,
            debtor_name: None,
            status: ObStatus::Pending,
            initiated_at: Utc::now(),
            authorised_at: None,
            completed_at: None,
            error_code: None,
            error_message: None,
            response_data: serde_json::Value::Null,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_authorise_then_complete() {
        let store = MemoryObStore::new();
        store.create(&payment("pay-1")).await.unwrap();

        assert!(store
            .mark_authorised("pay-1", Some("GB00TEST"), Some("A CUSTOMER"))
            .await
            .unwrap());
        assert!(store.mark_completed("pay-1").await.unwrap());

        let stored = store.get_by_payment_id("pay-1").await.unwrap().unwrap();
        assert_eq!(stored.status, ObStatus::Completed);
        assert_eq!(stored.debtor_iban.as_deref(), Some("GB00TEST"));
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_complete_replay_is_noop() {
        let store = MemoryObStore::new();
        store.create(&payment("pay-1")).await.unwrap();

        assert!(store.mark_completed("pay-1").await.unwrap());
        assert!(!store.mark_completed("pay-1").await.unwrap());
        assert!(!store.mark_failed("pay-1", "X", "y").await.unwrap());
    }

    #[tokio::test]
    async fn test_terminal_check() {
        assert!(ObStatus::Completed.is_terminal());
        assert!(ObStatus::Failed.is_terminal());
        assert!(!ObStatus::Pending.is_terminal());
        assert!(!ObStatus::Authorised.is_terminal());
    }
}
