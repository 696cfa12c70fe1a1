//! Card Acquiring Adapter
//!
//! Charge a tokenized card, optionally auto-capturing. States: PENDING
//! -> AUTHORISED -> CAPTURED, FAILED on decline; after capture a payment
//! can be REFUNDED or VOIDED by us, or hit with a CHARGEBACK by the
//! issuer at any later time. Natural key is the acquirer
//! `transaction_id`; webhook replays for terminal states are no-ops.

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
use super::{CardProvider, FundingCallbacks, RailError, ThreeDsData};
use crate::config::CardConfig;
use crate::funding::intent::FundingIntent;
use crate::money::Money;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CardStatus {
    Pending,
    Authorised,
    Captured,
    Failed,
    Refunded,
    Voided,
    Chargeback,
}

impl CardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CardStatus::Pending => "PENDING",
            CardStatus::Authorised => "AUTHORISED",
            CardStatus::Captured => "CAPTURED",
            CardStatus::Failed => "FAILED",
            CardStatus::Refunded => "REFUNDED",
            CardStatus::Voided => "VOIDED",
            CardStatus::Chargeback => "CHARGEBACK",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(CardStatus::Pending),
            "AUTHORISED" => Some(CardStatus::Authorised),
            "CAPTURED" => Some(CardStatus::Captured),
            "FAILED" => Some(CardStatus::Failed),
            "REFUNDED" => Some(CardStatus::Refunded),
            "VOIDED" => Some(CardStatus::Voided),
            "CHARGEBACK" => Some(CardStatus::Chargeback),
            _ => None,
        }
    }
}

/// Card payment record, keyed by acquirer `transaction_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardPayment {
    pub id: String,
    pub tenant_id: String,
    pub intent_id: String,
    pub customer_id: String,
    pub card_token: String,
    pub transaction_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_last_four: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_brand: Option<String>,
    pub amount_minor: i64,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub three_ds_version: Option<String>,
    pub status: CardStatus,
    pub initiated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorised_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refunded_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chargeback_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chargeback_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decline_reason: Option<String>,
    #[serde(default)]
    pub response_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait CardStore: Send + Sync {
    async fn create(&self, payment: &CardPayment) -> Result<(), RailError>;

    async fn get_by_transaction_id(
        &self,
        transaction_id: &str,
    ) -> Result<Option<CardPayment>, RailError>;

    /// AUTHORISED -> CAPTURED.
    async fn mark_captured(&self, transaction_id: &str) -> Result<bool, RailError>;

    /// PENDING/AUTHORISED -> FAILED.
    async fn mark_failed(
        &self,
        transaction_id: &str,
        error_code: &str,
        error_message: &str,
        decline_reason: Option<&str>,
    ) -> Result<bool, RailError>;

    /// CAPTURED -> REFUNDED.
    async fn mark_refunded(&self, transaction_id: &str) -> Result<bool, RailError>;

    /// AUTHORISED -> VOIDED.
    async fn mark_voided(&self, transaction_id: &str) -> Result<bool, RailError>;

    /// CAPTURED -> CHARGEBACK.
    async fn mark_chargeback(
        &self,
        transaction_id: &str,
        reason: &str,
    ) -> Result<bool, RailError>;
}

// ============================================================================
// Adapter
// ============================================================================

#[derive(Debug, Serialize)]
struct ChargeApiRequest {
    merchant_id: String,
    card_token: String,
    amount_minor: i64,
    currency: String,
    reference: String,
    capture: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    three_ds: Option<ThreeDsApiData>,
}

#[derive(Debug, Serialize)]
struct ThreeDsApiData {
    version: String,
    cavv: String,
    eci: String,
    transaction_id: String,
}

#[derive(Debug, Deserialize)]
struct ChargeApiResponse {
    transaction_id: String,
    /// AUTHORISED, CAPTURED or FAILED
    status: String,
    #[serde(default)]
    auth_code: Option<String>,
    #[serde(default)]
    card_last_four: Option<String>,
    #[serde(default)]
    card_brand: Option<String>,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    decline_reason: Option<String>,
}

/// Acquirer webhook payload for capture/chargeback notifications.
#[derive(Debug, Clone, Deserialize)]
pub struct CardWebhookPayload {
    pub transaction_id: String,
    /// CAPTURED, FAILED or CHARGEBACK
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

pub struct CardAdapter {
    config: CardConfig,
    http: RailHttpClient,
    store: Arc<dyn CardStore>,
    callbacks: RwLock<Option<Arc<dyn FundingCallbacks>>>,
}

impl CardAdapter {
    pub fn new(config: CardConfig, store: Arc<dyn CardStore>) -> Self {
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

    fn mask_token(token: &str) -> String {
        if token.len() > 8 {
            format!("{}****{}", &token[..4], &token[token.len() - 4..])
        } else {
            "****".to_string()
        }
    }

    /// Acquirer webhook sink. Replays of terminal states change nothing.
    pub async fn handle_webhook(&self, payload: &CardWebhookPayload) -> Result<(), RailError> {
        let payment = self
            .store
            .get_by_transaction_id(&payload.transaction_id)
            .await?
            .ok_or_else(|| RailError::NotFound(payload.transaction_id.clone()))?;

        info!(
            transaction_id = %payload.transaction_id,
            status = %payload.status,
            "Received card webhook"
        );

        match payload.status.as_str() {
            "CAPTURED" => {
                let transitioned = self.store.mark_captured(&payload.transaction_id).await?;
                if !transitioned {
                    info!(
                        transaction_id = %payload.transaction_id,
                        "CAPTURED webhook replay, no-op"
                    );
                    return Ok(());
                }

                if let Some(callbacks) = self.callbacks() {
                    if let Err(e) = callbacks
                        .process_card_payment(
                            &payment.tenant_id,
                            &payment.intent_id,
                            &payload.transaction_id,
                            true,
                        )
                        .await
                    {
                        error!(
                            intent_id = %payment.intent_id,
                            error = %e,
                            "Card capture processing failed"
                        );
                    }
                }
            }
            "FAILED" => {
                let transitioned = self
                    .store
                    .mark_failed(
                        &payload.transaction_id,
                        payload.error_code.as_deref().unwrap_or("CARD_FAILED"),
                        payload.error_message.as_deref().unwrap_or(""),
                        payload.reason.as_deref(),
                    )
                    .await?;
                if !transitioned {
                    info!(
                        transaction_id = %payload.transaction_id,
                        "FAILED webhook replay, no-op"
                    );
                    return Ok(());
                }

                if let Some(callbacks) = self.callbacks() {
                    if let Err(e) = callbacks
                        .process_card_payment(
                            &payment.tenant_id,
                            &payment.intent_id,
                            &payload.transaction_id,
                            false,
                        )
                        .await
                    {
                        error!(
                            intent_id = %payment.intent_id,
                            error = %e,
                            "Card failure processing failed"
                        );
                    }
                }
            }
            "REFUNDED" => {
                self.finish_refund(&payment).await?;
            }
            "CHARGEBACK" => {
                let reason = payload
                    .reason
                    .clone()
                    .unwrap_or_else(|| "issuer chargeback".to_string());
                let transitioned = self
                    .store
                    .mark_chargeback(&payload.transaction_id, &reason)
                    .await?;
                if !transitioned {
                    info!(
                        transaction_id = %payload.transaction_id,
                        "CHARGEBACK webhook replay or unexpected state, no-op"
                    );
                    return Ok(());
                }

                if let Some(callbacks) = self.callbacks() {
                    if let Err(e) = callbacks
                        .process_chargeback(&payment.tenant_id, &payment.intent_id, &reason)
                        .await
                    {
                        error!(
                            intent_id = %payment.intent_id,
                            error = %e,
                            "Chargeback processing failed"
                        );
                    }
                }
            }
            other => warn!(status = %other, "Unknown card webhook status"),
        }

        Ok(())
    }

    /// Apply the acquirer-confirmed refund: flip the record and route
    /// the reversal upward. A refund is a terminal state like any other;
    /// a replay loses the CAS and pushes nothing.
    async fn finish_refund(&self, payment: &CardPayment) -> Result<(), RailError> {
        if !self.store.mark_refunded(&payment.transaction_id).await? {
            info!(
                transaction_id = %payment.transaction_id,
                "Refund replay, no-op"
            );
            return Ok(());
        }

        info!(
            transaction_id = %payment.transaction_id,
            amount = payment.amount_minor,
            "Card payment refunded"
        );

        if let Some(callbacks) = self.callbacks() {
            if let Err(e) = callbacks
                .process_chargeback(&payment.tenant_id, &payment.intent_id, "merchant refund")
                .await
            {
                error!(
                    intent_id = %payment.intent_id,
                    error = %e,
                    "Refund reversal failed"
                );
            }
        }

        Ok(())
    }

    /// Void an authorisation that was never captured.
    pub async fn void(&self, transaction_id: &str) -> Result<(), RailError> {
        let payment = self
            .store
            .get_by_transaction_id(transaction_id)
            .await?
            .ok_or_else(|| RailError::NotFound(transaction_id.to_string()))?;

        if payment.status != CardStatus::Authorised {
            return Err(RailError::InvalidState(format!(
                "can only void authorised payments, current status {}",
                payment.status.as_str()
            )));
        }

        let _: serde_json::Value = self
            .http
            .post_json(&format!("/void/{transaction_id}"), &serde_json::json!({}))
            .await?;
        self.store.mark_voided(transaction_id).await?;

        info!(transaction_id = %transaction_id, "Card authorisation voided");
        Ok(())
    }
}

#[async_trait]
impl CardProvider for CardAdapter {
    async fn charge(
        &self,
        intent: &FundingIntent,
        card_token: &str,
        three_ds: Option<&ThreeDsData>,
    ) -> Result<String, RailError> {
        info!(
            intent_id = %intent.id,
            amount = intent.amount.amount_minor,
            card_token = %Self::mask_token(card_token),
            "Charging card"
        );

        let request = ChargeApiRequest {
            merchant_id: self.config.merchant_id.clone(),
            card_token: card_token.to_string(),
            amount_minor: intent.amount.amount_minor,
            currency: intent.amount.currency.as_str().to_string(),
            reference: intent.id.clone(),
            capture: self.config.auto_capture,
            three_ds: three_ds.map(|t| ThreeDsApiData {
                version: t.version.clone(),
                cavv: t.cavv.clone(),
                eci: t.eci.clone(),
                transaction_id: t.transaction_id.clone(),
            }),
        };

        let response: ChargeApiResponse = self.http.post_json("/charge", &request).await?;

        let now = Utc::now();
        let (status, authorised_at, captured_at) = match response.status.as_str() {
            "AUTHORISED" => (CardStatus::Authorised, Some(now), None),
            "CAPTURED" => (CardStatus::Captured, Some(now), Some(now)),
            _ => (CardStatus::Failed, None, None),
        };

        let payment = CardPayment {
            id: Ulid::new().to_string(),
            tenant_id: intent.tenant_id.clone(),
            intent_id: intent.id.clone(),
            customer_id: intent.customer_id.clone(),
            card_token: card_token.to_string(),
            transaction_id: response.transaction_id.clone(),
            auth_code: response.auth_code.clone(),
            card_last_four: response.card_last_four.clone(),
            card_brand: response.card_brand.clone(),
            amount_minor: intent.amount.amount_minor,
            currency: intent.amount.currency.as_str().to_string(),
            three_ds_version: three_ds.map(|t| t.version.clone()),
            status,
            initiated_at: now,
            authorised_at,
            captured_at,
            refunded_at: None,
            chargeback_at: None,
            chargeback_reason: None,
            error_code: response.error_code.clone(),
            error_message: response.error_message.clone(),
            decline_reason: response.decline_reason.clone(),
            response_data: serde_json::json!({ "charge": { "status": response.status } }),
            created_at: now,
            updated_at: now,
        };
        self.store.create(&payment).await?;

        info!(
            intent_id = %intent.id,
            transaction_id = %response.transaction_id,
            status = %response.status,
            "Card charge completed"
        );

        if status == CardStatus::Captured {
            if let Some(callbacks) = self.callbacks() {
                if let Err(e) = callbacks
                    .process_card_payment(
                        &intent.tenant_id,
                        &intent.id,
                        &response.transaction_id,
                        true,
                    )
                    .await
                {
                    error!(
                        intent_id = %intent.id,
                        error = %e,
                        "Auto-capture settlement failed"
                    );
                }
            }
        }

        if status == CardStatus::Failed {
            return Err(RailError::Rejected {
                code: response.error_code.unwrap_or_else(|| "CARD_DECLINED".into()),
                message: response
                    .decline_reason
                    .or(response.error_message)
                    .unwrap_or_default(),
            });
        }

        Ok(response.transaction_id)
    }

    async fn capture(&self, transaction_id: &str) -> Result<(), RailError> {
        let payment = self
            .store
            .get_by_transaction_id(transaction_id)
            .await?
            .ok_or_else(|| RailError::NotFound(transaction_id.to_string()))?;

        if payment.status != CardStatus::Authorised {
            return Err(RailError::InvalidState(format!(
                "can only capture authorised payments, current status {}",
                payment.status.as_str()
            )));
        }

        let _: serde_json::Value = self
            .http
            .post_json(&format!("/capture/{transaction_id}"), &serde_json::json!({}))
            .await?;

        if !self.store.mark_captured(transaction_id).await? {
            return Ok(());
        }

        if let Some(callbacks) = self.callbacks() {
            if let Err(e) = callbacks
                .process_card_payment(&payment.tenant_id, &payment.intent_id, transaction_id, true)
                .await
            {
                error!(
                    intent_id = %payment.intent_id,
                    error = %e,
                    "Capture settlement failed"
                );
            }
        }

        Ok(())
    }

    async fn refund(&self, transaction_id: &str, amount: &Money) -> Result<(), RailError> {
        let payment = self
            .store
            .get_by_transaction_id(transaction_id)
            .await?
            .ok_or_else(|| RailError::NotFound(transaction_id.to_string()))?;

        if payment.status != CardStatus::Captured {
            return Err(RailError::InvalidState(format!(
                "can only refund captured payments, current status {}",
                payment.status.as_str()
            )));
        }

        let body = serde_json::json!({ "amount_minor": amount.amount_minor });
        let _: serde_json::Value = self
            .http
            .post_json(&format!("/refund/{transaction_id}"), &body)
            .await?;

        self.finish_refund(&payment).await
    }
}

// ============================================================================
// Stores
// ============================================================================

pub struct PostgresCardStore {
    pool: PgPool,
}

const CARD_COLUMNS: &str = "id, tenant_id, intent_id, customer_id, card_token, transaction_id, \
     auth_code, card_last_four, card_brand, amount_minor, currency, three_ds_version, \
     card_status, initiated_at, authorised_at, captured_at, refunded_at, chargeback_at, \
     chargeback_reason, error_code, error_message, decline_reason, response_data, \
     created_at, updated_at";

impl PostgresCardStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_payment(row: &sqlx::postgres::PgRow) -> Result<CardPayment, RailError> {
        let status_str: String = row.get("card_status");
        Ok(CardPayment {
            id: row.get("id"),
            tenant_id: row.get("tenant_id"),
            intent_id: row.get("intent_id"),
            customer_id: row.get("customer_id"),
            card_token: row.get("card_token"),
            transaction_id: row.get("transaction_id"),
            auth_code: row.get("auth_code"),
            card_last_four: row.get("card_last_four"),
            card_brand: row.get("card_brand"),
            amount_minor: row.get("amount_minor"),
            currency: row.get("currency"),
            three_ds_version: row.get("three_ds_version"),
            status: CardStatus::from_str(&status_str)
                .ok_or_else(|| RailError::InvalidState(format!("bad card status {status_str}")))?,
            initiated_at: row.get("initiated_at"),
            authorised_at: row.get("authorised_at"),
            captured_at: row.get("captured_at"),
            refunded_at: row.get("refunded_at"),
            chargeback_at: row.get("chargeback_at"),
            chargeback_reason: row.get("chargeback_reason"),
            error_code: row.get("error_code"),
            error_message: row.get("error_message"),
            decline_reason: row.get("decline_reason"),
            response_data: row.get("response_data"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl CardStore for PostgresCardStore {
    async fn create(&self, payment: &CardPayment) -> Result<(), RailError> {
        sqlx::query(
            r#"
            INSERT INTO card_payments (
                id, tenant_id, intent_id, customer_id, card_token, transaction_id,
                auth_code, card_last_four, card_brand, amount_minor, currency,
                three_ds_version, card_status, initiated_at, authorised_at, captured_at,
                refunded_at, chargeback_at, chargeback_reason,
                error_code, error_message, decline_reason, response_data,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                      $16, $17, $18, $19, $20, $21, $22, $23, $24, $25)
            "#,
        )
        .bind(&payment.id)
        .bind(&payment.tenant_id)
        .bind(&payment.intent_id)
        .bind(&payment.customer_id)
        .bind(&payment.card_token)
        .bind(&payment.transaction_id)
        .bind(&payment.auth_code)
        .bind(&payment.card_last_four)
        .bind(&payment.card_brand)
        .bind(payment.amount_minor)
        .bind(&payment.currency)
        .bind(&payment.three_ds_version)
        .bind(payment.status.as_str())
        .bind(payment.initiated_at)
        .bind(payment.authorised_at)
        .bind(payment.captured_at)
        .bind(payment.refunded_at)
        .bind(payment.chargeback_at)
        .bind(&payment.chargeback_reason)
        .bind(&payment.error_code)
        .bind(&payment.error_message)
        .bind(&payment.decline_reason)
        .bind(&payment.response_data)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_by_transaction_id(
        &self,
        transaction_id: &str,
    ) -> Result<Option<CardPayment>, RailError> {
        let row = sqlx::query(&format!(
            "SELECT {CARD_COLUMNS} FROM card_payments WHERE transaction_id = $1"
        ))
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Self::row_to_payment(&r)).transpose()
    }

    async fn mark_captured(&self, transaction_id: &str) -> Result<bool, RailError> {
        let result = sqlx::query(
            r#"
            UPDATE card_payments
            SET card_status = 'CAPTURED', captured_at = NOW(), updated_at = NOW()
            WHERE transaction_id = $1 AND card_status = 'AUTHORISED'
            "#,
        )
        .bind(transaction_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed(
        &self,
        transaction_id: &str,
        error_code: &str,
        error_message: &str,
        decline_reason: Option<&str>,
    ) -> Result<bool, RailError> {
        let result = sqlx::query(
            r#"
            UPDATE card_payments
            SET card_status = 'FAILED', error_code = $2, error_message = $3,
                decline_reason = $4, updated_at = NOW()
            WHERE transaction_id = $1 AND card_status IN ('PENDING', 'AUTHORISED')
            "#,
        )
        .bind(transaction_id)
        .bind(error_code)
        .bind(error_message)
        .bind(decline_reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_refunded(&self, transaction_id: &str) -> Result<bool, RailError> {
        let result = sqlx::query(
            r#"
            UPDATE card_payments
            SET card_status = 'REFUNDED', refunded_at = NOW(), updated_at = NOW()
            WHERE transaction_id = $1 AND card_status = 'CAPTURED'
            "#,
        )
        .bind(transaction_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_voided(&self, transaction_id: &str) -> Result<bool, RailError> {
        let result = sqlx::query(
            r#"
            UPDATE card_payments
            SET card_status = 'VOIDED', updated_at = NOW()
            WHERE transaction_id = $1 AND card_status = 'AUTHORISED'
            "#,
        )
        .bind(transaction_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_chargeback(
        &self,
        transaction_id: &str,
        reason: &str,
    ) -> Result<bool, RailError> {
        let result = sqlx::query(
            r#"
            UPDATE card_payments
            SET card_status = 'CHARGEBACK', chargeback_reason = $2, chargeback_at = NOW(),
                updated_at = NOW()
            WHERE transaction_id = $1 AND card_status = 'CAPTURED'
            "#,
        )
        .bind(transaction_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[derive(Default)]
pub struct MemoryCardStore {
    payments: Mutex<HashMap<String, CardPayment>>,
}

impl MemoryCardStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn transition<F>(
        &self,
        transaction_id: &str,
        allowed_from: &[CardStatus],
        apply: F,
    ) -> Result<bool, RailError>
    where
        F: FnOnce(&mut CardPayment),
    {
        let mut payments = self.payments.lock().await;
        match payments.get_mut(transaction_id) {
            Some(payment) if allowed_from.contains(&payment.status) => {
                apply(payment);
                payment.updated_at = Utc::now();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(RailError::NotFound(transaction_id.to_string())),
        }
    }
}

#[async_trait]
impl CardStore for MemoryCardStore {
    async fn create(&self, payment: &CardPayment) -> Result<(), RailError> {
        let mut payments = self.payments.lock().await;
        payments.insert(payment.transaction_id.clone(), payment.clone());
        Ok(())
    }

    async fn get_by_transaction_id(
        &self,
        transaction_id: &str,
    ) -> Result<Option<CardPayment>, RailError> {
        let payments = self.payments.lock().await;
        Ok(payments.get(transaction_id).cloned())
    }

    async fn mark_captured(&self, transaction_id: &str) -> Result<bool, RailError> {
        self.transition(transaction_id, &[CardStatus::Authorised], |p| {
            p.status = CardStatus::Captured;
            p.captured_at = Some(Utc::now());
        })
        .await
    }

    async fn mark_failed(
        &self,
        transaction_id: &str,
        error_code: &str,
        error_message: &str,
        decline_reason: Option<&str>,
    ) -> Result<bool, RailError> {
        let decline = decline_reason.map(|s| s.to_string());
        self.transition(
            transaction_id,
            &[CardStatus::Pending, CardStatus::Authorised],
            |p| {
                p.status = CardStatus::Failed;
                p.error_code = Some(error_code.to_string());
                p.error_message = Some(error_message.to_string());
                p.decline_reason = decline;
            },
        )
        .await
    }

    async fn mark_refunded(&self, transaction_id: &str) -> Result<bool, RailError> {
        self.transition(transaction_id, &[CardStatus::Captured], |p| {
            p.status = CardStatus::Refunded;
            p.refunded_at = Some(Utc::now());
        })
        .await
    }

    async fn mark_voided(&self, transaction_id: &str) -> Result<bool, RailError> {
        self.transition(transaction_id, &[CardStatus::Authorised], |p| {
            p.status = CardStatus::Voided;
        })
        .await
    }

    async fn mark_chargeback(
        &self,
        transaction_id: &str,
        reason: &str,
    ) -> Result<bool, RailError> {
        self.transition(transaction_id, &[CardStatus::Captured], |p| {
            p.status = CardStatus::Chargeback;
            p.chargeback_reason = Some(reason.to_string());
            p.chargeback_at = Some(Utc::now());
        })
        .await
    }
}
