//! Funding Persistence
//!
//! Intent creation relies on the `(tenant_id, idempotency_key)` unique
//! constraint; transitions are CAS updates (`UPDATE .. WHERE status =
//! expected`) so a losing writer observes zero rows and backs off.
//! Outbox rows co-commit with the domain change they describe.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;

use super::error::FundingError;
use super::intent::{
    AttemptStatus, BankDetails, FundingAttempt, FundingIntent, IntentStatus, Method,
};
use super::matching::normalize_reference;
use crate::db;
use crate::events::InboundCreditEvent;
use crate::money::{Currency, Money};
use crate::outbox::{enqueue_tx, OutboxEvent, OutboxStore};

#[async_trait]
pub trait FundingStore: Send + Sync {
    /// Insert a new intent; DUPLICATE when `(tenant, idempotency_key)`
    /// already exists. Outbox rows commit with the insert.
    async fn create_intent(
        &self,
        intent: &FundingIntent,
        outbox: &[OutboxEvent],
    ) -> Result<(), FundingError>;

    /// Fetch by id. An empty `tenant_id` matches any tenant (internal
    /// callers resolving rail callbacks that do not carry one).
    async fn get_intent(&self, tenant_id: &str, intent_id: &str)
        -> Result<FundingIntent, FundingError>;

    async fn get_intent_by_idempotency_key(
        &self,
        tenant_id: &str,
        key: &str,
    ) -> Result<Option<FundingIntent>, FundingError>;

    /// Exact match on the issued bank reference.
    async fn get_intent_by_reference(
        &self,
        tenant_id: &str,
        reference: &str,
    ) -> Result<Option<FundingIntent>, FundingError>;

    /// Match on the normalized form of the stored reference.
    async fn get_intent_by_normalized_reference(
        &self,
        tenant_id: &str,
        normalized: &str,
    ) -> Result<Option<FundingIntent>, FundingError>;

    /// Persist the intent's current state iff the stored row is still in
    /// `expected`. Returns false when the CAS lost. Outbox rows commit
    /// only with a winning update.
    async fn update_intent_if(
        &self,
        intent: &FundingIntent,
        expected: IntentStatus,
        outbox: &[OutboxEvent],
    ) -> Result<bool, FundingError>;

    /// Non-terminal intents whose `expires_at` has passed.
    async fn list_expired_intents(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<FundingIntent>, FundingError>;

    async fn create_attempt(&self, attempt: &FundingAttempt) -> Result<(), FundingError>;

    async fn update_attempt(&self, attempt: &FundingAttempt) -> Result<(), FundingError>;

    async fn list_attempts(&self, intent_id: &str) -> Result<Vec<FundingAttempt>, FundingError>;

    /// Record that a statement credit was observed. Returns false when
    /// this statement id was already processed (webhook/report replay).
    async fn record_statement(
        &self,
        statement_id: &str,
        intent_id: Option<&str>,
    ) -> Result<bool, FundingError>;

    /// Persist a credit that matched no intent, for manual review.
    async fn record_orphan_credit(
        &self,
        event: &InboundCreditEvent,
        outbox: &[OutboxEvent],
    ) -> Result<(), FundingError>;
}

// ============================================================================
// PostgreSQL
// ============================================================================

pub struct PostgresFundingStore {
    pool: PgPool,
}

const INTENT_COLUMNS: &str = "id, tenant_id, wallet_id, customer_id, amount_minor, currency, \
     method, status, idempotency_key, provider_ref, redirect_url, bank_details, payment_session, \
     attempt_count, last_attempt_at, settled_at, reversed_at, reversal_reason, ledger_batch_id, \
     metadata, error_code, error_message, created_at, updated_at, expires_at";

impl PostgresFundingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_intent(row: &sqlx::postgres::PgRow) -> Result<FundingIntent, FundingError> {
        let method_str: String = row.get("method");
        let status_str: String = row.get("status");
        let bank_details: Option<serde_json::Value> = row.get("bank_details");
        let metadata: serde_json::Value = row.get("metadata");

        Ok(FundingIntent {
            id: row.get("id"),
            tenant_id: row.get("tenant_id"),
            wallet_id: row.get("wallet_id"),
            customer_id: row.get("customer_id"),
            amount: Money::new(
                row.get("amount_minor"),
                Currency::new(&row.get::<String, _>("currency")),
            ),
            method: Method::from_str(&method_str)
                .ok_or_else(|| FundingError::Validation(format!("bad method {method_str}")))?,
            status: IntentStatus::from_str(&status_str)
                .ok_or_else(|| FundingError::Validation(format!("bad status {status_str}")))?,
            idempotency_key: row.get("idempotency_key"),
            provider_ref: row.get("provider_ref"),
            redirect_url: row.get("redirect_url"),
            bank_details: bank_details
                .map(serde_json::from_value::<BankDetails>)
                .transpose()?,
            payment_session: row.get("payment_session"),
            attempt_count: row.get("attempt_count"),
            last_attempt_at: row.get("last_attempt_at"),
            settled_at: row.get("settled_at"),
            reversed_at: row.get("reversed_at"),
            reversal_reason: row
                .get::<Option<String>, _>("reversal_reason")
                .unwrap_or_default(),
            ledger_batch_id: row.get("ledger_batch_id"),
            metadata: serde_json::from_value(metadata).unwrap_or_default(),
            error_code: row.get::<Option<String>, _>("error_code").unwrap_or_default(),
            error_message: row
                .get::<Option<String>, _>("error_message")
                .unwrap_or_default(),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            expires_at: row.get("expires_at"),
        })
    }

    fn row_to_attempt(row: &sqlx::postgres::PgRow) -> Result<FundingAttempt, FundingError> {
        let status_str: String = row.get("status");
        Ok(FundingAttempt {
            id: row.get("id"),
            intent_id: row.get("intent_id"),
            provider: row.get("provider"),
            provider_ref: row.get("provider_ref"),
            status: AttemptStatus::from_str(&status_str)
                .ok_or_else(|| FundingError::Validation(format!("bad attempt status {status_str}")))?,
            attempt_number: row.get("attempt_number"),
            error_code: row.get::<Option<String>, _>("error_code").unwrap_or_default(),
            error_message: row
                .get::<Option<String>, _>("error_message")
                .unwrap_or_default(),
            provider_data: row.get("provider_data"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            submitted_at: row.get("submitted_at"),
            settled_at: row.get("settled_at"),
        })
    }
}

#[async_trait]
impl FundingStore for PostgresFundingStore {
    async fn create_intent(
        &self,
        intent: &FundingIntent,
        outbox: &[OutboxEvent],
    ) -> Result<(), FundingError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO funding_intents (
                id, tenant_id, wallet_id, customer_id, amount_minor, currency,
                method, status, idempotency_key, provider_ref, redirect_url,
                bank_details, payment_session, attempt_count, last_attempt_at,
                settled_at, reversed_at, reversal_reason, ledger_batch_id,
                metadata, error_code, error_message, created_at, updated_at, expires_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25
            )
            "#,
        )
        .bind(&intent.id)
        .bind(&intent.tenant_id)
        .bind(&intent.wallet_id)
        .bind(&intent.customer_id)
        .bind(intent.amount.amount_minor)
        .bind(intent.amount.currency.as_str())
        .bind(intent.method.as_str())
        .bind(intent.status.as_str())
        .bind(&intent.idempotency_key)
        .bind(&intent.provider_ref)
        .bind(&intent.redirect_url)
        .bind(
            intent
                .bank_details
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
        )
        .bind(&intent.payment_session)
        .bind(intent.attempt_count)
        .bind(intent.last_attempt_at)
        .bind(intent.settled_at)
        .bind(intent.reversed_at)
        .bind(&intent.reversal_reason)
        .bind(&intent.ledger_batch_id)
        .bind(serde_json::to_value(&intent.metadata)?)
        .bind(&intent.error_code)
        .bind(&intent.error_message)
        .bind(intent.created_at)
        .bind(intent.updated_at)
        .bind(intent.expires_at)
        .execute(&mut *tx)
        .await;

        if let Err(e) = result {
            if db::is_unique_violation(&e) {
                return Err(FundingError::Duplicate(format!(
                    "intent with idempotency key {} already exists",
                    intent.idempotency_key
                )));
            }
            return Err(e.into());
        }

        for event in outbox {
            enqueue_tx(&mut tx, event)
                .await
                .map_err(|e| FundingError::Validation(e.to_string()))?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_intent(
        &self,
        tenant_id: &str,
        intent_id: &str,
    ) -> Result<FundingIntent, FundingError> {
        let row = sqlx::query(&format!(
            "SELECT {INTENT_COLUMNS} FROM funding_intents \
             WHERE id = $1 AND (tenant_id = $2 OR $2 = '')"
        ))
        .bind(intent_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| FundingError::NotFound(format!("intent {intent_id}")))?;

        Self::row_to_intent(&row)
    }

    async fn get_intent_by_idempotency_key(
        &self,
        tenant_id: &str,
        key: &str,
    ) -> Result<Option<FundingIntent>, FundingError> {
        let row = sqlx::query(&format!(
            "SELECT {INTENT_COLUMNS} FROM funding_intents \
             WHERE tenant_id = $1 AND idempotency_key = $2"
        ))
        .bind(tenant_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Self::row_to_intent(&r)).transpose()
    }

    async fn get_intent_by_reference(
        &self,
        tenant_id: &str,
        reference: &str,
    ) -> Result<Option<FundingIntent>, FundingError> {
        let row = sqlx::query(&format!(
            "SELECT {INTENT_COLUMNS} FROM funding_intents \
             WHERE tenant_id = $1 AND bank_details->>'reference' = $2"
        ))
        .bind(tenant_id)
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Self::row_to_intent(&r)).transpose()
    }

    async fn get_intent_by_normalized_reference(
        &self,
        tenant_id: &str,
        normalized: &str,
    ) -> Result<Option<FundingIntent>, FundingError> {
        let row = sqlx::query(&format!(
            "SELECT {INTENT_COLUMNS} FROM funding_intents \
             WHERE tenant_id = $1 \
               AND regexp_replace(upper(bank_details->>'reference'), '[^A-Z0-9]', '', 'g') = $2"
        ))
        .bind(tenant_id)
        .bind(normalized)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Self::row_to_intent(&r)).transpose()
    }

    async fn update_intent_if(
        &self,
        intent: &FundingIntent,
        expected: IntentStatus,
        outbox: &[OutboxEvent],
    ) -> Result<bool, FundingError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE funding_intents SET
                status = $2, provider_ref = $3, redirect_url = $4, payment_session = $5,
                bank_details = $6, attempt_count = $7, last_attempt_at = $8,
                settled_at = $9, reversed_at = $10, reversal_reason = $11,
                ledger_batch_id = $12, error_code = $13, error_message = $14,
                updated_at = NOW()
            WHERE id = $1 AND status = $15
            "#,
        )
        .bind(&intent.id)
        .bind(intent.status.as_str())
        .bind(&intent.provider_ref)
        .bind(&intent.redirect_url)
        .bind(&intent.payment_session)
        .bind(
            intent
                .bank_details
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
        )
        .bind(intent.attempt_count)
        .bind(intent.last_attempt_at)
        .bind(intent.settled_at)
        .bind(intent.reversed_at)
        .bind(&intent.reversal_reason)
        .bind(&intent.ledger_batch_id)
        .bind(&intent.error_code)
        .bind(&intent.error_message)
        .bind(expected.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        for event in outbox {
            enqueue_tx(&mut tx, event)
                .await
                .map_err(|e| FundingError::Validation(e.to_string()))?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn list_expired_intents(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<FundingIntent>, FundingError> {
        let rows = sqlx::query(&format!(
            "SELECT {INTENT_COLUMNS} FROM funding_intents \
             WHERE status IN ('created', 'pending') AND expires_at < $1 \
             ORDER BY expires_at ASC LIMIT $2"
        ))
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_intent).collect()
    }

    async fn create_attempt(&self, attempt: &FundingAttempt) -> Result<(), FundingError> {
        sqlx::query(
            r#"
            INSERT INTO funding_attempts (
                id, intent_id, provider, provider_ref, status, attempt_number,
                error_code, error_message, provider_data,
                created_at, updated_at, submitted_at, settled_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(&attempt.id)
        .bind(&attempt.intent_id)
        .bind(&attempt.provider)
        .bind(&attempt.provider_ref)
        .bind(attempt.status.as_str())
        .bind(attempt.attempt_number)
        .bind(&attempt.error_code)
        .bind(&attempt.error_message)
        .bind(&attempt.provider_data)
        .bind(attempt.created_at)
        .bind(attempt.updated_at)
        .bind(attempt.submitted_at)
        .bind(attempt.settled_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_attempt(&self, attempt: &FundingAttempt) -> Result<(), FundingError> {
        sqlx::query(
            r#"
            UPDATE funding_attempts SET
                provider_ref = $2, status = $3, error_code = $4, error_message = $5,
                provider_data = $6, updated_at = NOW(), submitted_at = $7, settled_at = $8
            WHERE id = $1
            "#,
        )
        .bind(&attempt.id)
        .bind(&attempt.provider_ref)
        .bind(attempt.status.as_str())
        .bind(&attempt.error_code)
        .bind(&attempt.error_message)
        .bind(&attempt.provider_data)
        .bind(attempt.submitted_at)
        .bind(attempt.settled_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_attempts(&self, intent_id: &str) -> Result<Vec<FundingAttempt>, FundingError> {
        let rows = sqlx::query(
            r#"
            SELECT id, intent_id, provider, provider_ref, status, attempt_number,
                   error_code, error_message, provider_data,
                   created_at, updated_at, submitted_at, settled_at
            FROM funding_attempts
            WHERE intent_id = $1
            ORDER BY attempt_number ASC
            "#,
        )
        .bind(intent_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_attempt).collect()
    }

    async fn record_statement(
        &self,
        statement_id: &str,
        intent_id: Option<&str>,
    ) -> Result<bool, FundingError> {
        let result = sqlx::query(
            r#"
            INSERT INTO inbound_statements (statement_id, intent_id, observed_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (statement_id) DO NOTHING
            "#,
        )
        .bind(statement_id)
        .bind(intent_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_orphan_credit(
        &self,
        event: &InboundCreditEvent,
        outbox: &[OutboxEvent],
    ) -> Result<(), FundingError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO orphan_credits (
                statement_id, rail, reference, amount_minor, currency,
                sender_name, sender_account, received_at, recorded_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            ON CONFLICT (statement_id) DO NOTHING
            "#,
        )
        .bind(&event.statement_id)
        .bind(&event.rail)
        .bind(&event.reference)
        .bind(event.amount.amount_minor)
        .bind(event.amount.currency.as_str())
        .bind(&event.sender_name)
        .bind(&event.sender_account)
        .bind(event.received_at)
        .execute(&mut *tx)
        .await?;

        for evt in outbox {
            enqueue_tx(&mut tx, evt)
                .await
                .map_err(|e| FundingError::Validation(e.to_string()))?;
        }

        tx.commit().await?;
        Ok(())
    }
}

// ============================================================================
// In-memory (tests and local wiring)
// ============================================================================

#[derive(Default)]
struct MemoryFundingState {
    intents: HashMap<String, FundingIntent>,
    attempts: Vec<FundingAttempt>,
    statements: HashSet<String>,
    orphans: Vec<InboundCreditEvent>,
}

pub struct MemoryFundingStore {
    state: Mutex<MemoryFundingState>,
    outbox: std::sync::Arc<crate::outbox::MemoryOutboxStore>,
}

impl MemoryFundingStore {
    pub fn new(outbox: std::sync::Arc<crate::outbox::MemoryOutboxStore>) -> Self {
        Self {
            state: Mutex::new(MemoryFundingState::default()),
            outbox,
        }
    }

    pub async fn orphan_count(&self) -> usize {
        self.state.lock().await.orphans.len()
    }
}

#[async_trait]
impl FundingStore for MemoryFundingStore {
    async fn create_intent(
        &self,
        intent: &FundingIntent,
        outbox: &[OutboxEvent],
    ) -> Result<(), FundingError> {
        let mut state = self.state.lock().await;
        let clash = state.intents.values().any(|i| {
            i.tenant_id == intent.tenant_id && i.idempotency_key == intent.idempotency_key
        });
        if clash {
            return Err(FundingError::Duplicate(format!(
                "intent with idempotency key {} already exists",
                intent.idempotency_key
            )));
        }
        state.intents.insert(intent.id.clone(), intent.clone());
        drop(state);

        self.outbox
            .enqueue(outbox)
            .await
            .map_err(|e| FundingError::Validation(e.to_string()))?;
        Ok(())
    }

    async fn get_intent(
        &self,
        tenant_id: &str,
        intent_id: &str,
    ) -> Result<FundingIntent, FundingError> {
        let state = self.state.lock().await;
        state
            .intents
            .get(intent_id)
            .filter(|i| tenant_id.is_empty() || i.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| FundingError::NotFound(format!("intent {intent_id}")))
    }

    async fn get_intent_by_idempotency_key(
        &self,
        tenant_id: &str,
        key: &str,
    ) -> Result<Option<FundingIntent>, FundingError> {
        let state = self.state.lock().await;
        Ok(state
            .intents
            .values()
            .find(|i| i.tenant_id == tenant_id && i.idempotency_key == key)
            .cloned())
    }

    async fn get_intent_by_reference(
        &self,
        tenant_id: &str,
        reference: &str,
    ) -> Result<Option<FundingIntent>, FundingError> {
        let state = self.state.lock().await;
        Ok(state
            .intents
            .values()
            .find(|i| {
                i.tenant_id == tenant_id
                    && i.bank_details
                        .as_ref()
                        .map(|b| b.reference == reference)
                        .unwrap_or(false)
            })
            .cloned())
    }

    async fn get_intent_by_normalized_reference(
        &self,
        tenant_id: &str,
        normalized: &str,
    ) -> Result<Option<FundingIntent>, FundingError> {
        let state = self.state.lock().await;
        Ok(state
            .intents
            .values()
            .find(|i| {
                i.tenant_id == tenant_id
                    && i.bank_details
                        .as_ref()
                        .map(|b| normalize_reference(&b.reference) == normalized)
                        .unwrap_or(false)
            })
            .cloned())
    }

    async fn update_intent_if(
        &self,
        intent: &FundingIntent,
        expected: IntentStatus,
        outbox: &[OutboxEvent],
    ) -> Result<bool, FundingError> {
        let mut state = self.state.lock().await;
        match state.intents.get_mut(&intent.id) {
            Some(stored) if stored.status == expected => {
                *stored = intent.clone();
                stored.updated_at = Utc::now();
            }
            _ => return Ok(false),
        }
        drop(state);

        self.outbox
            .enqueue(outbox)
            .await
            .map_err(|e| FundingError::Validation(e.to_string()))?;
        Ok(true)
    }

    async fn list_expired_intents(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<FundingIntent>, FundingError> {
        let state = self.state.lock().await;
        let mut expired: Vec<FundingIntent> = state
            .intents
            .values()
            .filter(|i| matches!(i.status, IntentStatus::Created | IntentStatus::Pending))
            .filter(|i| i.expires_at.map(|e| e < cutoff).unwrap_or(false))
            .cloned()
            .collect();
        expired.sort_by_key(|i| i.expires_at);
        expired.truncate(limit as usize);
        Ok(expired)
    }

    async fn create_attempt(&self, attempt: &FundingAttempt) -> Result<(), FundingError> {
        let mut state = self.state.lock().await;
        state.attempts.push(attempt.clone());
        Ok(())
    }

    async fn update_attempt(&self, attempt: &FundingAttempt) -> Result<(), FundingError> {
        let mut state = self.state.lock().await;
        if let Some(stored) = state.attempts.iter_mut().find(|a| a.id == attempt.id) {
            *stored = attempt.clone();
        }
        Ok(())
    }

    async fn list_attempts(&self, intent_id: &str) -> Result<Vec<FundingAttempt>, FundingError> {
        let state = self.state.lock().await;
        let mut attempts: Vec<FundingAttempt> = state
            .attempts
            .iter()
            .filter(|a| a.intent_id == intent_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|a| a.attempt_number);
        Ok(attempts)
    }

    async fn record_statement(
        &self,
        statement_id: &str,
        _intent_id: Option<&str>,
    ) -> Result<bool, FundingError> {
        let mut state = self.state.lock().await;
        Ok(state.statements.insert(statement_id.to_string()))
    }

    async fn record_orphan_credit(
        &self,
        event: &InboundCreditEvent,
        outbox: &[OutboxEvent],
    ) -> Result<(), FundingError> {
        let mut state = self.state.lock().await;
        state.orphans.push(event.clone());
        drop(state);

        self.outbox
            .enqueue(outbox)
            .await
            .map_err(|e| FundingError::Validation(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::MemoryOutboxStore;
    use chrono::Duration;
    use std::sync::Arc;

    fn store() -> MemoryFundingStore {
        MemoryFundingStore::new(Arc::new(MemoryOutboxStore::new()))
    }

    fn intent(id: &str, key: &str) -> FundingIntent {
        let mut i = FundingIntent::new(
            id,
            "tenant-a",
            "wal-1",
            "cus-1",
            Money::new(1000, Currency::new("EUR")),
            Method::Sepa,
            key,
            Duration::hours(24),
        )
        .unwrap();
        i.bank_details = Some(BankDetails {
            iban: Some("GB82WEST12345698765432".into()),
            sort_code: None,
            account_number: None,
            bic: None,
            reference: format!("W3G8-{}", &id[..8.min(id.len())]),
        });
        i
    }

    #[tokio::test]
    async fn test_idempotency_key_unique_per_tenant() {
        let s = store();
        s.create_intent(&intent("AAAA0001", "k1"), &[]).await.unwrap();

        let err = s
            .create_intent(&intent("AAAA0002", "k1"), &[])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "DUPLICATE");

        // Same key, different tenant is fine.
        let mut other = intent("AAAA0003", "k1");
        other.tenant_id = "tenant-b".into();
        s.create_intent(&other, &[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_cas_update_loses_on_wrong_expected_status() {
        let s = store();
        let mut i = intent("AAAA0001", "k1");
        s.create_intent(&i, &[]).await.unwrap();

        i.mark_settled("batch-1").unwrap();
        // Stored row is `created`; expecting `pending` must lose.
        let won = s
            .update_intent_if(&i, IntentStatus::Pending, &[])
            .await
            .unwrap();
        assert!(!won);

        let won = s
            .update_intent_if(&i, IntentStatus::Created, &[])
            .await
            .unwrap();
        assert!(won);

        let stored = s.get_intent("tenant-a", "AAAA0001").await.unwrap();
        assert_eq!(stored.status, IntentStatus::Settled);
    }

    #[tokio::test]
    async fn test_reference_lookup_exact_and_normalized() {
        let s = store();
        let i = intent("AAAA0001", "k1");
        let reference = i.bank_details.as_ref().unwrap().reference.clone();
        s.create_intent(&i, &[]).await.unwrap();

        let found = s
            .get_intent_by_reference("tenant-a", &reference)
            .await
            .unwrap();
        assert!(found.is_some());

        let found = s
            .get_intent_by_normalized_reference("tenant-a", &normalize_reference("w3g8 aaaa0001"))
            .await
            .unwrap();
        assert!(found.is_some());

        let none = s
            .get_intent_by_reference("tenant-a", "W3G8-UNKNOWN1")
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_statement_dedup() {
        let s = store();
        assert!(s.record_statement("stmt-1", None).await.unwrap());
        assert!(!s.record_statement("stmt-1", None).await.unwrap());
        assert!(s.record_statement("stmt-2", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_listing_skips_terminal() {
        let s = store();
        let mut stale = intent("AAAA0001", "k1");
        stale.expires_at = Some(Utc::now() - Duration::hours(1));
        s.create_intent(&stale, &[]).await.unwrap();

        let mut settled = intent("AAAA0002", "k2");
        settled.expires_at = Some(Utc::now() - Duration::hours(1));
        settled.mark_settled("batch-1").unwrap();
        s.create_intent(&settled, &[]).await.unwrap();

        let expired = s.list_expired_intents(Utc::now(), 10).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "AAAA0001");
    }
}
