//! FPS Payment Store
//!
//! Every status move is a CAS keyed on `end_to_end_id` plus the set of
//! states the move is legal from. A replayed webhook for a terminal
//! state matches zero rows and reports `false`; callers treat that as a
//! no-op, never an error.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;

use super::{FpsPayment, FpsStatus};
use crate::rails::RailError;

#[async_trait]
pub trait FpsStore: Send + Sync {
    async fn create(&self, payment: &FpsPayment) -> Result<(), RailError>;

    async fn get_by_end_to_end_id(
        &self,
        end_to_end_id: &str,
    ) -> Result<Option<FpsPayment>, RailError>;

    /// Provider response recorded after submit; keeps whatever status
    /// the provider echoed back.
    async fn update_status(
        &self,
        end_to_end_id: &str,
        status: FpsStatus,
        provider_payment_id: Option<&str>,
        response_data: serde_json::Value,
    ) -> Result<(), RailError>;

    /// SUBMITTED -> ACCEPTED. False when the payment was not in SUBMITTED.
    async fn mark_accepted(
        &self,
        end_to_end_id: &str,
        accepted_at: DateTime<Utc>,
    ) -> Result<bool, RailError>;

    /// SUBMITTED/ACCEPTED -> SETTLED. False on replay.
    async fn mark_settled(
        &self,
        end_to_end_id: &str,
        settled_at: DateTime<Utc>,
    ) -> Result<bool, RailError>;

    /// SUBMITTED/ACCEPTED -> FAILED. False on replay.
    async fn mark_failed(
        &self,
        end_to_end_id: &str,
        error_code: &str,
        error_message: &str,
    ) -> Result<bool, RailError>;

    /// SETTLED -> RECALLED.
    async fn mark_recalled(
        &self,
        end_to_end_id: &str,
        reason: &str,
        recalled_at: DateTime<Utc>,
    ) -> Result<bool, RailError>;

    /// SETTLED -> RETURNED.
    async fn mark_returned(
        &self,
        end_to_end_id: &str,
        reason: &str,
        returned_at: DateTime<Utc>,
    ) -> Result<bool, RailError>;

    /// Payments still in flight, oldest first, for the status poller.
    async fn list_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<FpsPayment>, RailError>;
}

// ============================================================================
// PostgreSQL
// ============================================================================

pub struct PostgresFpsStore {
    pool: PgPool,
}

const FPS_COLUMNS: &str = "id, attempt_id, intent_id, end_to_end_id, provider_payment_id, \
     reference, amount_minor, currency, fps_status, submitted_at, accepted_at, settled_at, \
     recalled_at, recall_reason, returned_at, return_reason, error_code, error_message, \
     response_data, created_at, updated_at";

impl PostgresFpsStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_payment(row: &sqlx::postgres::PgRow) -> Result<FpsPayment, RailError> {
        let status_str: String = row.get("fps_status");
        Ok(FpsPayment {
            id: row.get("id"),
            attempt_id: row.get("attempt_id"),
            intent_id: row.get("intent_id"),
            end_to_end_id: row.get("end_to_end_id"),
            provider_payment_id: row.get("provider_payment_id"),
            reference: row.get("reference"),
            amount_minor: row.get("amount_minor"),
            currency: row.get("currency"),
            status: FpsStatus::from_str(&status_str)
                .ok_or_else(|| RailError::InvalidState(format!("bad fps status {status_str}")))?,
            submitted_at: row.get("submitted_at"),
            accepted_at: row.get("accepted_at"),
            settled_at: row.get("settled_at"),
            recalled_at: row.get("recalled_at"),
            recall_reason: row.get("recall_reason"),
            returned_at: row.get("returned_at"),
            return_reason: row.get("return_reason"),
            error_code: row.get("error_code"),
            error_message: row.get("error_message"),
            response_data: row.get("response_data"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl FpsStore for PostgresFpsStore {
    async fn create(&self, payment: &FpsPayment) -> Result<(), RailError> {
        sqlx::query(
            r#"
            INSERT INTO fps_payments (
                id, attempt_id, intent_id, end_to_end_id, provider_payment_id,
                reference, amount_minor, currency, fps_status,
                submitted_at, accepted_at, settled_at,
                recalled_at, recall_reason, returned_at, return_reason,
                error_code, error_message, response_data, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                      $13, $14, $15, $16, $17, $18, $19, $20, $21)
            "#,
        )
        .bind(&payment.id)
        .bind(&payment.attempt_id)
        .bind(&payment.intent_id)
        .bind(&payment.end_to_end_id)
        .bind(&payment.provider_payment_id)
        .bind(&payment.reference)
        .bind(payment.amount_minor)
        .bind(&payment.currency)
        .bind(payment.status.as_str())
        .bind(payment.submitted_at)
        .bind(payment.accepted_at)
        .bind(payment.settled_at)
        .bind(payment.recalled_at)
        .bind(&payment.recall_reason)
        .bind(payment.returned_at)
        .bind(&payment.return_reason)
        .bind(&payment.error_code)
        .bind(&payment.error_message)
        .bind(&payment.response_data)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_by_end_to_end_id(
        &self,
        end_to_end_id: &str,
    ) -> Result<Option<FpsPayment>, RailError> {
        let row = sqlx::query(&format!(
            "SELECT {FPS_COLUMNS} FROM fps_payments WHERE end_to_end_id = $1"
        ))
        .bind(end_to_end_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Self::row_to_payment(&r)).transpose()
    }

    async fn update_status(
        &self,
        end_to_end_id: &str,
        status: FpsStatus,
        provider_payment_id: Option<&str>,
        response_data: serde_json::Value,
    ) -> Result<(), RailError> {
        let result = sqlx::query(
            r#"
            UPDATE fps_payments
            SET fps_status = $2, provider_payment_id = COALESCE($3, provider_payment_id),
                response_data = $4, updated_at = NOW()
            WHERE end_to_end_id = $1
            "#,
        )
        .bind(end_to_end_id)
        .bind(status.as_str())
        .bind(provider_payment_id)
        .bind(&response_data)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RailError::NotFound(end_to_end_id.to_string()));
        }
        Ok(())
    }

    async fn mark_accepted(
        &self,
        end_to_end_id: &str,
        accepted_at: DateTime<Utc>,
    ) -> Result<bool, RailError> {
        let result = sqlx::query(
            r#"
            UPDATE fps_payments
            SET fps_status = 'ACCEPTED', accepted_at = $2, updated_at = NOW()
            WHERE end_to_end_id = $1 AND fps_status = 'SUBMITTED'
            "#,
        )
        .bind(end_to_end_id)
        .bind(accepted_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_settled(
        &self,
        end_to_end_id: &str,
        settled_at: DateTime<Utc>,
    ) -> Result<bool, RailError> {
        let result = sqlx::query(
            r#"
            UPDATE fps_payments
            SET fps_status = 'SETTLED', settled_at = $2, updated_at = NOW()
            WHERE end_to_end_id = $1 AND fps_status IN ('SUBMITTED', 'ACCEPTED')
            "#,
        )
        .bind(end_to_end_id)
        .bind(settled_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed(
        &self,
        end_to_end_id: &str,
        error_code: &str,
        error_message: &str,
    ) -> Result<bool, RailError> {
        let result = sqlx::query(
            r#"
            UPDATE fps_payments
            SET fps_status = 'FAILED', error_code = $2, error_message = $3, updated_at = NOW()
            WHERE end_to_end_id = $1 AND fps_status IN ('SUBMITTED', 'ACCEPTED')
            "#,
        )
        .bind(end_to_end_id)
        .bind(error_code)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_recalled(
        &self,
        end_to_end_id: &str,
        reason: &str,
        recalled_at: DateTime<Utc>,
    ) -> Result<bool, RailError> {
        let result = sqlx::query(
            r#"
            UPDATE fps_payments
            SET fps_status = 'RECALLED', recall_reason = $2, recalled_at = $3, updated_at = NOW()
            WHERE end_to_end_id = $1 AND fps_status = 'SETTLED'
            "#,
        )
        .bind(end_to_end_id)
        .bind(reason)
        .bind(recalled_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_returned(
        &self,
        end_to_end_id: &str,
        reason: &str,
        returned_at: DateTime<Utc>,
    ) -> Result<bool, RailError> {
        let result = sqlx::query(
            r#"
            UPDATE fps_payments
            SET fps_status = 'RETURNED', return_reason = $2, returned_at = $3, updated_at = NOW()
            WHERE end_to_end_id = $1 AND fps_status = 'SETTLED'
            "#,
        )
        .bind(end_to_end_id)
        .bind(reason)
        .bind(returned_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<FpsPayment>, RailError> {
        let rows = sqlx::query(&format!(
            "SELECT {FPS_COLUMNS} FROM fps_payments \
             WHERE fps_status IN ('SUBMITTED', 'ACCEPTED') AND submitted_at < $1 \
             ORDER BY submitted_at ASC LIMIT $2"
        ))
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_payment).collect()
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Default)]
pub struct MemoryFpsStore {
    payments: Mutex<HashMap<String, FpsPayment>>,
}

impl MemoryFpsStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn transition<F>(
        &self,
        end_to_end_id: &str,
        allowed_from: &[FpsStatus],
        apply: F,
    ) -> Result<bool, RailError>
    where
        F: FnOnce(&mut FpsPayment),
    {
        let mut payments = self.payments.lock().await;
        match payments.get_mut(end_to_end_id) {
            Some(payment) if allowed_from.contains(&payment.status) => {
                apply(payment);
                payment.updated_at = Utc::now();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(RailError::NotFound(end_to_end_id.to_string())),
        }
    }
}

#[async_trait]
impl FpsStore for MemoryFpsStore {
    async fn create(&self, payment: &FpsPayment) -> Result<(), RailError> {
        let mut payments = self.payments.lock().await;
        payments.insert(payment.end_to_end_id.clone(), payment.clone());
        Ok(())
    }

    async fn get_by_end_to_end_id(
        &self,
        end_to_end_id: &str,
    ) -> Result<Option<FpsPayment>, RailError> {
        let payments = self.payments.lock().await;
        Ok(payments.get(end_to_end_id).cloned())
    }

    async fn update_status(
        &self,
        end_to_end_id: &str,
        status: FpsStatus,
        provider_payment_id: Option<&str>,
        response_data: serde_json::Value,
    ) -> Result<(), RailError> {
        let mut payments = self.payments.lock().await;
        let payment = payments
            .get_mut(end_to_end_id)
            .ok_or_else(|| RailError::NotFound(end_to_end_id.to_string()))?;
        payment.status = status;
        if let Some(ppid) = provider_payment_id {
            payment.provider_payment_id = Some(ppid.to_string());
        }
        payment.response_data = response_data;
        payment.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_accepted(
        &self,
        end_to_end_id: &str,
        accepted_at: DateTime<Utc>,
    ) -> Result<bool, RailError> {
        self.transition(end_to_end_id, &[FpsStatus::Submitted], |p| {
            p.status = FpsStatus::Accepted;
            p.accepted_at = Some(accepted_at);
        })
        .await
    }

    async fn mark_settled(
        &self,
        end_to_end_id: &str,
        settled_at: DateTime<Utc>,
    ) -> Result<bool, RailError> {
        self.transition(
            end_to_end_id,
            &[FpsStatus::Submitted, FpsStatus::Accepted],
            |p| {
                p.status = FpsStatus::Settled;
                p.settled_at = Some(settled_at);
            },
        )
        .await
    }

    async fn mark_failed(
        &self,
        end_to_end_id: &str,
        error_code: &str,
        error_message: &str,
    ) -> Result<bool, RailError> {
        self.transition(
            end_to_end_id,
            &[FpsStatus::Submitted, FpsStatus::Accepted],
            |p| {
                p.status = FpsStatus::Failed;
                p.error_code = Some(error_code.to_string());
                p.error_message = Some(error_message.to_string());
            },
        )
        .await
    }

    async fn mark_recalled(
        &self,
        end_to_end_id: &str,
        reason: &str,
        recalled_at: DateTime<Utc>,
    ) -> Result<bool, RailError> {
        self.transition(end_to_end_id, &[FpsStatus::Settled], |p| {
            p.status = FpsStatus::Recalled;
            p.recall_reason = Some(reason.to_string());
            p.recalled_at = Some(recalled_at);
        })
        .await
    }

    async fn mark_returned(
        &self,
        end_to_end_id: &str,
        reason: &str,
        returned_at: DateTime<Utc>,
    ) -> Result<bool, RailError> {
        self.transition(end_to_end_id, &[FpsStatus::Settled], |p| {
            p.status = FpsStatus::Returned;
            p.return_reason = Some(reason.to_string());
            p.returned_at = Some(returned_at);
        })
        .await
    }

    async fn list_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<FpsPayment>, RailError> {
        let payments = self.payments.lock().await;
        let mut pending: Vec<FpsPayment> = payments
            .values()
            .filter(|p| matches!(p.status, FpsStatus::Submitted | FpsStatus::Accepted))
            .filter(|p| p.submitted_at < older_than)
            .cloned()
            .collect();
        pending.sort_by_key(|p| p.submitted_at);
        pending.truncate(limit as usize);
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payment(e2e: &str) -> FpsPayment {
        FpsPayment {
            id: format!("fps-{e2e}"),
            attempt_id: "att-1".into(),
            intent_id: "int-1".into(),
            end_to_end_id: e2e.to_string(),
            provider_payment_id: None,
            reference: "W3G8-ABCD1234".into(),
            amount_minor: 5000,
            currency: "GBP".into(),
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
        }
    }

    #[tokio::test]
    async fn test_happy_transitions() {
        let store = MemoryFpsStore::new();
        store.create(&payment("E2E1")).await.unwrap();

        assert!(store.mark_accepted("E2E1", Utc::now()).await.unwrap());
        assert!(store.mark_settled("E2E1", Utc::now()).await.unwrap());

        let stored = store.get_by_end_to_end_id("E2E1").await.unwrap().unwrap();
        assert_eq!(stored.status, FpsStatus::Settled);
        assert!(stored.settled_at.is_some());
    }

    #[tokio::test]
    async fn test_settle_replay_is_noop() {
        let store = MemoryFpsStore::new();
        store.create(&payment("E2E1")).await.unwrap();

        assert!(store.mark_settled("E2E1", Utc::now()).await.unwrap());
        assert!(!store.mark_settled("E2E1", Utc::now()).await.unwrap());
        assert!(!store.mark_failed("E2E1", "X", "y").await.unwrap());
    }

    #[tokio::test]
    async fn test_recall_requires_settled() {
        let store = MemoryFpsStore::new();
        store.create(&payment("E2E1")).await.unwrap();

        assert!(!store.mark_recalled("E2E1", "fraud", Utc::now()).await.unwrap());
        store.mark_settled("E2E1", Utc::now()).await.unwrap();
        assert!(store.mark_recalled("E2E1", "fraud", Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_payment_errors() {
        let store = MemoryFpsStore::new();
        let err = store.mark_settled("ghost", Utc::now()).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_list_pending_filters_terminal() {
        let store = MemoryFpsStore::new();
        store.create(&payment("E2E1")).await.unwrap();
        store.create(&payment("E2E2")).await.unwrap();
        store.mark_settled("E2E2", Utc::now()).await.unwrap();

        let pending = store.list_pending(Utc::now(), 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].end_to_end_id, "E2E1");
    }
}
