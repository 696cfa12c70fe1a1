//! SEPA Payment & Report Stores
//!
//! Payments are keyed by `(msg_id, pmt_inf_id)`; every MarkX is a CAS
//! from the states it is legal in, so report and webhook replays fall
//! out as no-ops. The report archive dedupes whole files by content
//! hash: a re-presented camt.053 or pain.002 is processed exactly once.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;

use super::{SepaPayment, SepaRecallReason, SepaStatus};
use crate::rails::RailError;

#[async_trait]
pub trait SepaStore: Send + Sync {
    async fn create(&self, payment: &SepaPayment) -> Result<(), RailError>;

    async fn get_by_msg_and_pmt_inf(
        &self,
        msg_id: &str,
        pmt_inf_id: &str,
    ) -> Result<Option<SepaPayment>, RailError>;

    async fn get_by_end_to_end_id(
        &self,
        end_to_end_id: &str,
    ) -> Result<Option<SepaPayment>, RailError>;

    async fn update_status(
        &self,
        msg_id: &str,
        pmt_inf_id: &str,
        status: SepaStatus,
        response_data: serde_json::Value,
    ) -> Result<(), RailError>;

    /// SUBMITTED -> ACCEPTED.
    async fn mark_accepted(
        &self,
        msg_id: &str,
        pmt_inf_id: &str,
        accepted_at: DateTime<Utc>,
    ) -> Result<bool, RailError>;

    /// SUBMITTED/ACCEPTED -> SETTLED.
    async fn mark_settled(
        &self,
        msg_id: &str,
        pmt_inf_id: &str,
        settled_at: DateTime<Utc>,
    ) -> Result<bool, RailError>;

    /// SUBMITTED/ACCEPTED -> REJECTED.
    async fn mark_rejected(
        &self,
        msg_id: &str,
        pmt_inf_id: &str,
        reason_code: &str,
        reason_desc: &str,
    ) -> Result<bool, RailError>;

    /// SETTLED -> RECALLED.
    async fn mark_recalled(
        &self,
        msg_id: &str,
        pmt_inf_id: &str,
        recall_ref: &str,
        reason: SepaRecallReason,
        additional_info: &str,
        recalled_at: DateTime<Utc>,
    ) -> Result<bool, RailError>;

    /// SETTLED/RECALLED -> RETURNED.
    async fn mark_returned(
        &self,
        msg_id: &str,
        pmt_inf_id: &str,
        return_reason: &str,
        returned_at: DateTime<Utc>,
    ) -> Result<bool, RailError>;

    /// Stamp which report last touched the payment.
    async fn record_report_touch(
        &self,
        msg_id: &str,
        pmt_inf_id: &str,
        report_id: &str,
    ) -> Result<(), RailError>;

    async fn list_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<SepaPayment>, RailError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStatus {
    Pending,
    Processed,
    Failed,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Pending => "PENDING",
            ReportStatus::Processed => "PROCESSED",
            ReportStatus::Failed => "FAILED",
        }
    }
}

/// One ingested report file in the archive.
#[derive(Debug, Clone)]
pub struct SepaReport {
    pub id: String,
    /// pain.002, camt.053
    pub report_type: String,
    pub file_hash: String,
    pub status: ReportStatus,
    pub payments_updated: i32,
    pub error_message: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait SepaReportStore: Send + Sync {
    /// Archive the report. False when a file with the same content hash
    /// was already ingested.
    async fn create(&self, report: &SepaReport) -> Result<bool, RailError>;

    async fn mark_processed(&self, id: &str, payments_updated: i32) -> Result<(), RailError>;

    async fn mark_failed(&self, id: &str, error: &str) -> Result<(), RailError>;
}

// ============================================================================
// PostgreSQL
// ============================================================================

pub struct PostgresSepaStore {
    pool: PgPool,
}

const SEPA_COLUMNS: &str = "id, attempt_id, intent_id, msg_id, pmt_inf_id, end_to_end_id, \
     iban, bic, amount_minor, currency, sepa_status, submitted_at, accepted_at, settled_at, \
     recalled_at, recall_reason, recall_ref, recall_additional_info, returned_at, return_reason, \
     reject_reason_code, reject_reason_desc, last_report_id, last_report_at, response_data, \
     created_at, updated_at";

impl PostgresSepaStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_payment(row: &sqlx::postgres::PgRow) -> Result<SepaPayment, RailError> {
        let status_str: String = row.get("sepa_status");
        let recall_reason: Option<String> = row.get("recall_reason");
        Ok(SepaPayment {
            id: row.get("id"),
            attempt_id: row.get("attempt_id"),
            intent_id: row.get("intent_id"),
            msg_id: row.get("msg_id"),
            pmt_inf_id: row.get("pmt_inf_id"),
            end_to_end_id: row.get("end_to_end_id"),
            iban: row.get("iban"),
            bic: row.get("bic"),
            amount_minor: row.get("amount_minor"),
            currency: row.get("currency"),
            status: SepaStatus::from_str(&status_str)
                .ok_or_else(|| RailError::InvalidState(format!("bad sepa status {status_str}")))?,
            submitted_at: row.get("submitted_at"),
            accepted_at: row.get("accepted_at"),
            settled_at: row.get("settled_at"),
            recalled_at: row.get("recalled_at"),
            recall_reason: recall_reason.as_deref().and_then(SepaRecallReason::from_str),
            recall_ref: row.get("recall_ref"),
            recall_additional_info: row.get("recall_additional_info"),
            returned_at: row.get("returned_at"),
            return_reason: row.get("return_reason"),
            reject_reason_code: row.get("reject_reason_code"),
            reject_reason_desc: row.get("reject_reason_desc"),
            last_report_id: row.get("last_report_id"),
            last_report_at: row.get("last_report_at"),
            response_data: row.get("response_data"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl SepaStore for PostgresSepaStore {
    async fn create(&self, payment: &SepaPayment) -> Result<(), RailError> {
        sqlx::query(
            r#"
            INSERT INTO sepa_payments (
                id, attempt_id, intent_id, msg_id, pmt_inf_id, end_to_end_id,
                iban, bic, amount_minor, currency, sepa_status,
                submitted_at, accepted_at, settled_at,
                recalled_at, recall_reason, recall_ref, recall_additional_info,
                returned_at, return_reason, reject_reason_code, reject_reason_desc,
                last_report_id, last_report_at, response_data, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                      $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27)
            "#,
        )
        .bind(&payment.id)
        .bind(&payment.attempt_id)
        .bind(&payment.intent_id)
        .bind(&payment.msg_id)
        .bind(&payment.pmt_inf_id)
        .bind(&payment.end_to_end_id)
        .bind(&payment.iban)
        .bind(&payment.bic)
        .bind(payment.amount_minor)
        .bind(&payment.currency)
        .bind(payment.status.as_str())
        .bind(payment.submitted_at)
        .bind(payment.accepted_at)
        .bind(payment.settled_at)
        .bind(payment.recalled_at)
        .bind(payment.recall_reason.map(|r| r.as_str()))
        .bind(&payment.recall_ref)
        .bind(&payment.recall_additional_info)
        .bind(payment.returned_at)
        .bind(&payment.return_reason)
        .bind(&payment.reject_reason_code)
        .bind(&payment.reject_reason_desc)
        .bind(&payment.last_report_id)
        .bind(payment.last_report_at)
        .bind(&payment.response_data)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_by_msg_and_pmt_inf(
        &self,
        msg_id: &str,
        pmt_inf_id: &str,
    ) -> Result<Option<SepaPayment>, RailError> {
        let row = sqlx::query(&format!(
            "SELECT {SEPA_COLUMNS} FROM sepa_payments WHERE msg_id = $1 AND pmt_inf_id = $2"
        ))
        .bind(msg_id)
        .bind(pmt_inf_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Self::row_to_payment(&r)).transpose()
    }

    async fn get_by_end_to_end_id(
        &self,
        end_to_end_id: &str,
    ) -> Result<Option<SepaPayment>, RailError> {
        let row = sqlx::query(&format!(
            "SELECT {SEPA_COLUMNS} FROM sepa_payments WHERE end_to_end_id = $1"
        ))
        .bind(end_to_end_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Self::row_to_payment(&r)).transpose()
    }

    async fn update_status(
        &self,
        msg_id: &str,
        pmt_inf_id: &str,
        status: SepaStatus,
        response_data: serde_json::Value,
    ) -> Result<(), RailError> {
        let result = sqlx::query(
            r#"
            UPDATE sepa_payments
            SET sepa_status = $3, response_data = $4, updated_at = NOW()
            WHERE msg_id = $1 AND pmt_inf_id = $2
            "#,
        )
        .bind(msg_id)
        .bind(pmt_inf_id)
        .bind(status.as_str())
        .bind(&response_data)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RailError::NotFound(format!("{msg_id}:{pmt_inf_id}")));
        }
        Ok(())
    }

    async fn mark_accepted(
        &self,
        msg_id: &str,
        pmt_inf_id: &str,
        accepted_at: DateTime<Utc>,
    ) -> Result<bool, RailError> {
        let result = sqlx::query(
            r#"
            UPDATE sepa_payments
            SET sepa_status = 'ACCEPTED', accepted_at = $3, updated_at = NOW()
            WHERE msg_id = $1 AND pmt_inf_id = $2 AND sepa_status = 'SUBMITTED'
            "#,
        )
        .bind(msg_id)
        .bind(pmt_inf_id)
        .bind(accepted_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_settled(
        &self,
        msg_id: &str,
        pmt_inf_id: &str,
        settled_at: DateTime<Utc>,
    ) -> Result<bool, RailError> {
        let result = sqlx::query(
            r#"
            UPDATE sepa_payments
            SET sepa_status = 'SETTLED', settled_at = $3, updated_at = NOW()
            WHERE msg_id = $1 AND pmt_inf_id = $2 AND sepa_status IN ('SUBMITTED', 'ACCEPTED')
            "#,
        )
        .bind(msg_id)
        .bind(pmt_inf_id)
        .bind(settled_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_rejected(
        &self,
        msg_id: &str,
        pmt_inf_id: &str,
        reason_code: &str,
        reason_desc: &str,
    ) -> Result<bool, RailError> {
        let result = sqlx::query(
            r#"
            UPDATE sepa_payments
            SET sepa_status = 'REJECTED', reject_reason_code = $3, reject_reason_desc = $4,
                updated_at = NOW()
            WHERE msg_id = $1 AND pmt_inf_id = $2 AND sepa_status IN ('SUBMITTED', 'ACCEPTED')
            "#,
        )
        .bind(msg_id)
        .bind(pmt_inf_id)
        .bind(reason_code)
        .bind(reason_desc)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_recalled(
        &self,
        msg_id: &str,
        pmt_inf_id: &str,
        recall_ref: &str,
        reason: SepaRecallReason,
        additional_info: &str,
        recalled_at: DateTime<Utc>,
    ) -> Result<bool, RailError> {
        let result = sqlx::query(
            r#"
            UPDATE sepa_payments
            SET sepa_status = 'RECALLED', recall_ref = $3, recall_reason = $4,
                recall_additional_info = $5, recalled_at = $6, updated_at = NOW()
            WHERE msg_id = $1 AND pmt_inf_id = $2 AND sepa_status = 'SETTLED'
            "#,
        )
        .bind(msg_id)
        .bind(pmt_inf_id)
        .bind(recall_ref)
        .bind(reason.as_str())
        .bind(additional_info)
        .bind(recalled_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_returned(
        &self,
        msg_id: &str,
        pmt_inf_id: &str,
        return_reason: &str,
        returned_at: DateTime<Utc>,
    ) -> Result<bool, RailError> {
        let result = sqlx::query(
            r#"
            UPDATE sepa_payments
            SET sepa_status = 'RETURNED', return_reason = $3, returned_at = $4, updated_at = NOW()
            WHERE msg_id = $1 AND pmt_inf_id = $2 AND sepa_status IN ('SETTLED', 'RECALLED')
            "#,
        )
        .bind(msg_id)
        .bind(pmt_inf_id)
        .bind(return_reason)
        .bind(returned_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_report_touch(
        &self,
        msg_id: &str,
        pmt_inf_id: &str,
        report_id: &str,
    ) -> Result<(), RailError> {
        sqlx::query(
            r#"
            UPDATE sepa_payments
            SET last_report_id = $3, last_report_at = NOW()
            WHERE msg_id = $1 AND pmt_inf_id = $2
            "#,
        )
        .bind(msg_id)
        .bind(pmt_inf_id)
        .bind(report_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<SepaPayment>, RailError> {
        let rows = sqlx::query(&format!(
            "SELECT {SEPA_COLUMNS} FROM sepa_payments \
             WHERE sepa_status IN ('SUBMITTED', 'ACCEPTED') AND submitted_at < $1 \
             ORDER BY submitted_at ASC LIMIT $2"
        ))
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_payment).collect()
    }
}

pub struct PostgresSepaReportStore {
    pool: PgPool,
}

impl PostgresSepaReportStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SepaReportStore for PostgresSepaReportStore {
    async fn create(&self, report: &SepaReport) -> Result<bool, RailError> {
        let result = sqlx::query(
            r#"
            INSERT INTO sepa_reports
                (id, report_type, file_hash, status, payments_updated, error_message,
                 received_at, processed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (file_hash) DO NOTHING
            "#,
        )
        .bind(&report.id)
        .bind(&report.report_type)
        .bind(&report.file_hash)
        .bind(report.status.as_str())
        .bind(report.payments_updated)
        .bind(&report.error_message)
        .bind(report.received_at)
        .bind(report.processed_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_processed(&self, id: &str, payments_updated: i32) -> Result<(), RailError> {
        sqlx::query(
            "UPDATE sepa_reports SET status = 'PROCESSED', payments_updated = $2, \
             processed_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(payments_updated)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: &str, error: &str) -> Result<(), RailError> {
        sqlx::query("UPDATE sepa_reports SET status = 'FAILED', error_message = $2 WHERE id = $1")
            .bind(id)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Default)]
pub struct MemorySepaStore {
    payments: Mutex<HashMap<(String, String), SepaPayment>>,
}

impl MemorySepaStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn transition<F>(
        &self,
        msg_id: &str,
        pmt_inf_id: &str,
        allowed_from: &[SepaStatus],
        apply: F,
    ) -> Result<bool, RailError>
    where
        F: FnOnce(&mut SepaPayment),
    {
        let mut payments = self.payments.lock().await;
        match payments.get_mut(&(msg_id.to_string(), pmt_inf_id.to_string())) {
            Some(payment) if allowed_from.contains(&payment.status) => {
                apply(payment);
                payment.updated_at = Utc::now();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(RailError::NotFound(format!("{msg_id}:{pmt_inf_id}"))),
        }
    }
}

#[async_trait]
impl SepaStore for MemorySepaStore {
    async fn create(&self, payment: &SepaPayment) -> Result<(), RailError> {
        let mut payments = self.payments.lock().await;
        payments.insert(
            (payment.msg_id.clone(), payment.pmt_inf_id.clone()),
            payment.clone(),
        );
        Ok(())
    }

    async fn get_by_msg_and_pmt_inf(
        &self,
        msg_id: &str,
        pmt_inf_id: &str,
    ) -> Result<Option<SepaPayment>, RailError> {
        let payments = self.payments.lock().await;
        Ok(payments
            .get(&(msg_id.to_string(), pmt_inf_id.to_string()))
            .cloned())
    }

    async fn get_by_end_to_end_id(
        &self,
        end_to_end_id: &str,
    ) -> Result<Option<SepaPayment>, RailError> {
        let payments = self.payments.lock().await;
        Ok(payments
            .values()
            .find(|p| p.end_to_end_id == end_to_end_id)
            .cloned())
    }

    async fn update_status(
        &self,
        msg_id: &str,
        pmt_inf_id: &str,
        status: SepaStatus,
        response_data: serde_json::Value,
    ) -> Result<(), RailError> {
        let mut payments = self.payments.lock().await;
        let payment = payments
            .get_mut(&(msg_id.to_string(), pmt_inf_id.to_string()))
            .ok_or_else(|| RailError::NotFound(format!("{msg_id}:{pmt_inf_id}")))?;
        payment.status = status;
        payment.response_data = response_data;
        payment.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_accepted(
        &self,
        msg_id: &str,
        pmt_inf_id: &str,
        accepted_at: DateTime<Utc>,
    ) -> Result<bool, RailError> {
        self.transition(msg_id, pmt_inf_id, &[SepaStatus::Submitted], |p| {
            p.status = SepaStatus::Accepted;
            p.accepted_at = Some(accepted_at);
        })
        .await
    }

    async fn mark_settled(
        &self,
        msg_id: &str,
        pmt_inf_id: &str,
        settled_at: DateTime<Utc>,
    ) -> Result<bool, RailError> {
        self.transition(
            msg_id,
            pmt_inf_id,
            &[SepaStatus::Submitted, SepaStatus::Accepted],
            |p| {
                p.status = SepaStatus::Settled;
                p.settled_at = Some(settled_at);
            },
        )
        .await
    }

    async fn mark_rejected(
        &self,
        msg_id: &str,
        pmt_inf_id: &str,
        reason_code: &str,
        reason_desc: &str,
    ) -> Result<bool, RailError> {
        self.transition(
            msg_id,
            pmt_inf_id,
            &[SepaStatus::Submitted, SepaStatus::Accepted],
            |p| {
                p.status = SepaStatus::Rejected;
                p.reject_reason_code = Some(reason_code.to_string());
                p.reject_reason_desc = Some(reason_desc.to_string());
            },
        )
        .await
    }

    async fn mark_recalled(
        &self,
        msg_id: &str,
        pmt_inf_id: &str,
        recall_ref: &str,
        reason: SepaRecallReason,
        additional_info: &str,
        recalled_at: DateTime<Utc>,
    ) -> Result<bool, RailError> {
        self.transition(msg_id, pmt_inf_id, &[SepaStatus::Settled], |p| {
            p.status = SepaStatus::Recalled;
            p.recall_ref = Some(recall_ref.to_string());
            p.recall_reason = Some(reason);
            p.recall_additional_info = Some(additional_info.to_string());
            p.recalled_at = Some(recalled_at);
        })
        .await
    }

    async fn mark_returned(
        &self,
        msg_id: &str,
        pmt_inf_id: &str,
        return_reason: &str,
        returned_at: DateTime<Utc>,
    ) -> Result<bool, RailError> {
        self.transition(
            msg_id,
            pmt_inf_id,
            &[SepaStatus::Settled, SepaStatus::Recalled],
            |p| {
                p.status = SepaStatus::Returned;
                p.return_reason = Some(return_reason.to_string());
                p.returned_at = Some(returned_at);
            },
        )
        .await
    }

    async fn record_report_touch(
        &self,
        msg_id: &str,
        pmt_inf_id: &str,
        report_id: &str,
    ) -> Result<(), RailError> {
        let mut payments = self.payments.lock().await;
        if let Some(payment) = payments.get_mut(&(msg_id.to_string(), pmt_inf_id.to_string())) {
            payment.last_report_id = Some(report_id.to_string());
            payment.last_report_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn list_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<SepaPayment>, RailError> {
        let payments = self.payments.lock().await;
        let mut pending: Vec<SepaPayment> = payments
            .values()
            .filter(|p| matches!(p.status, SepaStatus::Submitted | SepaStatus::Accepted))
            .filter(|p| p.submitted_at < older_than)
            .cloned()
            .collect();
        pending.sort_by_key(|p| p.submitted_at);
        pending.truncate(limit as usize);
        Ok(pending)
    }
}

#[derive(Default)]
pub struct MemorySepaReportStore {
    reports: Mutex<Vec<SepaReport>>,
}

impl MemorySepaReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn reports(&self) -> Vec<SepaReport> {
        self.reports.lock().await.clone()
    }
}

#[async_trait]
impl SepaReportStore for MemorySepaReportStore {
    async fn create(&self, report: &SepaReport) -> Result<bool, RailError> {
        let mut reports = self.reports.lock().await;
        if reports.iter().any(|r| r.file_hash == report.file_hash) {
            return Ok(false);
        }
        reports.push(report.clone());
        Ok(true)
    }

    async fn mark_processed(&self, id: &str, payments_updated: i32) -> Result<(), RailError> {
        let mut reports = self.reports.lock().await;
        if let Some(report) = reports.iter_mut().find(|r| r.id == id) {
            report.status = ReportStatus::Processed;
            report.payments_updated = payments_updated;
            report.processed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn mark_failed(&self, id: &str, error: &str) -> Result<(), RailError> {
        let mut reports = self.reports.lock().await;
        if let Some(report) = reports.iter_mut().find(|r| r.id == id) {
            report.status = ReportStatus::Failed;
            report.error_message = Some(error.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payment(msg: &str, pmt: &str) -> SepaPayment {
        SepaPayment {
            id: format!("sepa-{msg}"),
            attempt_id: "att-1".into(),
            intent_id: "int-1".into(),
            msg_id: msg.to_string(),
            pmt_inf_id: pmt.to_string(),
            end_to_end_id: format!("E2E-{msg}"),
            iban: Some("DE89370400440532013000".into()),
            bic: None,
            amount_minor: 1000,
            currency: "EUR".into(),
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
        }
    }

    #[tokio::test]
    async fn test_settle_then_return() {
        let store = MemorySepaStore::new();
        store.create(&payment("MSG1", "PMT1")).await.unwrap();

        assert!(store.mark_settled("MSG1", "PMT1", Utc::now()).await.unwrap());
        assert!(store
            .mark_returned("MSG1", "PMT1", "AC03", Utc::now())
            .await
            .unwrap());

        let stored = store
            .get_by_msg_and_pmt_inf("MSG1", "PMT1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, SepaStatus::Returned);
        assert_eq!(stored.return_reason.as_deref(), Some("AC03"));
    }

    #[tokio::test]
    async fn test_reject_replay_is_noop() {
        let store = MemorySepaStore::new();
        store.create(&payment("MSG1", "PMT1")).await.unwrap();

        assert!(store
            .mark_rejected("MSG1", "PMT1", "AM04", "insufficient funds")
            .await
            .unwrap());
        assert!(!store
            .mark_rejected("MSG1", "PMT1", "AM04", "insufficient funds")
            .await
            .unwrap());
        assert!(!store.mark_settled("MSG1", "PMT1", Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_recall_only_from_settled() {
        let store = MemorySepaStore::new();
        store.create(&payment("MSG1", "PMT1")).await.unwrap();

        assert!(!store
            .mark_recalled(
                "MSG1",
                "PMT1",
                "RC1",
                SepaRecallReason::Fraud,
                "",
                Utc::now()
            )
            .await
            .unwrap());

        store.mark_settled("MSG1", "PMT1", Utc::now()).await.unwrap();
        assert!(store
            .mark_recalled(
                "MSG1",
                "PMT1",
                "RC1",
                SepaRecallReason::Fraud,
                "",
                Utc::now()
            )
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_report_archive_dedups_by_hash() {
        let archive = MemorySepaReportStore::new();
        let report = SepaReport {
            id: "r1".into(),
            report_type: "camt.053".into(),
            file_hash: "abc123".into(),
            status: ReportStatus::Pending,
            payments_updated: 0,
            error_message: None,
            received_at: Utc::now(),
            processed_at: None,
        };

        assert!(archive.create(&report).await.unwrap());

        let mut replay = report.clone();
        replay.id = "r2".into();
        assert!(!archive.create(&replay).await.unwrap());
    }
}
