//! Transactional Outbox
//!
//! Domain writes and the events describing them commit in the same
//! database transaction; a drainer later pushes pending rows to the bus.
//! This is what makes "every published event corresponds to a committed
//! state change" hold.

pub mod drainer;

pub use drainer::{DrainerConfig, OutboxDrainer};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Row, Transaction};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::events::Envelope;

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Published,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Published => "published",
            OutboxStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OutboxStatus::Pending),
            "published" => Some(OutboxStatus::Published),
            "failed" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }
}

/// A row in `outbox_events`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: String,
    pub tenant_id: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    /// The full envelope, published verbatim.
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub attempts: i32,
    pub next_retry_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OutboxEvent {
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, OutboxError> {
        Ok(Self {
            id: envelope.id.clone(),
            tenant_id: envelope.tenant_id.clone(),
            aggregate_type: envelope.aggregate_type.clone(),
            aggregate_id: envelope.aggregate_id.clone(),
            event_type: envelope.event_type.clone(),
            payload: serde_json::to_value(envelope)?,
            status: OutboxStatus::Pending,
            attempts: 0,
            next_retry_at: Utc::now(),
            published_at: None,
            last_error: None,
            created_at: Utc::now(),
        })
    }

    pub fn envelope(&self) -> Result<Envelope, OutboxError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert pending rows. Postgres callers on a domain transaction use
    /// [`enqueue_tx`] instead so the rows co-commit with the domain rows.
    async fn enqueue(&self, events: &[OutboxEvent]) -> Result<(), OutboxError>;

    /// Pending rows due for delivery, oldest first.
    async fn fetch_due(&self, limit: i64) -> Result<Vec<OutboxEvent>, OutboxError>;

    async fn mark_published(&self, id: &str) -> Result<(), OutboxError>;

    async fn mark_failed(
        &self,
        id: &str,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), OutboxError>;

    /// Try to take the drain lock for a shard. A second drainer on the
    /// same shard gets `false` and skips the scan.
    async fn try_lock_shard(&self, shard: i64) -> Result<bool, OutboxError>;

    async fn unlock_shard(&self, shard: i64) -> Result<(), OutboxError>;

    async fn pending_count(&self) -> Result<i64, OutboxError>;
}

/// Insert an outbox row inside an open domain transaction.
pub async fn enqueue_tx(
    tx: &mut Transaction<'_, Postgres>,
    event: &OutboxEvent,
) -> Result<(), OutboxError> {
    sqlx::query(
        r#"
        INSERT INTO outbox_events
            (id, tenant_id, aggregate_type, aggregate_id, event_type, payload,
             status, attempts, next_retry_at, published_at, last_error, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(&event.id)
    .bind(&event.tenant_id)
    .bind(&event.aggregate_type)
    .bind(&event.aggregate_id)
    .bind(&event.event_type)
    .bind(&event.payload)
    .bind(event.status.as_str())
    .bind(event.attempts)
    .bind(event.next_retry_at)
    .bind(event.published_at)
    .bind(&event.last_error)
    .bind(event.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// PostgreSQL-backed outbox store.
pub struct PostgresOutboxStore {
    pool: PgPool,
    /// Advisory locks are session-scoped: the shard lock must be taken
    /// and released on the same connection, so it is pinned here for
    /// the duration of a drain cycle.
    lock_conn: Mutex<Option<sqlx::pool::PoolConnection<Postgres>>>,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_conn: Mutex::new(None),
        }
    }

    fn row_to_event(row: &sqlx::postgres::PgRow) -> Result<OutboxEvent, OutboxError> {
        let status_str: String = row.get("status");
        Ok(OutboxEvent {
            id: row.get("id"),
            tenant_id: row.get("tenant_id"),
            aggregate_type: row.get("aggregate_type"),
            aggregate_id: row.get("aggregate_id"),
            event_type: row.get("event_type"),
            payload: row.get("payload"),
            status: OutboxStatus::from_str(&status_str).unwrap_or(OutboxStatus::Pending),
            attempts: row.get("attempts"),
            next_retry_at: row.get("next_retry_at"),
            published_at: row.get("published_at"),
            last_error: row.get("last_error"),
            created_at: row.get("created_at"),
        })
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn enqueue(&self, events: &[OutboxEvent]) -> Result<(), OutboxError> {
        let mut tx = self.pool.begin().await?;
        for event in events {
            enqueue_tx(&mut tx, event).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn fetch_due(&self, limit: i64) -> Result<Vec<OutboxEvent>, OutboxError> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, aggregate_type, aggregate_id, event_type, payload,
                   status, attempts, next_retry_at, published_at, last_error, created_at
            FROM outbox_events
            WHERE status = 'pending' AND next_retry_at <= NOW()
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_event).collect()
    }

    async fn mark_published(&self, id: &str) -> Result<(), OutboxError> {
        sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'published', published_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: &str,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), OutboxError> {
        sqlx::query(
            r#"
            UPDATE outbox_events
            SET attempts = attempts + 1, last_error = $2, next_retry_at = $3
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(next_retry_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn try_lock_shard(&self, shard: i64) -> Result<bool, OutboxError> {
        let mut conn = self.pool.acquire().await?;
        let locked: bool = sqlx::query("SELECT pg_try_advisory_lock($1) AS locked")
            .bind(shard)
            .fetch_one(&mut *conn)
            .await?
            .get("locked");

        if locked {
            *self.lock_conn.lock().await = Some(conn);
        }
        Ok(locked)
    }

    async fn unlock_shard(&self, shard: i64) -> Result<(), OutboxError> {
        if let Some(mut conn) = self.lock_conn.lock().await.take() {
            sqlx::query("SELECT pg_advisory_unlock($1)")
                .bind(shard)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }

    async fn pending_count(&self) -> Result<i64, OutboxError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM outbox_events WHERE status = 'pending'")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n"))
    }
}

/// In-memory outbox used by tests and by the in-memory store stack.
#[derive(Default)]
pub struct MemoryOutboxStore {
    rows: Mutex<Vec<OutboxEvent>>,
}

impl MemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<OutboxEvent> {
        self.rows.lock().await.clone()
    }

    pub async fn count_of(&self, event_type: &str) -> usize {
        self.rows
            .lock()
            .await
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn enqueue(&self, events: &[OutboxEvent]) -> Result<(), OutboxError> {
        let mut rows = self.rows.lock().await;
        rows.extend_from_slice(events);
        Ok(())
    }

    async fn fetch_due(&self, limit: i64) -> Result<Vec<OutboxEvent>, OutboxError> {
        let now = Utc::now();
        let rows = self.rows.lock().await;
        Ok(rows
            .iter()
            .filter(|e| e.status == OutboxStatus::Pending && e.next_retry_at <= now)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn mark_published(&self, id: &str) -> Result<(), OutboxError> {
        let mut rows = self.rows.lock().await;
        if let Some(row) = rows.iter_mut().find(|e| e.id == id) {
            row.status = OutboxStatus::Published;
            row.published_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: &str,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), OutboxError> {
        let mut rows = self.rows.lock().await;
        if let Some(row) = rows.iter_mut().find(|e| e.id == id) {
            row.attempts += 1;
            row.last_error = Some(error.to_string());
            row.next_retry_at = next_retry_at;
        }
        Ok(())
    }

    async fn try_lock_shard(&self, _shard: i64) -> Result<bool, OutboxError> {
        Ok(true)
    }

    async fn unlock_shard(&self, _shard: i64) -> Result<(), OutboxError> {
        Ok(())
    }

    async fn pending_count(&self) -> Result<i64, OutboxError> {
        let rows = self.rows.lock().await;
        Ok(rows
            .iter()
            .filter(|e| e.status == OutboxStatus::Pending)
            .count() as i64)
    }
}

/// Retry schedule: `now + min(cap, base * 2^attempts)`.
pub fn next_retry(attempts: i32, base_secs: u64, cap_secs: u64) -> DateTime<Utc> {
    let exp = base_secs.saturating_mul(1u64 << attempts.clamp(0, 30) as u32);
    let delay = exp.min(cap_secs);
    Utc::now() + Duration::seconds(delay as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Envelope, EVENT_FUNDING_SETTLED};

    fn sample_event(aggregate: &str) -> OutboxEvent {
        let env =
            Envelope::new(EVENT_FUNDING_SETTLED, "t", "funding_intent", aggregate, &()).unwrap();
        OutboxEvent::from_envelope(&env).unwrap()
    }

    #[tokio::test]
    async fn test_memory_enqueue_and_fetch() {
        let store = MemoryOutboxStore::new();
        store
            .enqueue(&[sample_event("i1"), sample_event("i2")])
            .await
            .unwrap();

        let due = store.fetch_due(10).await.unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(store.pending_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_mark_published_removes_from_due() {
        let store = MemoryOutboxStore::new();
        let event = sample_event("i1");
        store.enqueue(&[event.clone()]).await.unwrap();

        store.mark_published(&event.id).await.unwrap();
        assert!(store.fetch_due(10).await.unwrap().is_empty());
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mark_failed_schedules_retry() {
        let store = MemoryOutboxStore::new();
        let event = sample_event("i1");
        store.enqueue(&[event.clone()]).await.unwrap();

        let later = Utc::now() + Duration::seconds(60);
        store.mark_failed(&event.id, "bus down", later).await.unwrap();

        // Not due yet, but still pending.
        assert!(store.fetch_due(10).await.unwrap().is_empty());
        assert_eq!(store.pending_count().await.unwrap(), 1);

        let rows = store.all().await;
        assert_eq!(rows[0].attempts, 1);
        assert_eq!(rows[0].last_error.as_deref(), Some("bus down"));
    }

    #[test]
    fn test_next_retry_backoff_is_capped() {
        let base = 2u64;
        let cap = 300u64;

        let first = next_retry(0, base, cap) - Utc::now();
        assert!(first.num_seconds() <= 2);

        let capped = next_retry(20, base, cap) - Utc::now();
        assert!(capped.num_seconds() <= 300);
        assert!(capped.num_seconds() >= 298);
    }

    #[test]
    fn test_envelope_round_trip_through_payload() {
        let event = sample_event("i9");
        let env = event.envelope().unwrap();
        assert_eq!(env.aggregate_id, "i9");
        assert_eq!(env.event_type, EVENT_FUNDING_SETTLED);
    }
}
