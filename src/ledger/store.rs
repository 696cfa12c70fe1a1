//! Ledger Persistence
//!
//! The posting transaction is the one place balances are written. It
//! runs SERIALIZABLE: concurrent posts touching the same account
//! serialize, disjoint posts proceed in parallel, and a loser surfaces
//! SQLSTATE 40001 which the service retries.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::sync::Mutex;

use super::error::LedgerError;
use super::models::{
    Account, AccountStatus, AccountType, Batch, BatchStatus, Entry, EntryType, NormalBalance,
    SourceType,
};
use crate::db;
use crate::money::{Currency, Money};
use crate::outbox::{enqueue_tx, OutboxEvent, OutboxStore};

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn create_account(&self, account: &Account) -> Result<(), LedgerError>;

    async fn get_account(&self, tenant_id: &str, id: &str) -> Result<Account, LedgerError>;

    /// Account lookup without tenant scoping, for balance reads keyed by id.
    async fn get_account_by_id(&self, id: &str) -> Result<Account, LedgerError>;

    async fn get_account_by_code(&self, tenant_id: &str, code: &str)
        -> Result<Account, LedgerError>;

    async fn list_accounts(
        &self,
        tenant_id: &str,
        account_type: Option<AccountType>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Account>, i64), LedgerError>;

    /// Commit a validated pending batch: insert batch + entries, fill
    /// `balance_after` per entry under account row locks, flip the batch
    /// to posted, and co-commit the outbox row. All in one serializable
    /// transaction.
    async fn post_batch(
        &self,
        batch: &Batch,
        outbox_event: &OutboxEvent,
    ) -> Result<Batch, LedgerError>;

    async fn get_batch(&self, tenant_id: &str, id: &str) -> Result<Batch, LedgerError>;

    async fn get_batch_with_entries(
        &self,
        tenant_id: &str,
        id: &str,
    ) -> Result<Batch, LedgerError>;

    async fn get_account_balance(&self, account_id: &str) -> Result<i64, LedgerError>;

    /// Entries on an account, newest first.
    async fn get_account_entries(
        &self,
        account_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Entry>, i64), LedgerError>;

    /// Status flip `posted -> reversed`. Posts no entries.
    async fn reverse_batch(
        &self,
        tenant_id: &str,
        batch_id: &str,
        actor: &str,
        reason: &str,
    ) -> Result<Batch, LedgerError>;
}

// ============================================================================
// PostgreSQL
// ============================================================================

pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_post_error(err: sqlx::Error) -> LedgerError {
        if db::is_serialization_failure(&err) {
            LedgerError::SerializationFailure
        } else if db::is_unique_violation(&err) {
            LedgerError::Duplicate(err.to_string())
        } else {
            LedgerError::Database(err)
        }
    }

    fn row_to_account(row: &sqlx::postgres::PgRow) -> Result<Account, LedgerError> {
        let account_type_str: String = row.get("account_type");
        let account_type = AccountType::from_str(&account_type_str)
            .ok_or_else(|| LedgerError::Validation(format!("bad account_type {account_type_str}")))?;
        let normal_str: String = row.get("normal_balance");
        let status_str: String = row.get("status");
        let metadata: serde_json::Value = row.get("metadata");

        Ok(Account {
            id: row.get("id"),
            tenant_id: row.get("tenant_id"),
            code: row.get("code"),
            name: row.get("name"),
            description: row.get::<Option<String>, _>("description").unwrap_or_default(),
            account_type,
            normal_balance: NormalBalance::from_str(&normal_str)
                .unwrap_or_else(|| account_type.normal_balance()),
            currency: Currency::new(&row.get::<String, _>("currency")),
            parent_id: row.get("parent_id"),
            path: row.get("path"),
            is_system: row.get("is_system"),
            is_placeholder: row.get("is_placeholder"),
            status: AccountStatus::from_str(&status_str).unwrap_or(AccountStatus::Active),
            metadata: serde_json::from_value(metadata).unwrap_or_default(),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn row_to_batch(row: &sqlx::postgres::PgRow) -> Result<Batch, LedgerError> {
        let source_type_str: String = row.get("source_type");
        let status_str: String = row.get("status");
        let currency = Currency::new(&row.get::<String, _>("currency"));
        let metadata: serde_json::Value = row.get("metadata");

        Ok(Batch {
            id: row.get("id"),
            tenant_id: row.get("tenant_id"),
            reference: row.get::<Option<String>, _>("reference").unwrap_or_default(),
            description: row.get::<Option<String>, _>("description").unwrap_or_default(),
            source_type: SourceType::from_str(&source_type_str)
                .ok_or_else(|| LedgerError::Validation(format!("bad source_type {source_type_str}")))?,
            source_id: row.get::<Option<String>, _>("source_id").unwrap_or_default(),
            total_debits: Money::new(row.get("total_debits"), currency.clone()),
            total_credits: Money::new(row.get("total_credits"), currency),
            entry_count: row.get::<i32, _>("entry_count") as usize,
            status: BatchStatus::from_str(&status_str)
                .ok_or_else(|| LedgerError::Validation(format!("bad batch status {status_str}")))?,
            posted_at: row.get("posted_at"),
            posted_by: row.get("posted_by"),
            reversed_at: row.get("reversed_at"),
            reversed_by: row.get("reversed_by"),
            reversal_reason: row
                .get::<Option<String>, _>("reversal_reason")
                .unwrap_or_default(),
            metadata: serde_json::from_value(metadata).unwrap_or_default(),
            created_at: row.get("created_at"),
            entries: Vec::new(),
        })
    }

    fn row_to_entry(row: &sqlx::postgres::PgRow) -> Result<Entry, LedgerError> {
        let entry_type_str: String = row.get("entry_type");
        Ok(Entry {
            id: row.get("id"),
            batch_id: row.get("batch_id"),
            account_id: row.get("account_id"),
            entry_type: EntryType::from_str(&entry_type_str)
                .ok_or_else(|| LedgerError::Validation(format!("bad entry_type {entry_type_str}")))?,
            amount: Money::new(
                row.get("amount"),
                Currency::new(&row.get::<String, _>("currency")),
            ),
            balance_after: row.get("balance_after"),
            description: row.get::<Option<String>, _>("description").unwrap_or_default(),
            sequence: row.get("sequence"),
            created_at: row.get("created_at"),
        })
    }

    async fn entries_for_batch_tx(
        tx: &mut Transaction<'_, Postgres>,
        batch_id: &str,
    ) -> Result<Vec<Entry>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT id, batch_id, account_id, entry_type, amount, currency,
                   balance_after, description, sequence, created_at
            FROM ledger_entries
            WHERE batch_id = $1
            ORDER BY sequence
            "#,
        )
        .bind(batch_id)
        .fetch_all(&mut **tx)
        .await?;

        rows.iter().map(Self::row_to_entry).collect()
    }
}

const ACCOUNT_COLUMNS: &str = "id, tenant_id, code, name, description, account_type, \
     normal_balance, currency, parent_id, path, is_system, is_placeholder, status, metadata, \
     created_at, updated_at";

const BATCH_COLUMNS: &str = "id, tenant_id, reference, description, source_type, source_id, \
     total_debits, total_credits, entry_count, currency, status, posted_at, posted_by, \
     reversed_at, reversed_by, reversal_reason, metadata, created_at";

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn create_account(&self, account: &Account) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"
            INSERT INTO ledger_accounts (
                id, tenant_id, code, name, description, account_type, normal_balance,
                currency, parent_id, path, is_system, is_placeholder, status, metadata,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(&account.id)
        .bind(&account.tenant_id)
        .bind(&account.code)
        .bind(&account.name)
        .bind(&account.description)
        .bind(account.account_type.as_str())
        .bind(account.normal_balance.as_str())
        .bind(account.currency.as_str())
        .bind(&account.parent_id)
        .bind(&account.path)
        .bind(account.is_system)
        .bind(account.is_placeholder)
        .bind(account.status.as_str())
        .bind(serde_json::to_value(&account.metadata)?)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if db::is_unique_violation(&e) => Err(LedgerError::Duplicate(format!(
                "account with code {} already exists",
                account.code
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_account(&self, tenant_id: &str, id: &str) -> Result<Account, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM ledger_accounts WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("account {id}")))?;

        Self::row_to_account(&row)
    }

    async fn get_account_by_id(&self, id: &str) -> Result<Account, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM ledger_accounts WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| LedgerError::AccountNotFound(id.to_string()))?;

        Self::row_to_account(&row)
    }

    async fn get_account_by_code(
        &self,
        tenant_id: &str,
        code: &str,
    ) -> Result<Account, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM ledger_accounts WHERE tenant_id = $1 AND code = $2"
        ))
        .bind(tenant_id)
        .bind(code)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("account code {code}")))?;

        Self::row_to_account(&row)
    }

    async fn list_accounts(
        &self,
        tenant_id: &str,
        account_type: Option<AccountType>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Account>, i64), LedgerError> {
        let (rows, total) = match account_type {
            Some(t) => {
                let rows = sqlx::query(&format!(
                    "SELECT {ACCOUNT_COLUMNS} FROM ledger_accounts \
                     WHERE tenant_id = $1 AND account_type = $2 \
                     ORDER BY code LIMIT $3 OFFSET $4"
                ))
                .bind(tenant_id)
                .bind(t.as_str())
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?;

                let total: i64 = sqlx::query(
                    "SELECT COUNT(*) AS n FROM ledger_accounts \
                     WHERE tenant_id = $1 AND account_type = $2",
                )
                .bind(tenant_id)
                .bind(t.as_str())
                .fetch_one(&self.pool)
                .await?
                .get("n");

                (rows, total)
            }
            None => {
                let rows = sqlx::query(&format!(
                    "SELECT {ACCOUNT_COLUMNS} FROM ledger_accounts \
                     WHERE tenant_id = $1 ORDER BY code LIMIT $2 OFFSET $3"
                ))
                .bind(tenant_id)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?;

                let total: i64 =
                    sqlx::query("SELECT COUNT(*) AS n FROM ledger_accounts WHERE tenant_id = $1")
                        .bind(tenant_id)
                        .fetch_one(&self.pool)
                        .await?
                        .get("n");

                (rows, total)
            }
        };

        let accounts = rows
            .iter()
            .map(Self::row_to_account)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((accounts, total))
    }

    async fn post_batch(
        &self,
        batch: &Batch,
        outbox_event: &OutboxEvent,
    ) -> Result<Batch, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(Self::map_post_error)?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(Self::map_post_error)?;

        // Batch row goes in pending; it becomes posted in this same
        // transaction once every balance is written.
        sqlx::query(
            r#"
            INSERT INTO ledger_batches (
                id, tenant_id, reference, description, source_type, source_id,
                total_debits, total_credits, entry_count, currency, status,
                metadata, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(&batch.id)
        .bind(&batch.tenant_id)
        .bind(&batch.reference)
        .bind(&batch.description)
        .bind(batch.source_type.as_str())
        .bind(&batch.source_id)
        .bind(batch.total_debits.amount_minor)
        .bind(batch.total_credits.amount_minor)
        .bind(batch.entry_count as i32)
        .bind(batch.total_debits.currency.as_str())
        .bind(BatchStatus::Pending.as_str())
        .bind(serde_json::to_value(&batch.metadata)?)
        .bind(batch.created_at)
        .execute(&mut *tx)
        .await
        .map_err(Self::map_post_error)?;

        for entry in &batch.entries {
            sqlx::query(
                r#"
                INSERT INTO ledger_entries (
                    id, batch_id, account_id, entry_type, amount, currency,
                    balance_after, description, sequence, created_at
                ) VALUES ($1, $2, $3, $4, $5, $6, NULL, $7, $8, $9)
                "#,
            )
            .bind(&entry.id)
            .bind(&entry.batch_id)
            .bind(&entry.account_id)
            .bind(entry.entry_type.as_str())
            .bind(entry.amount.amount_minor)
            .bind(entry.amount.currency.as_str())
            .bind(&entry.description)
            .bind(entry.sequence)
            .bind(entry.created_at)
            .execute(&mut *tx)
            .await
            .map_err(Self::map_post_error)?;
        }

        // Running balances, in sequence order, each under a row lock on
        // the account so concurrent posts to the same account serialize.
        for entry in &batch.entries {
            let account_row = sqlx::query(
                "SELECT normal_balance, is_placeholder FROM ledger_accounts WHERE id = $1 FOR UPDATE",
            )
            .bind(&entry.account_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(Self::map_post_error)?
            .ok_or_else(|| LedgerError::AccountNotFound(entry.account_id.clone()))?;

            if account_row.get::<bool, _>("is_placeholder") {
                return Err(LedgerError::PlaceholderAccount(entry.account_id.clone()));
            }

            let normal_str: String = account_row.get("normal_balance");
            let normal = NormalBalance::from_str(&normal_str)
                .ok_or_else(|| LedgerError::Validation(format!("bad normal_balance {normal_str}")))?;

            let prev: i64 = sqlx::query(
                r#"
                SELECT COALESCE(
                    (SELECT balance_after FROM ledger_entries
                     WHERE account_id = $1 AND balance_after IS NOT NULL
                     ORDER BY created_at DESC, sequence DESC LIMIT 1),
                    0
                ) AS balance
                "#,
            )
            .bind(&entry.account_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(Self::map_post_error)?
            .get("balance");

            let increases = match normal {
                NormalBalance::Debit => entry.entry_type == EntryType::Debit,
                NormalBalance::Credit => entry.entry_type == EntryType::Credit,
            };
            let new_balance = if increases {
                prev + entry.amount.amount_minor
            } else {
                prev - entry.amount.amount_minor
            };

            sqlx::query("UPDATE ledger_entries SET balance_after = $1 WHERE id = $2")
                .bind(new_balance)
                .bind(&entry.id)
                .execute(&mut *tx)
                .await
                .map_err(Self::map_post_error)?;
        }

        sqlx::query(
            "UPDATE ledger_batches SET status = $1, posted_at = NOW(), posted_by = $2 WHERE id = $3",
        )
        .bind(BatchStatus::Posted.as_str())
        .bind(&batch.posted_by)
        .bind(&batch.id)
        .execute(&mut *tx)
        .await
        .map_err(Self::map_post_error)?;

        enqueue_tx(&mut tx, outbox_event)
            .await
            .map_err(|e| LedgerError::Validation(e.to_string()))?;

        let entries = Self::entries_for_batch_tx(&mut tx, &batch.id).await?;

        tx.commit().await.map_err(Self::map_post_error)?;

        let mut posted = batch.clone();
        posted.status = BatchStatus::Posted;
        posted.posted_at = Some(Utc::now());
        posted.entries = entries;
        Ok(posted)
    }

    async fn get_batch(&self, tenant_id: &str, id: &str) -> Result<Batch, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {BATCH_COLUMNS} FROM ledger_batches WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("batch {id}")))?;

        Self::row_to_batch(&row)
    }

    async fn get_batch_with_entries(
        &self,
        tenant_id: &str,
        id: &str,
    ) -> Result<Batch, LedgerError> {
        let mut batch = self.get_batch(tenant_id, id).await?;

        let rows = sqlx::query(
            r#"
            SELECT id, batch_id, account_id, entry_type, amount, currency,
                   balance_after, description, sequence, created_at
            FROM ledger_entries
            WHERE batch_id = $1
            ORDER BY sequence
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        batch.entries = rows
            .iter()
            .map(Self::row_to_entry)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(batch)
    }

    async fn get_account_balance(&self, account_id: &str) -> Result<i64, LedgerError> {
        // Distinguish "no entries yet" from "no such account".
        self.get_account_by_id(account_id).await.map_err(|e| match e {
            LedgerError::AccountNotFound(id) => LedgerError::NotFound(format!("account {id}")),
            other => other,
        })?;

        let balance: i64 = sqlx::query(
            r#"
            SELECT COALESCE(
                (SELECT balance_after FROM ledger_entries
                 WHERE account_id = $1 AND balance_after IS NOT NULL
                 ORDER BY created_at DESC, sequence DESC LIMIT 1),
                0
            ) AS balance
            "#,
        )
        .bind(account_id)
        .fetch_one(&self.pool)
        .await?
        .get("balance");

        Ok(balance)
    }

    async fn get_account_entries(
        &self,
        account_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Entry>, i64), LedgerError> {
        let lower = from.unwrap_or(DateTime::<Utc>::MIN_UTC);
        let upper = to.unwrap_or(DateTime::<Utc>::MAX_UTC);

        let rows = sqlx::query(
            r#"
            SELECT id, batch_id, account_id, entry_type, amount, currency,
                   balance_after, description, sequence, created_at
            FROM ledger_entries
            WHERE account_id = $1 AND created_at >= $2 AND created_at <= $3
            ORDER BY created_at DESC, sequence DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(account_id)
        .bind(lower)
        .bind(upper)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM ledger_entries \
             WHERE account_id = $1 AND created_at >= $2 AND created_at <= $3",
        )
        .bind(account_id)
        .bind(lower)
        .bind(upper)
        .fetch_one(&self.pool)
        .await?
        .get("n");

        let entries = rows
            .iter()
            .map(Self::row_to_entry)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((entries, total))
    }

    async fn reverse_batch(
        &self,
        tenant_id: &str,
        batch_id: &str,
        actor: &str,
        reason: &str,
    ) -> Result<Batch, LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE ledger_batches
            SET status = 'reversed', reversed_at = NOW(), reversed_by = $1, reversal_reason = $2
            WHERE tenant_id = $3 AND id = $4 AND status = 'posted'
            "#,
        )
        .bind(actor)
        .bind(reason)
        .bind(tenant_id)
        .bind(batch_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Lost the CAS; inspect the row to say why.
            let current = self.get_batch(tenant_id, batch_id).await?;
            return match current.status {
                BatchStatus::Reversed => Err(LedgerError::AlreadyReversed(batch_id.to_string())),
                _ => Err(LedgerError::NotPosted(batch_id.to_string())),
            };
        }

        self.get_batch_with_entries(tenant_id, batch_id).await
    }
}

// ============================================================================
// In-memory (tests and local wiring)
// ============================================================================

#[derive(Default)]
struct MemoryLedgerState {
    accounts: HashMap<String, Account>,
    batches: HashMap<String, Batch>,
    /// Posted entries per account, in posting order.
    entries_by_account: HashMap<String, Vec<Entry>>,
}

/// Mutex-guarded maps standing in for the database. Each method takes
/// the lock once, so the same atomicity the Postgres transaction gives.
pub struct MemoryLedgerStore {
    state: Mutex<MemoryLedgerState>,
    outbox: std::sync::Arc<crate::outbox::MemoryOutboxStore>,
}

impl MemoryLedgerStore {
    pub fn new(outbox: std::sync::Arc<crate::outbox::MemoryOutboxStore>) -> Self {
        Self {
            state: Mutex::new(MemoryLedgerState::default()),
            outbox,
        }
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn create_account(&self, account: &Account) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        let clash = state
            .accounts
            .values()
            .any(|a| a.tenant_id == account.tenant_id && a.code == account.code);
        if clash {
            return Err(LedgerError::Duplicate(format!(
                "account with code {} already exists",
                account.code
            )));
        }
        state.accounts.insert(account.id.clone(), account.clone());
        Ok(())
    }

    async fn get_account(&self, tenant_id: &str, id: &str) -> Result<Account, LedgerError> {
        let state = self.state.lock().await;
        state
            .accounts
            .get(id)
            .filter(|a| a.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("account {id}")))
    }

    async fn get_account_by_id(&self, id: &str) -> Result<Account, LedgerError> {
        let state = self.state.lock().await;
        state
            .accounts
            .get(id)
            .cloned()
            .ok_or_else(|| LedgerError::AccountNotFound(id.to_string()))
    }

    async fn get_account_by_code(
        &self,
        tenant_id: &str,
        code: &str,
    ) -> Result<Account, LedgerError> {
        let state = self.state.lock().await;
        state
            .accounts
            .values()
            .find(|a| a.tenant_id == tenant_id && a.code == code)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("account code {code}")))
    }

    async fn list_accounts(
        &self,
        tenant_id: &str,
        account_type: Option<AccountType>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Account>, i64), LedgerError> {
        let state = self.state.lock().await;
        let mut accounts: Vec<Account> = state
            .accounts
            .values()
            .filter(|a| a.tenant_id == tenant_id)
            .filter(|a| account_type.map(|t| a.account_type == t).unwrap_or(true))
            .cloned()
            .collect();
        accounts.sort_by(|a, b| a.code.cmp(&b.code));

        let total = accounts.len() as i64;
        let page = accounts
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();
        Ok((page, total))
    }

    async fn post_batch(
        &self,
        batch: &Batch,
        outbox_event: &OutboxEvent,
    ) -> Result<Batch, LedgerError> {
        let mut state = self.state.lock().await;

        if state.batches.contains_key(&batch.id) {
            return Err(LedgerError::Duplicate(format!("batch {}", batch.id)));
        }

        // Validate all accounts before any balance moves.
        for entry in &batch.entries {
            let account = state
                .accounts
                .get(&entry.account_id)
                .ok_or_else(|| LedgerError::AccountNotFound(entry.account_id.clone()))?;
            if !account.can_have_entries() {
                return Err(LedgerError::PlaceholderAccount(entry.account_id.clone()));
            }
        }

        let mut posted = batch.clone();
        posted.status = BatchStatus::Posted;
        posted.posted_at = Some(Utc::now());

        for entry in posted.entries.iter_mut() {
            let normal = state
                .accounts
                .get(&entry.account_id)
                .map(|a| a.normal_balance)
                .ok_or_else(|| LedgerError::AccountNotFound(entry.account_id.clone()))?;
            let prev = state
                .entries_by_account
                .get(&entry.account_id)
                .and_then(|entries| entries.last())
                .and_then(|e| e.balance_after)
                .unwrap_or(0);

            let increases = match normal {
                NormalBalance::Debit => entry.entry_type == EntryType::Debit,
                NormalBalance::Credit => entry.entry_type == EntryType::Credit,
            };
            let new_balance = if increases {
                prev + entry.amount.amount_minor
            } else {
                prev - entry.amount.amount_minor
            };
            entry.balance_after = Some(new_balance);

            state
                .entries_by_account
                .entry(entry.account_id.clone())
                .or_default()
                .push(entry.clone());
        }

        state.batches.insert(posted.id.clone(), posted.clone());
        drop(state);

        self.outbox
            .enqueue(std::slice::from_ref(outbox_event))
            .await
            .map_err(|e| LedgerError::Validation(e.to_string()))?;

        Ok(posted)
    }

    async fn get_batch(&self, tenant_id: &str, id: &str) -> Result<Batch, LedgerError> {
        let state = self.state.lock().await;
        state
            .batches
            .get(id)
            .filter(|b| b.tenant_id == tenant_id)
            .cloned()
            .map(|mut b| {
                b.entries = Vec::new();
                b
            })
            .ok_or_else(|| LedgerError::NotFound(format!("batch {id}")))
    }

    async fn get_batch_with_entries(
        &self,
        tenant_id: &str,
        id: &str,
    ) -> Result<Batch, LedgerError> {
        let state = self.state.lock().await;
        state
            .batches
            .get(id)
            .filter(|b| b.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("batch {id}")))
    }

    async fn get_account_balance(&self, account_id: &str) -> Result<i64, LedgerError> {
        let state = self.state.lock().await;
        if !state.accounts.contains_key(account_id) {
            return Err(LedgerError::NotFound(format!("account {account_id}")));
        }
        Ok(state
            .entries_by_account
            .get(account_id)
            .and_then(|entries| entries.last())
            .and_then(|e| e.balance_after)
            .unwrap_or(0))
    }

    async fn get_account_entries(
        &self,
        account_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Entry>, i64), LedgerError> {
        let state = self.state.lock().await;
        let mut entries: Vec<Entry> = state
            .entries_by_account
            .get(account_id)
            .map(|v| v.clone())
            .unwrap_or_default()
            .into_iter()
            .filter(|e| from.map(|f| e.created_at >= f).unwrap_or(true))
            .filter(|e| to.map(|t| e.created_at <= t).unwrap_or(true))
            .collect();

        // Newest first
        entries.reverse();
        let total = entries.len() as i64;
        let page = entries
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();
        Ok((page, total))
    }

    async fn reverse_batch(
        &self,
        tenant_id: &str,
        batch_id: &str,
        actor: &str,
        reason: &str,
    ) -> Result<Batch, LedgerError> {
        let mut state = self.state.lock().await;
        let batch = state
            .batches
            .get_mut(batch_id)
            .filter(|b| b.tenant_id == tenant_id)
            .ok_or_else(|| LedgerError::NotFound(format!("batch {batch_id}")))?;

        batch.mark_reversed(actor, reason)?;
        Ok(batch.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Envelope, EVENT_LEDGER_BATCH_POSTED};
    use crate::ledger::models::BatchBuilder;
    use crate::outbox::MemoryOutboxStore;
    use std::sync::Arc;

    fn eur(amount: i64) -> Money {
        Money::new(amount, Currency::new("EUR"))
    }

    async fn store_with_accounts() -> (MemoryLedgerStore, Arc<MemoryOutboxStore>) {
        let outbox = Arc::new(MemoryOutboxStore::new());
        let store = MemoryLedgerStore::new(outbox.clone());

        let clearing = Account::new(
            "acct-clearing",
            "tenant-a",
            "1300",
            "Pending Settlements",
            AccountType::Asset,
            Currency::new("EUR"),
        )
        .unwrap();
        let wallet = Account::new(
            "acct-wallet",
            "tenant-a",
            "2000",
            "Customer Wallet Liabilities",
            AccountType::Liability,
            Currency::new("EUR"),
        )
        .unwrap();

        store.create_account(&clearing).await.unwrap();
        store.create_account(&wallet).await.unwrap();
        (store, outbox)
    }

    fn sample_batch(id: &str, amount: i64) -> Batch {
        BatchBuilder::new(id, "tenant-a", SourceType::Deposit, Currency::new("EUR"))
            .debit(&format!("{id}-e1"), "acct-clearing", eur(amount), "")
            .credit(&format!("{id}-e2"), "acct-wallet", eur(amount), "")
            .build()
            .unwrap()
    }

    fn outbox_event(batch: &Batch) -> OutboxEvent {
        let env = Envelope::new(
            EVENT_LEDGER_BATCH_POSTED,
            &batch.tenant_id,
            "ledger_batch",
            &batch.id,
            &(),
        )
        .unwrap();
        OutboxEvent::from_envelope(&env).unwrap()
    }

    #[tokio::test]
    async fn test_post_batch_fills_running_balances() {
        let (store, outbox) = store_with_accounts().await;

        let b1 = sample_batch("b1", 1000);
        let posted = store.post_batch(&b1, &outbox_event(&b1)).await.unwrap();

        assert_eq!(posted.status, BatchStatus::Posted);
        assert_eq!(posted.entries[0].balance_after, Some(1000));
        assert_eq!(posted.entries[1].balance_after, Some(1000));

        let b2 = sample_batch("b2", 500);
        let posted2 = store.post_batch(&b2, &outbox_event(&b2)).await.unwrap();
        assert_eq!(posted2.entries[0].balance_after, Some(1500));
        assert_eq!(posted2.entries[1].balance_after, Some(1500));

        assert_eq!(store.get_account_balance("acct-clearing").await.unwrap(), 1500);
        assert_eq!(store.get_account_balance("acct-wallet").await.unwrap(), 1500);
        assert_eq!(outbox.count_of(EVENT_LEDGER_BATCH_POSTED).await, 2);
    }

    #[tokio::test]
    async fn test_post_batch_unknown_account() {
        let (store, _outbox) = store_with_accounts().await;

        let batch = BatchBuilder::new("b1", "tenant-a", SourceType::Deposit, Currency::new("EUR"))
            .debit("e1", "missing", eur(100), "")
            .credit("e2", "acct-wallet", eur(100), "")
            .build()
            .unwrap();

        let err = store.post_batch(&batch, &outbox_event(&batch)).await.unwrap_err();
        assert_eq!(err.code(), "ACCOUNT_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_post_batch_placeholder_account_rejected() {
        let (store, _outbox) = store_with_accounts().await;

        let mut placeholder = Account::new(
            "acct-ph",
            "tenant-a",
            "9999",
            "Grouping",
            AccountType::Asset,
            Currency::new("EUR"),
        )
        .unwrap();
        placeholder.is_placeholder = true;
        store.create_account(&placeholder).await.unwrap();

        let batch = BatchBuilder::new("b1", "tenant-a", SourceType::Deposit, Currency::new("EUR"))
            .debit("e1", "acct-ph", eur(100), "")
            .credit("e2", "acct-wallet", eur(100), "")
            .build()
            .unwrap();

        let err = store.post_batch(&batch, &outbox_event(&batch)).await.unwrap_err();
        assert_eq!(err.code(), "PLACEHOLDER_ACCOUNT");
    }

    #[tokio::test]
    async fn test_duplicate_account_code() {
        let (store, _outbox) = store_with_accounts().await;
        let dup = Account::new(
            "acct-other",
            "tenant-a",
            "1300",
            "Clash",
            AccountType::Asset,
            Currency::new("EUR"),
        )
        .unwrap();
        let err = store.create_account(&dup).await.unwrap_err();
        assert_eq!(err.code(), "DUPLICATE");
    }

    #[tokio::test]
    async fn test_reverse_batch_flow() {
        let (store, outbox) = store_with_accounts().await;
        let batch = sample_batch("b1", 1000);
        store.post_batch(&batch, &outbox_event(&batch)).await.unwrap();
        drop(outbox);

        let reversed = store
            .reverse_batch("tenant-a", "b1", "ops", "posted in error")
            .await
            .unwrap();
        assert_eq!(reversed.status, BatchStatus::Reversed);

        let err = store
            .reverse_batch("tenant-a", "b1", "ops", "again")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ALREADY_REVERSED");
    }

    #[tokio::test]
    async fn test_entries_newest_first() {
        let (store, _outbox) = store_with_accounts().await;
        for (i, amount) in [100i64, 200, 300].iter().enumerate() {
            let batch = sample_batch(&format!("b{i}"), *amount);
            store.post_batch(&batch, &outbox_event(&batch)).await.unwrap();
        }

        let (entries, total) = store
            .get_account_entries("acct-wallet", None, None, 10, 0)
            .await
            .unwrap();
        assert_eq!(total, 3);
        assert_eq!(entries[0].amount.amount_minor, 300);
        assert_eq!(entries[2].amount.amount_minor, 100);
    }

    #[tokio::test]
    async fn test_balance_unknown_account_is_not_found() {
        let (store, _outbox) = store_with_accounts().await;
        let err = store.get_account_balance("nope").await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }
}
