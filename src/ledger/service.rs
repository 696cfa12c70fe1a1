//! Ledger Service
//!
//! Public operations over the double-entry book. Posting validates
//! everything it can before touching the database, then drives the
//! store's serializable transaction, retrying on serialization failure
//! with capped exponential backoff.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, warn};
use ulid::Ulid;

use super::error::LedgerError;
use super::models::{system_accounts, Account, AccountType, Batch, BatchBuilder, Entry, SourceType};
use super::store::LedgerStore;
use crate::config::LedgerConfig;
use crate::events::{Envelope, LedgerBatchPostedData, EVENT_LEDGER_BATCH_POSTED};
use crate::money::{Currency, Money};
use crate::outbox::OutboxEvent;

#[derive(Debug, Clone)]
pub struct CreateAccountRequest {
    pub tenant_id: String,
    pub code: String,
    pub name: String,
    pub description: String,
    pub account_type: AccountType,
    pub currency: Currency,
    pub parent_id: Option<String>,
    pub is_system: bool,
    pub is_placeholder: bool,
}

#[derive(Debug, Clone)]
pub struct EntryRequest {
    pub account_id: String,
    pub entry_type: super::models::EntryType,
    pub amount_minor: i64,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct PostEntriesRequest {
    pub tenant_id: String,
    pub reference: String,
    pub description: String,
    pub source_type: SourceType,
    pub source_id: String,
    pub currency: Currency,
    pub entries: Vec<EntryRequest>,
    pub posted_by: Option<String>,
}

pub struct LedgerService {
    store: Arc<dyn LedgerStore>,
    config: LedgerConfig,
}

impl LedgerService {
    pub fn new(store: Arc<dyn LedgerStore>, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub async fn create_account(
        &self,
        req: CreateAccountRequest,
    ) -> Result<Account, LedgerError> {
        let id = Ulid::new().to_string();
        let mut account = Account::new(
            &id,
            &req.tenant_id,
            &req.code,
            &req.name,
            req.account_type,
            req.currency,
        )?;
        account.description = req.description;
        account.is_system = req.is_system;
        account.is_placeholder = req.is_placeholder;

        if let Some(parent_id) = &req.parent_id {
            let parent = self.store.get_account(&req.tenant_id, parent_id).await?;
            account.set_parent(&parent)?;
        }

        self.store.create_account(&account).await?;

        info!(
            account_id = %account.id,
            code = %account.code,
            account_type = %account.account_type,
            "Ledger account created"
        );

        Ok(account)
    }

    pub async fn get_account(&self, tenant_id: &str, id: &str) -> Result<Account, LedgerError> {
        self.store.get_account(tenant_id, id).await
    }

    pub async fn get_account_by_code(
        &self,
        tenant_id: &str,
        code: &str,
    ) -> Result<Account, LedgerError> {
        self.store.get_account_by_code(tenant_id, code).await
    }

    pub async fn list_accounts(
        &self,
        tenant_id: &str,
        account_type: Option<AccountType>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Account>, i64), LedgerError> {
        let limit = limit.clamp(1, 100);
        self.store
            .list_accounts(tenant_id, account_type, limit, offset.max(0))
            .await
    }

    /// Post a balanced batch. The write and its `ledger.batch.posted`
    /// outbox row commit together; the store retries internally are ours
    /// to drive, bounded by config.
    pub async fn post_entries(&self, req: PostEntriesRequest) -> Result<Batch, LedgerError> {
        let batch = self.build_batch(&req)?;
        self.validate_accounts(&req.tenant_id, &batch).await?;

        let event_data = LedgerBatchPostedData {
            batch_id: batch.id.clone(),
            source_type: batch.source_type.as_str().to_string(),
            source_id: batch.source_id.clone(),
            entry_count: batch.entry_count,
            total_debits: batch.total_debits.amount_minor,
            total_credits: batch.total_credits.amount_minor,
            currency: batch.total_debits.currency.as_str().to_string(),
        };
        let envelope = Envelope::new(
            EVENT_LEDGER_BATCH_POSTED,
            &batch.tenant_id,
            "ledger_batch",
            &batch.id,
            &event_data,
        )
        .map_err(LedgerError::Serde)?;
        let outbox_event =
            OutboxEvent::from_envelope(&envelope).map_err(|e| LedgerError::Validation(e.to_string()))?;

        let mut attempt: u32 = 0;
        let posted = loop {
            match self.store.post_batch(&batch, &outbox_event).await {
                Ok(posted) => break posted,
                Err(LedgerError::SerializationFailure) if attempt + 1 < self.config.max_post_attempts => {
                    attempt += 1;
                    let backoff = self.config.base_backoff() * 2u32.pow(attempt - 1);
                    warn!(
                        batch_id = %batch.id,
                        attempt = attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "Serialization failure posting batch, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        };

        info!(
            batch_id = %posted.id,
            entry_count = posted.entry_count,
            total = posted.total_debits.amount_minor,
            currency = %posted.total_debits.currency,
            "Ledger batch posted"
        );

        Ok(posted)
    }

    fn build_batch(&self, req: &PostEntriesRequest) -> Result<Batch, LedgerError> {
        let batch_id = Ulid::new().to_string();
        let mut builder = BatchBuilder::new(
            &batch_id,
            &req.tenant_id,
            req.source_type,
            req.currency.clone(),
        )
        .with_reference(&req.reference)
        .with_description(&req.description)
        .with_source_id(&req.source_id);

        for entry in &req.entries {
            let entry_id = Ulid::new().to_string();
            let amount = Money::new(entry.amount_minor, req.currency.clone());
            builder = match entry.entry_type {
                super::models::EntryType::Debit => {
                    builder.debit(&entry_id, &entry.account_id, amount, &entry.description)
                }
                super::models::EntryType::Credit => {
                    builder.credit(&entry_id, &entry.account_id, amount, &entry.description)
                }
            };
        }

        let mut batch = builder.build()?;
        batch.posted_by = req.posted_by.clone();
        Ok(batch)
    }

    async fn validate_accounts(&self, tenant_id: &str, batch: &Batch) -> Result<(), LedgerError> {
        let mut seen: HashSet<&str> = HashSet::new();
        for entry in &batch.entries {
            if !seen.insert(entry.account_id.as_str()) {
                continue;
            }

            let account = self.store.get_account_by_id(&entry.account_id).await?;
            if account.tenant_id != tenant_id {
                return Err(LedgerError::AccountNotFound(entry.account_id.clone()));
            }
            if !account.can_have_entries() {
                return Err(LedgerError::PlaceholderAccount(entry.account_id.clone()));
            }
            if account.currency != batch.total_debits.currency {
                return Err(LedgerError::CurrencyMismatch(format!(
                    "account {} is denominated in {}, batch is {}",
                    account.id, account.currency, batch.total_debits.currency
                )));
            }
        }
        Ok(())
    }

    pub async fn get_batch(&self, tenant_id: &str, id: &str) -> Result<Batch, LedgerError> {
        self.store.get_batch_with_entries(tenant_id, id).await
    }

    pub async fn get_account_balance(&self, account_id: &str) -> Result<i64, LedgerError> {
        self.store.get_account_balance(account_id).await
    }

    pub async fn get_account_entries(
        &self,
        account_id: &str,
        from: Option<chrono::DateTime<chrono::Utc>>,
        to: Option<chrono::DateTime<chrono::Utc>>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Entry>, i64), LedgerError> {
        let limit = limit.clamp(1, 100);
        self.store
            .get_account_entries(account_id, from, to, limit, offset.max(0))
            .await
    }

    /// Status flip for pre-posting audit corrections. Financial
    /// reversals post a compensating batch instead.
    pub async fn reverse_batch(
        &self,
        tenant_id: &str,
        batch_id: &str,
        actor: &str,
        reason: &str,
    ) -> Result<Batch, LedgerError> {
        let reversed = self
            .store
            .reverse_batch(tenant_id, batch_id, actor, reason)
            .await?;

        info!(batch_id = %batch_id, actor = %actor, reason = %reason, "Ledger batch reversed");
        Ok(reversed)
    }

    /// Seed the standard chart for a tenant. Safe to call repeatedly.
    pub async fn initialize_system_accounts(
        &self,
        tenant_id: &str,
        currency: Currency,
    ) -> Result<(), LedgerError> {
        for (code, name, account_type) in system_accounts() {
            let req = CreateAccountRequest {
                tenant_id: tenant_id.to_string(),
                code: code.to_string(),
                name: name.to_string(),
                description: String::new(),
                account_type,
                currency: currency.clone(),
                parent_id: None,
                is_system: true,
                is_placeholder: false,
            };

            match self.create_account(req).await {
                Ok(_) => {}
                Err(LedgerError::Duplicate(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        info!(tenant_id = %tenant_id, currency = %currency, "System accounts initialized");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EVENT_LEDGER_BATCH_POSTED;
    use crate::ledger::models::EntryType;
    use crate::ledger::store::MemoryLedgerStore;
    use crate::outbox::MemoryOutboxStore;

    fn service() -> (LedgerService, Arc<MemoryOutboxStore>) {
        let outbox = Arc::new(MemoryOutboxStore::new());
        let store = Arc::new(MemoryLedgerStore::new(outbox.clone()));
        (LedgerService::new(store, LedgerConfig::default()), outbox)
    }

    async fn seeded_service() -> (LedgerService, Arc<MemoryOutboxStore>, Account, Account) {
        let (svc, outbox) = service();
        let clearing = svc
            .create_account(CreateAccountRequest {
                tenant_id: "tenant-a".into(),
                code: "1300".into(),
                name: "Pending Settlements".into(),
                description: String::new(),
                account_type: AccountType::Asset,
                currency: Currency::new("EUR"),
                parent_id: None,
                is_system: true,
                is_placeholder: false,
            })
            .await
            .unwrap();
        let wallet = svc
            .create_account(CreateAccountRequest {
                tenant_id: "tenant-a".into(),
                code: "2000".into(),
                name: "Customer Wallet Liabilities".into(),
                description: String::new(),
                account_type: AccountType::Liability,
                currency: Currency::new("EUR"),
                parent_id: None,
                is_system: true,
                is_placeholder: false,
            })
            .await
            .unwrap();
        (svc, outbox, clearing, wallet)
    }

    fn post_req(clearing: &Account, wallet: &Account, debit: i64, credit: i64) -> PostEntriesRequest {
        PostEntriesRequest {
            tenant_id: "tenant-a".into(),
            reference: "ref-1".into(),
            description: "funding".into(),
            source_type: SourceType::Deposit,
            source_id: "intent-1".into(),
            currency: Currency::new("EUR"),
            entries: vec![
                EntryRequest {
                    account_id: clearing.id.clone(),
                    entry_type: EntryType::Debit,
                    amount_minor: debit,
                    description: String::new(),
                },
                EntryRequest {
                    account_id: wallet.id.clone(),
                    entry_type: EntryType::Credit,
                    amount_minor: credit,
                    description: String::new(),
                },
            ],
            posted_by: Some("system".into()),
        }
    }

    #[tokio::test]
    async fn test_post_entries_happy_path() {
        let (svc, outbox, clearing, wallet) = seeded_service().await;

        let batch = svc.post_entries(post_req(&clearing, &wallet, 1000, 1000)).await.unwrap();

        assert_eq!(batch.entry_count, 2);
        assert_eq!(svc.get_account_balance(&clearing.id).await.unwrap(), 1000);
        assert_eq!(svc.get_account_balance(&wallet.id).await.unwrap(), 1000);
        assert_eq!(outbox.count_of(EVENT_LEDGER_BATCH_POSTED).await, 1);
    }

    #[tokio::test]
    async fn test_post_entries_unbalanced_leaves_nothing() {
        let (svc, outbox, clearing, wallet) = seeded_service().await;

        let err = svc
            .post_entries(post_req(&clearing, &wallet, 100, 99))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNBALANCED");

        assert_eq!(svc.get_account_balance(&clearing.id).await.unwrap(), 0);
        assert_eq!(outbox.count_of(EVENT_LEDGER_BATCH_POSTED).await, 0);
    }

    #[tokio::test]
    async fn test_post_entries_unknown_account() {
        let (svc, _outbox, clearing, _wallet) = seeded_service().await;
        let mut req = post_req(&clearing, &clearing, 100, 100);
        req.entries[1].account_id = "ghost".into();

        let err = svc.post_entries(req).await.unwrap_err();
        assert_eq!(err.code(), "ACCOUNT_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_post_entries_wrong_account_currency() {
        let (svc, _outbox, clearing, wallet) = seeded_service().await;
        let gbp_wallet = svc
            .create_account(CreateAccountRequest {
                tenant_id: "tenant-a".into(),
                code: "2001".into(),
                name: "GBP Wallets".into(),
                description: String::new(),
                account_type: AccountType::Liability,
                currency: Currency::new("GBP"),
                parent_id: None,
                is_system: false,
                is_placeholder: false,
            })
            .await
            .unwrap();

        let mut req = post_req(&clearing, &wallet, 100, 100);
        req.entries[1].account_id = gbp_wallet.id.clone();

        let err = svc.post_entries(req).await.unwrap_err();
        assert_eq!(err.code(), "CURRENCY_MISMATCH");
    }

    #[tokio::test]
    async fn test_create_account_with_parent() {
        let (svc, _outbox, clearing, _) = seeded_service().await;

        let child = svc
            .create_account(CreateAccountRequest {
                tenant_id: "tenant-a".into(),
                code: "1310".into(),
                name: "SEPA Clearing".into(),
                description: String::new(),
                account_type: AccountType::Asset,
                currency: Currency::new("EUR"),
                parent_id: Some(clearing.id.clone()),
                is_system: false,
                is_placeholder: false,
            })
            .await
            .unwrap();

        assert_eq!(child.path, "1300/1310");
    }

    #[tokio::test]
    async fn test_create_account_missing_parent() {
        let (svc, _outbox, _, _) = seeded_service().await;

        let err = svc
            .create_account(CreateAccountRequest {
                tenant_id: "tenant-a".into(),
                code: "1310".into(),
                name: "Orphan".into(),
                description: String::new(),
                account_type: AccountType::Asset,
                currency: Currency::new("EUR"),
                parent_id: Some("ghost".into()),
                is_system: false,
                is_placeholder: false,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_initialize_system_accounts_is_idempotent() {
        let (svc, _outbox) = service();
        svc.initialize_system_accounts("tenant-a", Currency::new("EUR"))
            .await
            .unwrap();
        svc.initialize_system_accounts("tenant-a", Currency::new("EUR"))
            .await
            .unwrap();

        let (accounts, total) = svc
            .list_accounts("tenant-a", None, 100, 0)
            .await
            .unwrap();
        assert_eq!(total, system_accounts().len() as i64);
        assert!(accounts.iter().all(|a| a.is_system));
    }

    #[tokio::test]
    async fn test_reverse_batch_is_status_flip() {
        let (svc, _outbox, clearing, wallet) = seeded_service().await;
        let batch = svc.post_entries(post_req(&clearing, &wallet, 500, 500)).await.unwrap();

        let reversed = svc
            .reverse_batch("tenant-a", &batch.id, "ops", "audit error")
            .await
            .unwrap();
        assert_eq!(reversed.reversal_reason, "audit error");
        assert_eq!(reversed.reversed_by.as_deref(), Some("ops"));
    }
}
