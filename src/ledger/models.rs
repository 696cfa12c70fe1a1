//! Ledger Domain Model
//!
//! Accounts, batches, and entries of the double-entry book. A batch is
//! the unit of atomic commit; it must balance (debits == credits) in one
//! currency before it can be built, let alone posted. Entries are
//! immutable once their batch is posted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use super::error::LedgerError;
use crate::money::{Currency, Money};

// ============================================================================
// Accounts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Asset,
    Liability,
    Equity,
    Revenue,
    Expense,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Asset => "asset",
            AccountType::Liability => "liability",
            AccountType::Equity => "equity",
            AccountType::Revenue => "revenue",
            AccountType::Expense => "expense",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "asset" => Some(AccountType::Asset),
            "liability" => Some(AccountType::Liability),
            "equity" => Some(AccountType::Equity),
            "revenue" => Some(AccountType::Revenue),
            "expense" => Some(AccountType::Expense),
            _ => None,
        }
    }

    /// The side on which increases to this account type are recorded.
    pub fn normal_balance(&self) -> NormalBalance {
        match self {
            AccountType::Asset | AccountType::Expense => NormalBalance::Debit,
            AccountType::Liability | AccountType::Equity | AccountType::Revenue => {
                NormalBalance::Credit
            }
        }
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormalBalance {
    Debit,
    Credit,
}

impl NormalBalance {
    pub fn as_str(&self) -> &'static str {
        match self {
            NormalBalance::Debit => "debit",
            NormalBalance::Credit => "credit",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "debit" => Some(NormalBalance::Debit),
            "credit" => Some(NormalBalance::Credit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Inactive,
    Closed,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Inactive => "inactive",
            AccountStatus::Closed => "closed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(AccountStatus::Active),
            "inactive" => Some(AccountStatus::Inactive),
            "closed" => Some(AccountStatus::Closed),
            _ => None,
        }
    }
}

/// A ledger account, scoped to a tenant and unique by `(tenant, code)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub tenant_id: String,
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub account_type: AccountType,
    pub normal_balance: NormalBalance,
    pub currency: Currency,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Materialized path: `parent_code/code`, rooted at top-level accounts.
    pub path: String,
    pub is_system: bool,
    pub is_placeholder: bool,
    pub status: AccountStatus,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(
        id: &str,
        tenant_id: &str,
        code: &str,
        name: &str,
        account_type: AccountType,
        currency: Currency,
    ) -> Result<Self, LedgerError> {
        if id.is_empty() || tenant_id.is_empty() {
            return Err(LedgerError::Validation("id and tenant_id are required".into()));
        }
        if code.is_empty() {
            return Err(LedgerError::Validation("code is required".into()));
        }
        if name.is_empty() {
            return Err(LedgerError::Validation("name is required".into()));
        }

        let now = Utc::now();
        Ok(Self {
            id: id.to_string(),
            tenant_id: tenant_id.to_string(),
            code: code.to_string(),
            name: name.to_string(),
            description: String::new(),
            account_type,
            normal_balance: account_type.normal_balance(),
            currency,
            parent_id: None,
            path: code.to_string(),
            is_system: false,
            is_placeholder: false,
            status: AccountStatus::Active,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Attach under `parent`, keeping the materialized path consistent.
    /// Parent must share tenant and currency.
    pub fn set_parent(&mut self, parent: &Account) -> Result<(), LedgerError> {
        if parent.tenant_id != self.tenant_id {
            return Err(LedgerError::ParentMismatch(
                "parent account must be in the same tenant".into(),
            ));
        }
        if parent.currency != self.currency {
            return Err(LedgerError::ParentMismatch(
                "parent account must have the same currency".into(),
            ));
        }

        self.parent_id = Some(parent.id.clone());
        self.path = format!("{}/{}", parent.path, self.code);
        Ok(())
    }

    pub fn can_have_entries(&self) -> bool {
        !self.is_placeholder && self.status == AccountStatus::Active
    }
}

/// Standard system chart seeded for every tenant.
pub fn system_accounts() -> Vec<(&'static str, &'static str, AccountType)> {
    vec![
        // Assets
        ("1000", "Cash and Equivalents", AccountType::Asset),
        ("1100", "Customer Wallet Assets", AccountType::Asset),
        ("1200", "Accounts Receivable", AccountType::Asset),
        ("1300", "Pending Settlements", AccountType::Asset),
        // Liabilities
        ("2000", "Customer Wallet Liabilities", AccountType::Liability),
        ("2100", "Accounts Payable", AccountType::Liability),
        ("2200", "Pending Payouts", AccountType::Liability),
        ("2300", "Held Funds", AccountType::Liability),
        // Equity
        ("3000", "Retained Earnings", AccountType::Equity),
        // Revenue
        ("4000", "Fee Revenue", AccountType::Revenue),
        // Expenses
        ("5100", "Payment Processing Costs", AccountType::Expense),
    ]
}

// ============================================================================
// Entries & batches
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Debit,
    Credit,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Debit => "debit",
            EntryType::Credit => "credit",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "debit" => Some(EntryType::Debit),
            "credit" => Some(EntryType::Credit),
            _ => None,
        }
    }

    pub fn opposite(&self) -> EntryType {
        match self {
            EntryType::Debit => EntryType::Credit,
            EntryType::Credit => EntryType::Debit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Posted,
    Reversed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Posted => "posted",
            BatchStatus::Reversed => "reversed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BatchStatus::Pending),
            "posted" => Some(BatchStatus::Posted),
            "reversed" => Some(BatchStatus::Reversed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Deposit,
    Withdrawal,
    Payment,
    Fee,
    Adjustment,
    Transfer,
    Chargeback,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Deposit => "deposit",
            SourceType::Withdrawal => "withdrawal",
            SourceType::Payment => "payment",
            SourceType::Fee => "fee",
            SourceType::Adjustment => "adjustment",
            SourceType::Transfer => "transfer",
            SourceType::Chargeback => "chargeback",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "deposit" => Some(SourceType::Deposit),
            "withdrawal" => Some(SourceType::Withdrawal),
            "payment" => Some(SourceType::Payment),
            "fee" => Some(SourceType::Fee),
            "adjustment" => Some(SourceType::Adjustment),
            "transfer" => Some(SourceType::Transfer),
            "chargeback" => Some(SourceType::Chargeback),
            _ => None,
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One leg of a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    pub batch_id: String,
    pub account_id: String,
    pub entry_type: EntryType,
    pub amount: Money,
    /// Running balance on the account after this entry, filled at posting
    /// time inside the posting transaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance_after: Option<i64>,
    #[serde(default)]
    pub description: String,
    pub sequence: i32,
    pub created_at: DateTime<Utc>,
}

impl Entry {
    pub fn new(
        id: &str,
        batch_id: &str,
        account_id: &str,
        entry_type: EntryType,
        amount: Money,
        sequence: i32,
    ) -> Result<Self, LedgerError> {
        if id.is_empty() || batch_id.is_empty() {
            return Err(LedgerError::Validation("id and batch_id are required".into()));
        }
        if account_id.is_empty() {
            return Err(LedgerError::Validation("account_id is required".into()));
        }
        if !amount.is_positive() {
            return Err(LedgerError::Validation("amount must be positive".into()));
        }

        Ok(Self {
            id: id.to_string(),
            batch_id: batch_id.to_string(),
            account_id: account_id.to_string(),
            entry_type,
            amount,
            balance_after: None,
            description: String::new(),
            sequence,
            created_at: Utc::now(),
        })
    }
}

/// The signed effect of `entry` on an account whose normal side is
/// `normal`: entries on the normal side increase the balance, entries on
/// the opposite side decrease it.
pub fn signed_contribution(normal: NormalBalance, entry: &Entry) -> i64 {
    let increases = match normal {
        NormalBalance::Debit => entry.entry_type == EntryType::Debit,
        NormalBalance::Credit => entry.entry_type == EntryType::Credit,
    };
    if increases {
        entry.amount.amount_minor
    } else {
        -entry.amount.amount_minor
    }
}

/// A balanced group of entries, committed atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub reference: String,
    #[serde(default)]
    pub description: String,
    pub source_type: SourceType,
    #[serde(default)]
    pub source_id: String,
    pub total_debits: Money,
    pub total_credits: Money,
    pub entry_count: usize,
    pub status: BatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posted_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reversed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reversed_by: Option<String>,
    #[serde(default)]
    pub reversal_reason: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub entries: Vec<Entry>,
}

impl Batch {
    /// Verify internal consistency: balance, uniform currency, totals
    /// matching the entry legs.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.total_debits.currency != self.total_credits.currency {
            return Err(LedgerError::CurrencyMismatch(
                "batch totals carry different currencies".into(),
            ));
        }

        let mut debits: i64 = 0;
        let mut credits: i64 = 0;
        for entry in &self.entries {
            if entry.amount.currency != self.total_debits.currency {
                return Err(LedgerError::CurrencyMismatch(format!(
                    "entry {} currency {} does not match batch currency {}",
                    entry.id, entry.amount.currency, self.total_debits.currency
                )));
            }
            match entry.entry_type {
                EntryType::Debit => debits += entry.amount.amount_minor,
                EntryType::Credit => credits += entry.amount.amount_minor,
            }
        }

        if debits != credits {
            return Err(LedgerError::Unbalanced { debits, credits });
        }

        if debits != self.total_debits.amount_minor || credits != self.total_credits.amount_minor {
            return Err(LedgerError::Validation(
                "entry totals do not match batch totals".into(),
            ));
        }

        if self.entries.len() != self.entry_count {
            return Err(LedgerError::Validation("entry count mismatch".into()));
        }

        Ok(())
    }

    pub fn mark_posted(&mut self, actor: Option<&str>) -> Result<(), LedgerError> {
        if self.status != BatchStatus::Pending {
            return Err(LedgerError::InvalidState(
                "only pending batches can be posted".into(),
            ));
        }
        self.status = BatchStatus::Posted;
        self.posted_at = Some(Utc::now());
        self.posted_by = actor.map(|a| a.to_string());
        Ok(())
    }

    pub fn mark_reversed(&mut self, actor: &str, reason: &str) -> Result<(), LedgerError> {
        match self.status {
            BatchStatus::Posted => {}
            BatchStatus::Reversed => {
                return Err(LedgerError::AlreadyReversed(self.id.clone()));
            }
            BatchStatus::Pending => {
                return Err(LedgerError::NotPosted(self.id.clone()));
            }
        }
        self.status = BatchStatus::Reversed;
        self.reversed_at = Some(Utc::now());
        self.reversed_by = Some(actor.to_string());
        self.reversal_reason = reason.to_string();
        Ok(())
    }

    /// The entry set of a compensating batch: every leg swapped to the
    /// opposite side, same accounts and amounts. Posting these as a new
    /// batch undoes this batch's financial effect while keeping the book
    /// append-only.
    pub fn compensating_entries(&self) -> Vec<(String, EntryType, Money)> {
        self.entries
            .iter()
            .map(|e| {
                (
                    e.account_id.clone(),
                    e.entry_type.opposite(),
                    e.amount.clone(),
                )
            })
            .collect()
    }
}

/// Fluent construction of a valid batch.
pub struct BatchBuilder {
    batch: Batch,
    seq: i32,
    err: Option<LedgerError>,
}

impl BatchBuilder {
    pub fn new(id: &str, tenant_id: &str, source_type: SourceType, currency: Currency) -> Self {
        let err = if id.is_empty() || tenant_id.is_empty() {
            Some(LedgerError::Validation("id and tenant_id are required".into()))
        } else {
            None
        };

        Self {
            batch: Batch {
                id: id.to_string(),
                tenant_id: tenant_id.to_string(),
                reference: String::new(),
                description: String::new(),
                source_type,
                source_id: String::new(),
                total_debits: Money::zero(currency.clone()),
                total_credits: Money::zero(currency),
                entry_count: 0,
                status: BatchStatus::Pending,
                posted_at: None,
                posted_by: None,
                reversed_at: None,
                reversed_by: None,
                reversal_reason: String::new(),
                metadata: HashMap::new(),
                created_at: Utc::now(),
                entries: Vec::new(),
            },
            seq: 0,
            err,
        }
    }

    pub fn with_reference(mut self, reference: &str) -> Self {
        self.batch.reference = reference.to_string();
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.batch.description = description.to_string();
        self
    }

    pub fn with_source_id(mut self, source_id: &str) -> Self {
        self.batch.source_id = source_id.to_string();
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.batch
            .metadata
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn debit(self, entry_id: &str, account_id: &str, amount: Money, description: &str) -> Self {
        self.push(entry_id, account_id, EntryType::Debit, amount, description)
    }

    pub fn credit(
        self,
        entry_id: &str,
        account_id: &str,
        amount: Money,
        description: &str,
    ) -> Self {
        self.push(entry_id, account_id, EntryType::Credit, amount, description)
    }

    fn push(
        mut self,
        entry_id: &str,
        account_id: &str,
        entry_type: EntryType,
        amount: Money,
        description: &str,
    ) -> Self {
        if self.err.is_some() {
            return self;
        }

        if amount.currency != self.batch.total_debits.currency {
            self.err = Some(LedgerError::CurrencyMismatch(format!(
                "entry currency {} does not match batch currency {}",
                amount.currency, self.batch.total_debits.currency
            )));
            return self;
        }

        self.seq += 1;
        let mut entry =
            match Entry::new(entry_id, &self.batch.id, account_id, entry_type, amount, self.seq) {
                Ok(e) => e,
                Err(e) => {
                    self.err = Some(e);
                    return self;
                }
            };
        entry.description = description.to_string();

        match entry.entry_type {
            EntryType::Debit => self.batch.total_debits.amount_minor += entry.amount.amount_minor,
            EntryType::Credit => self.batch.total_credits.amount_minor += entry.amount.amount_minor,
        }
        self.batch.entries.push(entry);
        self
    }

    pub fn build(mut self) -> Result<Batch, LedgerError> {
        if let Some(err) = self.err {
            return Err(err);
        }

        if self.batch.entries.len() < 2 {
            return Err(LedgerError::Validation(
                "batch must have at least two entries".into(),
            ));
        }

        if self.batch.total_debits.amount_minor != self.batch.total_credits.amount_minor {
            return Err(LedgerError::Unbalanced {
                debits: self.batch.total_debits.amount_minor,
                credits: self.batch.total_credits.amount_minor,
            });
        }

        self.batch.entry_count = self.batch.entries.len();
        Ok(self.batch)
    }
}

// ============================================================================
// Positions
// ============================================================================

/// Pre-aggregated per-account totals over a closed period. Derived data,
/// always rebuildable from the entry log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub tenant_id: String,
    pub account_id: String,
    /// daily, monthly, yearly
    pub period_type: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub opening_balance: i64,
    pub debit_total: i64,
    pub credit_total: i64,
    pub closing_balance: i64,
    pub entry_count: usize,
    pub currency: Currency,
}

impl Position {
    /// Rebuild a position from the account's entries within the period.
    pub fn from_entries(
        id: &str,
        account: &Account,
        period_type: &str,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        opening_balance: i64,
        entries: &[Entry],
    ) -> Self {
        let mut debit_total = 0i64;
        let mut credit_total = 0i64;
        let mut closing = opening_balance;
        let mut count = 0usize;

        for entry in entries {
            if entry.account_id != account.id {
                continue;
            }
            if entry.created_at < period_start || entry.created_at >= period_end {
                continue;
            }
            match entry.entry_type {
                EntryType::Debit => debit_total += entry.amount.amount_minor,
                EntryType::Credit => credit_total += entry.amount.amount_minor,
            }
            closing += signed_contribution(account.normal_balance, entry);
            count += 1;
        }

        Self {
            id: id.to_string(),
            tenant_id: account.tenant_id.clone(),
            account_id: account.id.clone(),
            period_type: period_type.to_string(),
            period_start,
            period_end,
            opening_balance,
            debit_total,
            credit_total,
            closing_balance: closing,
            entry_count: count,
            currency: account.currency.clone(),
        }
    }
}

/// Account balance derived from an entry slice, using the account's
/// normal-balance rule. The store keeps the same figure incrementally in
/// `balance_after`; this is the reference derivation.
pub fn calculate_balance(account: &Account, entries: &[Entry]) -> i64 {
    entries
        .iter()
        .filter(|e| e.account_id == account.id)
        .map(|e| signed_contribution(account.normal_balance, e))
        .sum()
}
