//! Funding Orchestrator
//!
//! Owns the intent state machine. Accepts funding requests idempotently,
//! matches inbound bank credits to intents, and commands the ledger
//! posting only once an intent actually reaches settlement. Every
//! state change and its event commit in one store transaction; the
//! outbox drainer does the publishing.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use ulid::Ulid;

use super::error::FundingError;
use super::intent::{BankDetails, FundingAttempt, FundingIntent, IntentStatus, Method};
use super::matching::{match_confidence, normalize_reference, reference_for_intent};
use super::store::FundingStore;
use crate::config::FundingConfig;
use crate::events::{
    Envelope, FundingUpdateData, InboundCreditEvent, IntentCreatedData, ReconMismatchData,
    EVENT_FUNDING_EXPIRED, EVENT_FUNDING_FAILED, EVENT_FUNDING_PENDING, EVENT_FUNDING_REVERSED,
    EVENT_FUNDING_SETTLED, EVENT_INBOUND_CREDIT, EVENT_INTENT_CREATED, EVENT_RECON_MISMATCH,
};
use crate::ledger::{EntryRequest, EntryType, LedgerService, PostEntriesRequest, SourceType};
use crate::money::Money;
use crate::outbox::{OutboxEvent, OutboxStore};
use crate::rails::{
    CardProvider, FpsProvider, FundingCallbacks, OpenBankingProvider, SepaProvider,
};

const AGGREGATE_INTENT: &str = "funding_intent";
const POSTED_BY: &str = "funding-orchestrator";

/// Wallet liability account every settlement credits.
const WALLET_LIABILITY_CODE: &str = "2000";
/// Clearing asset for bank rails (funds sit here until swept).
const BANK_CLEARING_CODE: &str = "1300";
/// Receivable from the card acquirer until payout.
const CARD_RECEIVABLE_CODE: &str = "1200";

/// Platform-side debit account for a settlement, by funding method.
fn clearing_account_code(method: Method) -> &'static str {
    match method {
        Method::Card => CARD_RECEIVABLE_CODE,
        _ => BANK_CLEARING_CODE,
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateIntentRequest {
    pub tenant_id: String,
    pub wallet_id: String,
    pub customer_id: String,
    pub amount: Money,
    pub method: Method,
    pub idempotency_key: String,
    #[serde(default)]
    pub return_url: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateIntentResponse {
    pub intent_id: String,
    pub status: IntentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bank_details: Option<BankDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_session: Option<String>,
}

impl CreateIntentResponse {
    fn from_intent(intent: &FundingIntent) -> Self {
        Self {
            intent_id: intent.id.clone(),
            status: intent.status,
            redirect_url: intent.redirect_url.clone(),
            bank_details: intent.bank_details.clone(),
            payment_session: intent.payment_session.clone(),
        }
    }
}

pub struct FundingService {
    store: Arc<dyn FundingStore>,
    ledger: Arc<LedgerService>,
    outbox: Arc<dyn OutboxStore>,
    config: FundingConfig,

    // Provider adapters, injected after construction to break the
    // adapter/orchestrator cycle.
    fps: RwLock<Option<Arc<dyn FpsProvider>>>,
    sepa: RwLock<Option<Arc<dyn SepaProvider>>>,
    open_banking: RwLock<Option<Arc<dyn OpenBankingProvider>>>,
    cards: RwLock<Option<Arc<dyn CardProvider>>>,
}

impl FundingService {
    pub fn new(
        store: Arc<dyn FundingStore>,
        ledger: Arc<LedgerService>,
        outbox: Arc<dyn OutboxStore>,
        config: FundingConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            outbox,
            config,
            fps: RwLock::new(None),
            sepa: RwLock::new(None),
            open_banking: RwLock::new(None),
            cards: RwLock::new(None),
        }
    }

    pub fn set_fps_provider(&self, provider: Arc<dyn FpsProvider>) {
        *self.fps.write().unwrap() = Some(provider);
    }

    pub fn set_sepa_provider(&self, provider: Arc<dyn SepaProvider>) {
        *self.sepa.write().unwrap() = Some(provider);
    }

    pub fn set_open_banking_provider(&self, provider: Arc<dyn OpenBankingProvider>) {
        *self.open_banking.write().unwrap() = Some(provider);
    }

    pub fn set_card_provider(&self, provider: Arc<dyn CardProvider>) {
        *self.cards.write().unwrap() = Some(provider);
    }

    fn open_banking_provider(&self) -> Result<Arc<dyn OpenBankingProvider>, FundingError> {
        self.open_banking
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| FundingError::ProviderNotConfigured("OPEN_BANKING".into()))
    }

    /// Create a funding intent, or replay the stored response when the
    /// `(tenant, idempotency_key)` pair was seen before. Replays have no
    /// side effects.
    pub async fn create_intent(
        &self,
        req: &CreateIntentRequest,
    ) -> Result<CreateIntentResponse, FundingError> {
        if req.method == Method::Ach {
            return Err(FundingError::Validation("ACH funding is not available".into()));
        }

        if let Some(existing) = self
            .store
            .get_intent_by_idempotency_key(&req.tenant_id, &req.idempotency_key)
            .await?
        {
            info!(
                intent_id = %existing.id,
                idempotency_key = %req.idempotency_key,
                "Returning existing intent for idempotency key"
            );
            return Ok(CreateIntentResponse::from_intent(&existing));
        }

        let intent_id = Ulid::new().to_string();
        let expiry = chrono::Duration::from_std(self.config.default_expiry())
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        let mut intent = FundingIntent::new(
            &intent_id,
            &req.tenant_id,
            &req.wallet_id,
            &req.customer_id,
            req.amount.clone(),
            req.method,
            &req.idempotency_key,
            expiry,
        )?;
        intent.metadata = req.metadata.clone();

        match req.method {
            Method::Sepa | Method::Fps => {
                // The customer pushes funds; hand out collection details
                // with the matching reference. Settlement arrives as an
                // inbound credit.
                intent.bank_details = Some(self.bank_details_for(&intent));
            }
            Method::Card => {
                intent.payment_session = Some(format!("session_{intent_id}"));
            }
            Method::OpenBanking | Method::Ach => {}
        }

        let created_event = self.intent_created_envelope(&intent)?;
        match self
            .store
            .create_intent(&intent, &[OutboxEvent::from_envelope(&created_event)
                .map_err(|e| FundingError::Validation(e.to_string()))?])
            .await
        {
            Ok(()) => {}
            Err(FundingError::Duplicate(_)) => {
                // Lost a concurrent race on the same key; replay the winner.
                if let Some(existing) = self
                    .store
                    .get_intent_by_idempotency_key(&req.tenant_id, &req.idempotency_key)
                    .await?
                {
                    return Ok(CreateIntentResponse::from_intent(&existing));
                }
                return Err(FundingError::Duplicate(req.idempotency_key.clone()));
            }
            Err(e) => return Err(e),
        }

        match req.method {
            Method::OpenBanking => {
                self.initiate_open_banking(&mut intent, req.return_url.as_deref())
                    .await?;
            }
            Method::Sepa | Method::Fps => {
                // Pre-register the expected inbound payment with the
                // rail when a provider is wired. Failures leave the
                // intent created; the bank details already carry the
                // matching reference, so funds still arrive.
                self.register_expected_payment(&mut intent).await?;
            }
            _ => {}
        }

        info!(
            intent_id = %intent.id,
            method = %req.method,
            amount = req.amount.amount_minor,
            currency = %req.amount.currency,
            "Funding intent created"
        );

        Ok(CreateIntentResponse::from_intent(&intent))
    }

    fn bank_details_for(&self, intent: &FundingIntent) -> BankDetails {
        let reference = reference_for_intent(&intent.id);
        match intent.method {
            Method::Fps => BankDetails {
                iban: None,
                sort_code: Some(self.config.collection_sort_code.clone()),
                account_number: Some(self.config.collection_account_number.clone()),
                bic: None,
                reference,
            },
            _ => BankDetails {
                iban: Some(self.config.collection_iban.clone()),
                sort_code: None,
                account_number: None,
                bic: Some(self.config.collection_bic.clone()),
                reference,
            },
        }
    }

    async fn register_expected_payment(
        &self,
        intent: &mut FundingIntent,
    ) -> Result<(), FundingError> {
        enum Rail {
            Fps(Arc<dyn FpsProvider>),
            Sepa(Arc<dyn SepaProvider>),
        }

        let provider = match intent.method {
            Method::Fps => self.fps.read().unwrap().clone().map(Rail::Fps),
            Method::Sepa => self.sepa.read().unwrap().clone().map(Rail::Sepa),
            _ => None,
        };
        let provider = match provider {
            Some(p) => p,
            None => return Ok(()),
        };

        let provider_name = match &provider {
            Rail::Fps(_) => "fps",
            Rail::Sepa(_) => "sepa",
        };
        let mut attempt = FundingAttempt::new(
            &Ulid::new().to_string(),
            &intent.id,
            provider_name,
            intent.attempt_count + 1,
        );
        self.store.create_attempt(&attempt).await?;

        let result = match &provider {
            Rail::Fps(p) => p.submit(intent, &attempt.id).await,
            Rail::Sepa(p) => p.submit(intent, &attempt.id).await,
        };

        intent.attempt_count += 1;
        intent.last_attempt_at = Some(Utc::now());

        match result {
            Ok(provider_ref) => {
                attempt.mark_submitted(&provider_ref);
                self.store.update_attempt(&attempt).await?;
                intent.provider_ref = Some(provider_ref);
            }
            Err(e) => {
                attempt.mark_failed(e.code(), &e.to_string());
                self.store.update_attempt(&attempt).await?;
                warn!(
                    intent_id = %intent.id,
                    provider = provider_name,
                    error = %e,
                    "Expected-payment registration failed, intent stays created"
                );
            }
        }

        self.store
            .update_intent_if(intent, IntentStatus::Created, &[])
            .await?;
        Ok(())
    }

    async fn initiate_open_banking(
        &self,
        intent: &mut FundingIntent,
        _return_url: Option<&str>,
    ) -> Result<(), FundingError> {
        let provider = self.open_banking_provider()?;

        let mut attempt = FundingAttempt::new(
            &Ulid::new().to_string(),
            &intent.id,
            "openbanking",
            intent.attempt_count + 1,
        );
        self.store.create_attempt(&attempt).await?;

        match provider.initiate(intent).await {
            Ok((auth_url, provider_ref)) => {
                attempt.mark_submitted(&provider_ref);
                self.store.update_attempt(&attempt).await?;

                intent.mark_pending(&provider_ref)?;
                intent.redirect_url = Some(auth_url);
                intent.attempt_count += 1;
                intent.last_attempt_at = Some(Utc::now());

                let pending_event =
                    self.funding_update_envelope(intent, EVENT_FUNDING_PENDING, None, None)?;
                self.store
                    .update_intent_if(intent, IntentStatus::Created, &[pending_event])
                    .await?;
                Ok(())
            }
            Err(e) => {
                // Transient submit failure: the attempt is failed, the
                // intent stays created and may be retried on a new attempt.
                attempt.mark_failed(e.code(), &e.to_string());
                self.store.update_attempt(&attempt).await?;

                intent.attempt_count += 1;
                intent.last_attempt_at = Some(Utc::now());
                self.store
                    .update_intent_if(intent, IntentStatus::Created, &[])
                    .await?;

                warn!(intent_id = %intent.id, error = %e, "Open Banking initiation failed");
                Err(e.into())
            }
        }
    }

    pub async fn get_intent(
        &self,
        tenant_id: &str,
        intent_id: &str,
    ) -> Result<FundingIntent, FundingError> {
        self.store.get_intent(tenant_id, intent_id).await
    }

    /// Charge a tokenized card against a card intent. Settlement rides
    /// back through the adapter's capture callback.
    pub async fn charge_card(
        &self,
        tenant_id: &str,
        intent_id: &str,
        card_token: &str,
        three_ds: Option<&crate::rails::ThreeDsData>,
    ) -> Result<String, FundingError> {
        let provider = self
            .cards
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| FundingError::ProviderNotConfigured("CARD".into()))?;

        let intent = self.store.get_intent(tenant_id, intent_id).await?;
        if intent.method != Method::Card {
            return Err(FundingError::InvalidState(format!(
                "intent {intent_id} is not a card intent"
            )));
        }
        if intent.is_terminal() {
            return Err(FundingError::InvalidState(format!(
                "cannot charge {} intent {intent_id}",
                intent.status
            )));
        }

        let mut attempt = FundingAttempt::new(
            &Ulid::new().to_string(),
            &intent.id,
            "cards",
            intent.attempt_count + 1,
        );
        self.store.create_attempt(&attempt).await?;

        match provider.charge(&intent, card_token, three_ds).await {
            Ok(transaction_id) => {
                attempt.mark_submitted(&transaction_id);
                self.store.update_attempt(&attempt).await?;
                Ok(transaction_id)
            }
            Err(e) => {
                attempt.mark_failed(e.code(), &e.to_string());
                self.store.update_attempt(&attempt).await?;
                warn!(intent_id = %intent_id, error = %e, "Card charge failed");
                Err(e.into())
            }
        }
    }

    /// Merchant-initiated refund of a settled card intent. The acquirer
    /// call goes through the adapter, which flips the rail record and
    /// routes the confirmed refund back here as a reversal.
    pub async fn refund_card(
        &self,
        tenant_id: &str,
        intent_id: &str,
    ) -> Result<(), FundingError> {
        let provider = self
            .cards
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| FundingError::ProviderNotConfigured("CARD".into()))?;

        let intent = self.store.get_intent(tenant_id, intent_id).await?;
        if intent.method != Method::Card {
            return Err(FundingError::InvalidState(format!(
                "intent {intent_id} is not a card intent"
            )));
        }
        if intent.status != IntentStatus::Settled {
            return Err(FundingError::InvalidState(format!(
                "cannot refund {} intent {intent_id}",
                intent.status
            )));
        }
        let transaction_id = intent.provider_ref.clone().ok_or_else(|| {
            FundingError::InvalidState(format!(
                "settled intent {intent_id} has no provider reference"
            ))
        })?;

        provider.refund(&transaction_id, &intent.amount).await?;

        info!(
            intent_id = %intent_id,
            transaction_id = %transaction_id,
            amount = intent.amount.amount_minor,
            "Card refund submitted"
        );
        Ok(())
    }

    pub async fn list_attempts(
        &self,
        intent_id: &str,
    ) -> Result<Vec<FundingAttempt>, FundingError> {
        self.store.list_attempts(intent_id).await
    }

    /// Match an inbound bank credit to its intent and settle it.
    ///
    /// Replayed statements (same statement id) are no-ops. Credits with
    /// no matching reference are archived for manual review. Amount
    /// disagreements and post-settlement duplicates emit reconciliation
    /// mismatches and leave the intent untouched.
    pub async fn process_inbound_credit(
        &self,
        event: &InboundCreditEvent,
    ) -> Result<(), FundingError> {
        let tenant_id = event.tenant_id.clone().unwrap_or_else(|| "default".to_string());

        info!(
            statement_id = %event.statement_id,
            reference = %event.reference,
            rail = %event.rail,
            amount = event.amount.amount_minor,
            "Processing inbound credit"
        );

        if !self
            .store
            .record_statement(&event.statement_id, None)
            .await?
        {
            info!(
                statement_id = %event.statement_id,
                "Statement already processed, ignoring replay"
            );
            return Ok(());
        }

        let (intent, confidence) = match self.match_intent(&tenant_id, &event.reference).await? {
            Some(found) => found,
            None => {
                warn!(
                    reference = %event.reference,
                    statement_id = %event.statement_id,
                    "No matching intent for inbound credit, archiving as orphan"
                );
                let mut orphan = event.clone();
                orphan.tenant_id = Some(tenant_id.clone());
                let envelope = Envelope::new(
                    EVENT_INBOUND_CREDIT,
                    &tenant_id,
                    "inbound_credit",
                    &event.statement_id,
                    &orphan,
                )?;
                let outbox_event = OutboxEvent::from_envelope(&envelope)
                    .map_err(|e| FundingError::Validation(e.to_string()))?;
                self.store.record_orphan_credit(&orphan, &[outbox_event]).await?;
                return Ok(());
            }
        };

        if intent.is_terminal() {
            // New money arrived for an intent that is already done:
            // a duplicate credit, flagged for reconciliation.
            warn!(
                intent_id = %intent.id,
                status = %intent.status,
                statement_id = %event.statement_id,
                "Inbound credit for terminal intent"
            );
            self.emit_mismatch(&intent, event, "duplicate").await?;
            return Ok(());
        }

        if intent.amount != event.amount {
            warn!(
                intent_id = %intent.id,
                expected = intent.amount.amount_minor,
                actual = event.amount.amount_minor,
                "Amount mismatch on inbound credit"
            );
            self.emit_mismatch(&intent, event, "amount").await?;
            return Ok(());
        }

        info!(
            intent_id = %intent.id,
            match_confidence = confidence,
            "Inbound credit matched"
        );

        let mut intent = intent;
        if intent.provider_ref.is_none() {
            intent.provider_ref = Some(event.statement_id.clone());
        }
        self.settle(&mut intent).await
    }

    /// Reference matching: exact token first, then the normalized form.
    /// Name/amount heuristics never match automatically.
    async fn match_intent(
        &self,
        tenant_id: &str,
        reference: &str,
    ) -> Result<Option<(FundingIntent, u8)>, FundingError> {
        if let Some(intent) = self
            .store
            .get_intent_by_reference(tenant_id, reference)
            .await?
        {
            return Ok(Some((intent, 100)));
        }

        let normalized = normalize_reference(reference);
        if normalized.is_empty() {
            return Ok(None);
        }
        if let Some(intent) = self
            .store
            .get_intent_by_normalized_reference(tenant_id, &normalized)
            .await?
        {
            let issued = intent
                .bank_details
                .as_ref()
                .map(|b| b.reference.clone())
                .unwrap_or_default();
            let confidence = match_confidence(&issued, reference);
            if confidence > 0 {
                return Ok(Some((intent, confidence)));
            }
        }

        Ok(None)
    }

    async fn emit_mismatch(
        &self,
        intent: &FundingIntent,
        event: &InboundCreditEvent,
        mismatch_type: &str,
    ) -> Result<(), FundingError> {
        let data = ReconMismatchData {
            intent_id: Some(intent.id.clone()),
            statement_ref: event.reference.clone(),
            expected_amount: intent.amount.clone(),
            actual_amount: event.amount.clone(),
            mismatch_type: mismatch_type.to_string(),
            detected_at: Utc::now(),
        };
        let envelope = Envelope::new(
            EVENT_RECON_MISMATCH,
            &intent.tenant_id,
            AGGREGATE_INTENT,
            &intent.id,
            &data,
        )?;
        let outbox_event = OutboxEvent::from_envelope(&envelope)
            .map_err(|e| FundingError::Validation(e.to_string()))?;
        self.outbox
            .enqueue(&[outbox_event])
            .await
            .map_err(|e| FundingError::Validation(e.to_string()))?;
        Ok(())
    }

    /// Post the balanced settlement batch and move the intent to
    /// `settled`. Intent update and `funding.settled` outbox row commit
    /// together; the ledger post happens first and a failure there
    /// leaves the intent untouched with an orphan-settlement alarm.
    pub async fn settle(&self, intent: &mut FundingIntent) -> Result<(), FundingError> {
        if !matches!(intent.status, IntentStatus::Created | IntentStatus::Pending) {
            return Err(FundingError::InvalidState(format!(
                "cannot settle {} intent {}",
                intent.status, intent.id
            )));
        }
        let expected = intent.status;

        let batch = match self.post_settlement_batch(intent).await {
            Ok(batch) => batch,
            Err(e) => {
                // The rail says the money moved; the book disagrees.
                // Never swallow this: alarm and hand it to an operator.
                error!(
                    intent_id = %intent.id,
                    error = %e,
                    "ORPHAN SETTLEMENT: rail settled but ledger post failed"
                );
                self.emit_orphan_settlement_alarm(intent, &e).await?;
                return Err(FundingError::OrphanSettlement {
                    intent_id: intent.id.clone(),
                    reason: e.to_string(),
                });
            }
        };

        intent.mark_settled(&batch.id)?;

        let settled_event = self.funding_update_envelope(
            intent,
            EVENT_FUNDING_SETTLED,
            Some(&batch.id),
            None,
        )?;

        let won = self
            .store
            .update_intent_if(intent, expected, &[settled_event])
            .await?;
        if !won {
            // The ledger batch exists but another writer moved the
            // intent first. Same alarm as a failed post: operator owns it.
            error!(
                intent_id = %intent.id,
                batch_id = %batch.id,
                "Intent transitioned concurrently after ledger post"
            );
            return Err(FundingError::OrphanSettlement {
                intent_id: intent.id.clone(),
                reason: "intent state changed during settlement".into(),
            });
        }

        info!(
            intent_id = %intent.id,
            batch_id = %batch.id,
            amount = intent.amount.amount_minor,
            "Funding intent settled"
        );

        Ok(())
    }

    /// Resolve the platform accounts and post the balanced settlement
    /// batch: debit the method's clearing/receivable account, credit the
    /// wallet liability.
    async fn post_settlement_batch(
        &self,
        intent: &FundingIntent,
    ) -> Result<crate::ledger::Batch, crate::ledger::LedgerError> {
        let debit_account = self
            .ledger
            .get_account_by_code(&intent.tenant_id, clearing_account_code(intent.method))
            .await?;
        let credit_account = self
            .ledger
            .get_account_by_code(&intent.tenant_id, WALLET_LIABILITY_CODE)
            .await?;

        let reference = intent
            .provider_ref
            .clone()
            .unwrap_or_else(|| intent.id.clone());

        self.ledger
            .post_entries(PostEntriesRequest {
                tenant_id: intent.tenant_id.clone(),
                reference,
                description: format!("Wallet funding via {}", intent.method),
                source_type: SourceType::Deposit,
                source_id: intent.id.clone(),
                currency: intent.amount.currency.clone(),
                entries: vec![
                    EntryRequest {
                        account_id: debit_account.id.clone(),
                        entry_type: EntryType::Debit,
                        amount_minor: intent.amount.amount_minor,
                        description: format!("{} funds received", intent.method),
                    },
                    EntryRequest {
                        account_id: credit_account.id.clone(),
                        entry_type: EntryType::Credit,
                        amount_minor: intent.amount.amount_minor,
                        description: format!("Wallet {} credit", intent.wallet_id),
                    },
                ],
                posted_by: Some(POSTED_BY.to_string()),
            })
            .await
    }

    async fn emit_orphan_settlement_alarm(
        &self,
        intent: &FundingIntent,
        err: &crate::ledger::LedgerError,
    ) -> Result<(), FundingError> {
        let data = ReconMismatchData {
            intent_id: Some(intent.id.clone()),
            statement_ref: intent.provider_ref.clone().unwrap_or_default(),
            expected_amount: intent.amount.clone(),
            actual_amount: intent.amount.clone(),
            mismatch_type: "orphan_settlement".to_string(),
            detected_at: Utc::now(),
        };
        let envelope = Envelope::new(
            EVENT_RECON_MISMATCH,
            &intent.tenant_id,
            AGGREGATE_INTENT,
            &intent.id,
            &data,
        )?;
        let outbox_event = OutboxEvent::from_envelope(&envelope)
            .map_err(|e| FundingError::Validation(e.to_string()))?;
        self.outbox
            .enqueue(&[outbox_event])
            .await
            .map_err(|e| FundingError::Validation(format!("{e}; ledger error: {err}")))?;
        Ok(())
    }

    /// Card capture outcome. Captured settles; a decline fails the
    /// intent. Replays for an already-terminal intent are no-ops.
    pub async fn process_card_payment(
        &self,
        tenant_id: &str,
        intent_id: &str,
        transaction_id: &str,
        captured: bool,
    ) -> Result<(), FundingError> {
        let mut intent = self.store.get_intent(tenant_id, intent_id).await?;

        if intent.is_terminal() {
            info!(
                intent_id = %intent_id,
                status = %intent.status,
                "Card payment update for terminal intent ignored"
            );
            return Ok(());
        }

        if !captured {
            let expected = intent.status;
            intent.mark_failed("CARD_DECLINED", "Card payment was not captured")?;
            let failed_event =
                self.funding_update_envelope(&intent, EVENT_FUNDING_FAILED, None, None)?;
            self.store
                .update_intent_if(&intent, expected, &[failed_event])
                .await?;
            info!(intent_id = %intent_id, "Card payment declined");
            return Ok(());
        }

        intent.provider_ref = Some(transaction_id.to_string());
        self.settle(&mut intent).await
    }

    /// Post-settlement reversal. Posts a compensating batch (debits and
    /// credits swapped, `source_type = chargeback`, source id = the
    /// original batch) before flipping the intent, so the book stays
    /// append-only and balanced at every instant.
    pub async fn process_chargeback(
        &self,
        tenant_id: &str,
        intent_id: &str,
        reason: &str,
    ) -> Result<(), FundingError> {
        let mut intent = self.store.get_intent(tenant_id, intent_id).await?;

        if intent.status == IntentStatus::Reversed {
            info!(intent_id = %intent_id, "Chargeback replay for reversed intent ignored");
            return Ok(());
        }
        if intent.status != IntentStatus::Settled {
            return Err(FundingError::InvalidState(format!(
                "cannot charge back {} intent {}",
                intent.status, intent.id
            )));
        }

        let batch_id = intent.ledger_batch_id.clone().ok_or_else(|| {
            FundingError::InvalidState(format!("settled intent {intent_id} has no ledger batch"))
        })?;
        let original = self.ledger.get_batch(&intent.tenant_id, &batch_id).await?;

        let entries = original
            .compensating_entries()
            .into_iter()
            .map(|(account_id, entry_type, amount)| EntryRequest {
                account_id,
                entry_type,
                amount_minor: amount.amount_minor,
                description: format!("Chargeback: {reason}"),
            })
            .collect();

        let compensating = self
            .ledger
            .post_entries(PostEntriesRequest {
                tenant_id: intent.tenant_id.clone(),
                reference: intent.provider_ref.clone().unwrap_or_else(|| intent.id.clone()),
                description: format!("Chargeback reversal for intent {}", intent.id),
                source_type: SourceType::Chargeback,
                source_id: batch_id.clone(),
                currency: intent.amount.currency.clone(),
                entries,
                posted_by: Some(POSTED_BY.to_string()),
            })
            .await?;

        intent.mark_reversed(reason)?;
        let reversed_event =
            self.funding_update_envelope(&intent, EVENT_FUNDING_REVERSED, Some(&batch_id), None)?;
        let won = self
            .store
            .update_intent_if(&intent, IntentStatus::Settled, &[reversed_event])
            .await?;
        if !won {
            warn!(
                intent_id = %intent.id,
                "Lost chargeback CAS after posting compensating batch"
            );
            return Err(FundingError::InvalidState(format!(
                "intent {intent_id} changed during chargeback"
            )));
        }

        info!(
            intent_id = %intent.id,
            original_batch = %batch_id,
            compensating_batch = %compensating.id,
            reason = %reason,
            "Funding intent reversed"
        );

        Ok(())
    }

    /// Periodic sweep: expire `created`/`pending` intents past their
    /// TTL. Per-intent CAS makes concurrent sweeps safe; each intent
    /// expires exactly once.
    pub async fn expire_stale_intents(
        &self,
        cutoff: chrono::DateTime<Utc>,
        limit: i64,
    ) -> Result<usize, FundingError> {
        let stale = self.store.list_expired_intents(cutoff, limit).await?;
        if stale.is_empty() {
            return Ok(0);
        }

        let mut expired = 0usize;
        for mut intent in stale {
            let previous = intent.status;
            if intent.mark_expired().is_err() {
                continue;
            }

            let event =
                self.funding_update_envelope(&intent, EVENT_FUNDING_EXPIRED, None, None)?;
            if self.store.update_intent_if(&intent, previous, &[event]).await? {
                info!(intent_id = %intent.id, "Funding intent expired");
                expired += 1;
            }
        }

        Ok(expired)
    }

    fn intent_created_envelope(&self, intent: &FundingIntent) -> Result<Envelope, FundingError> {
        let data = IntentCreatedData {
            intent_id: intent.id.clone(),
            wallet_id: intent.wallet_id.clone(),
            customer_id: intent.customer_id.clone(),
            amount: intent.amount.clone(),
            method: intent.method.as_str().to_string(),
            idempotency_key: intent.idempotency_key.clone(),
        };
        Ok(Envelope::new(
            EVENT_INTENT_CREATED,
            &intent.tenant_id,
            AGGREGATE_INTENT,
            &intent.id,
            &data,
        )?)
    }

    fn funding_update_envelope(
        &self,
        intent: &FundingIntent,
        event_type: &str,
        ledger_batch_id: Option<&str>,
        error_code: Option<&str>,
    ) -> Result<OutboxEvent, FundingError> {
        let data = FundingUpdateData {
            intent_id: intent.id.clone(),
            wallet_id: intent.wallet_id.clone(),
            status: intent.status.as_str().to_string(),
            provider_ref: intent.provider_ref.clone(),
            rail: intent.method.as_str().to_string(),
            amount: intent.amount.clone(),
            error_code: error_code
                .map(|c| c.to_string())
                .or_else(|| (!intent.error_code.is_empty()).then(|| intent.error_code.clone())),
            error_message: (!intent.error_message.is_empty())
                .then(|| intent.error_message.clone()),
            settled_at: intent.settled_at,
            ledger_batch_id: ledger_batch_id.map(|b| b.to_string()),
        };
        let envelope = Envelope::new(
            event_type,
            &intent.tenant_id,
            AGGREGATE_INTENT,
            &intent.id,
            &data,
        )?;
        OutboxEvent::from_envelope(&envelope).map_err(|e| FundingError::Validation(e.to_string()))
    }
}

#[async_trait]
impl FundingCallbacks for FundingService {
    async fn process_inbound_credit(&self, event: &InboundCreditEvent) -> Result<(), FundingError> {
        FundingService::process_inbound_credit(self, event).await
    }

    async fn process_card_payment(
        &self,
        tenant_id: &str,
        intent_id: &str,
        transaction_id: &str,
        captured: bool,
    ) -> Result<(), FundingError> {
        FundingService::process_card_payment(self, tenant_id, intent_id, transaction_id, captured)
            .await
    }

    async fn process_chargeback(
        &self,
        tenant_id: &str,
        intent_id: &str,
        reason: &str,
    ) -> Result<(), FundingError> {
        FundingService::process_chargeback(self, tenant_id, intent_id, reason).await
    }

    async fn process_funding_update(
        &self,
        update: &FundingUpdateData,
    ) -> Result<(), FundingError> {
        match update.status.as_str() {
            "settled" => {
                let mut intent = self.store.get_intent("", &update.intent_id).await?;
                if intent.is_terminal() {
                    info!(
                        intent_id = %update.intent_id,
                        "Settlement update for terminal intent ignored"
                    );
                    return Ok(());
                }
                if let Some(provider_ref) = &update.provider_ref {
                    intent.provider_ref = Some(provider_ref.clone());
                }
                self.settle(&mut intent).await
            }
            "failed" => {
                let mut intent = self.store.get_intent("", &update.intent_id).await?;
                if intent.is_terminal() {
                    return Ok(());
                }
                let expected = intent.status;
                intent.mark_failed(
                    update.error_code.as_deref().unwrap_or("RAIL_FAILED"),
                    update.error_message.as_deref().unwrap_or("rail reported failure"),
                )?;
                let event =
                    self.funding_update_envelope(&intent, EVENT_FUNDING_FAILED, None, None)?;
                self.store.update_intent_if(&intent, expected, &[event]).await?;
                Ok(())
            }
            "reversed" => {
                let reason = update
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "rail reversal".to_string());
                FundingService::process_chargeback(self, "", &update.intent_id, &reason).await
            }
            other => {
                warn!(status = %other, intent_id = %update.intent_id, "Unhandled funding update");
                Ok(())
            }
        }
    }
}
