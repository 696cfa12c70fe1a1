//! End-to-end funding scenarios over the in-memory store stack.
//!
//! Everything runs against the same seams production uses: the
//! orchestrator, the ledger service, the rail stores, and the shared
//! outbox. Only the database and the wire are swapped out.

use std::sync::Arc;

use chrono::Utc;

use crate::config::{CardConfig, FundingConfig, LedgerConfig};
use crate::events::{
    InboundCreditEvent, ReconMismatchData, EVENT_FUNDING_REVERSED, EVENT_FUNDING_SETTLED,
    EVENT_INBOUND_CREDIT, EVENT_INTENT_CREATED, EVENT_LEDGER_BATCH_POSTED, EVENT_RECON_MISMATCH,
};
use crate::funding::service::{CreateIntentRequest, FundingService};
use crate::funding::store::MemoryFundingStore;
use crate::funding::{IntentStatus, Method};
use crate::ledger::{
    BatchStatus, EntryType, LedgerService, MemoryLedgerStore, SourceType,
};
use crate::money::{Currency, Money};
use crate::outbox::MemoryOutboxStore;
use crate::rails::card::{CardAdapter, CardPayment, CardStatus, CardWebhookPayload, MemoryCardStore};

struct Harness {
    outbox: Arc<MemoryOutboxStore>,
    ledger: Arc<LedgerService>,
    funding: Arc<FundingService>,
    funding_store: Arc<MemoryFundingStore>,
}

async fn harness(currency: &str) -> Harness {
    let outbox = Arc::new(MemoryOutboxStore::new());
    let ledger_store = Arc::new(MemoryLedgerStore::new(outbox.clone()));
    let ledger = Arc::new(LedgerService::new(ledger_store, LedgerConfig::default()));
    ledger
        .initialize_system_accounts("tenant-a", Currency::new(currency))
        .await
        .unwrap();

    let funding_store = Arc::new(MemoryFundingStore::new(outbox.clone()));
    let funding = Arc::new(FundingService::new(
        funding_store.clone(),
        ledger.clone(),
        outbox.clone(),
        FundingConfig::default(),
    ));

    Harness {
        outbox,
        ledger,
        funding,
        funding_store,
    }
}

fn intent_request(method: Method, amount: i64, currency: &str, key: &str) -> CreateIntentRequest {
    CreateIntentRequest {
        tenant_id: "tenant-a".into(),
        wallet_id: "wal-1".into(),
        customer_id: "cus-1".into(),
        amount: Money::new(amount, Currency::new(currency)),
        method,
        idempotency_key: key.into(),
        return_url: None,
        metadata: Default::default(),
    }
}

fn credit_for(reference: &str, amount: i64, currency: &str, statement_id: &str) -> InboundCreditEvent {
    InboundCreditEvent {
        statement_id: statement_id.to_string(),
        rail: "SEPA".to_string(),
        reference: reference.to_string(),
        amount: Money::new(amount, Currency::new(currency)),
        tenant_id: Some("tenant-a".to_string()),
        sender_name: Some("ACME GMBH".to_string()),
        sender_account: None,
        received_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_happy_path_sepa_inbound() {
    let h = harness("EUR").await;

    let response = h
        .funding
        .create_intent(&intent_request(Method::Sepa, 1000, "EUR", "K1"))
        .await
        .unwrap();

    assert_eq!(response.status, IntentStatus::Created);
    let details = response.bank_details.expect("sepa intent returns bank details");
    assert!(details.reference.starts_with("W3G8-"));
    assert!(details.iban.is_some());

    h.funding
        .process_inbound_credit(&credit_for(&details.reference, 1000, "EUR", "stmt-1"))
        .await
        .unwrap();

    let intent = h
        .funding
        .get_intent("tenant-a", &response.intent_id)
        .await
        .unwrap();
    assert_eq!(intent.status, IntentStatus::Settled);
    assert!(intent.settled_at.is_some());

    let batch_id = intent.ledger_batch_id.expect("settled intent links its batch");
    let batch = h.ledger.get_batch("tenant-a", &batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Posted);
    assert_eq!(batch.source_type, SourceType::Deposit);
    assert_eq!(batch.source_id, intent.id);
    assert_eq!(batch.entry_count, 2);

    let clearing = h.ledger.get_account_by_code("tenant-a", "1300").await.unwrap();
    let wallet = h.ledger.get_account_by_code("tenant-a", "2000").await.unwrap();

    let debit = batch
        .entries
        .iter()
        .find(|e| e.entry_type == EntryType::Debit)
        .unwrap();
    let credit = batch
        .entries
        .iter()
        .find(|e| e.entry_type == EntryType::Credit)
        .unwrap();
    assert_eq!(debit.account_id, clearing.id);
    assert_eq!(debit.amount.amount_minor, 1000);
    assert_eq!(credit.account_id, wallet.id);
    assert_eq!(credit.amount.amount_minor, 1000);

    assert_eq!(h.ledger.get_account_balance(&clearing.id).await.unwrap(), 1000);
    assert_eq!(h.ledger.get_account_balance(&wallet.id).await.unwrap(), 1000);

    assert_eq!(h.outbox.count_of(EVENT_FUNDING_SETTLED).await, 1);
    assert_eq!(h.outbox.count_of(EVENT_LEDGER_BATCH_POSTED).await, 1);
}

#[tokio::test]
async fn test_create_intent_is_idempotent() {
    let h = harness("EUR").await;
    let request = intent_request(Method::Sepa, 1000, "EUR", "K2");

    let first = h.funding.create_intent(&request).await.unwrap();
    let second = h.funding.create_intent(&request).await.unwrap();

    assert_eq!(first.intent_id, second.intent_id);
    assert_eq!(first.status, second.status);
    assert_eq!(
        first.bank_details.as_ref().map(|d| &d.reference),
        second.bank_details.as_ref().map(|d| &d.reference)
    );

    // Only one row, only one created event.
    assert_eq!(h.outbox.count_of(EVENT_INTENT_CREATED).await, 1);
}

#[tokio::test]
async fn test_inbound_credit_replay_settles_once() {
    let h = harness("EUR").await;

    let response = h
        .funding
        .create_intent(&intent_request(Method::Sepa, 1000, "EUR", "K3"))
        .await
        .unwrap();
    let reference = response.bank_details.unwrap().reference;

    let event = credit_for(&reference, 1000, "EUR", "stmt-replay");
    h.funding.process_inbound_credit(&event).await.unwrap();
    h.funding.process_inbound_credit(&event).await.unwrap();

    assert_eq!(h.outbox.count_of(EVENT_FUNDING_SETTLED).await, 1);
    assert_eq!(h.outbox.count_of(EVENT_LEDGER_BATCH_POSTED).await, 1);
}

#[tokio::test]
async fn test_normalized_reference_still_matches() {
    let h = harness("EUR").await;

    let response = h
        .funding
        .create_intent(&intent_request(Method::Sepa, 1000, "EUR", "K4"))
        .await
        .unwrap();
    let reference = response.bank_details.unwrap().reference;

    // Banks mangle case and punctuation; normalization recovers it.
    let mangled = reference.replace('-', " ").to_lowercase();
    h.funding
        .process_inbound_credit(&credit_for(&mangled, 1000, "EUR", "stmt-m1"))
        .await
        .unwrap();

    let intent = h
        .funding
        .get_intent("tenant-a", &response.intent_id)
        .await
        .unwrap();
    assert_eq!(intent.status, IntentStatus::Settled);
}

#[tokio::test]
async fn test_amount_mismatch_blocks_settlement() {
    let h = harness("GBP").await;

    let response = h
        .funding
        .create_intent(&intent_request(Method::Fps, 5000, "GBP", "K5"))
        .await
        .unwrap();
    let reference = response.bank_details.unwrap().reference;

    let mut event = credit_for(&reference, 4999, "GBP", "stmt-short");
    event.rail = "FPS".to_string();
    h.funding.process_inbound_credit(&event).await.unwrap();

    let intent = h
        .funding
        .get_intent("tenant-a", &response.intent_id)
        .await
        .unwrap();
    assert_eq!(intent.status, IntentStatus::Created);
    assert!(intent.ledger_batch_id.is_none());

    assert_eq!(h.outbox.count_of(EVENT_FUNDING_SETTLED).await, 0);
    assert_eq!(h.outbox.count_of(EVENT_LEDGER_BATCH_POSTED).await, 0);
    assert_eq!(h.outbox.count_of(EVENT_RECON_MISMATCH).await, 1);

    let mismatch_row = h
        .outbox
        .all()
        .await
        .into_iter()
        .find(|e| e.event_type == EVENT_RECON_MISMATCH)
        .unwrap();
    let mismatch: ReconMismatchData = mismatch_row.envelope().unwrap().decode().unwrap();
    assert_eq!(mismatch.mismatch_type, "amount");
    assert_eq!(mismatch.expected_amount.amount_minor, 5000);
    assert_eq!(mismatch.actual_amount.amount_minor, 4999);
}

#[tokio::test]
async fn test_orphan_credit_goes_to_manual_review() {
    let h = harness("EUR").await;

    h.funding
        .process_inbound_credit(&credit_for("W3G8-NOSUCH00", 1000, "EUR", "stmt-orphan"))
        .await
        .unwrap();

    assert_eq!(h.funding_store.orphan_count().await, 1);
    assert_eq!(h.outbox.count_of(EVENT_INBOUND_CREDIT).await, 1);
    assert_eq!(h.outbox.count_of(EVENT_FUNDING_SETTLED).await, 0);
}

#[tokio::test]
async fn test_duplicate_credit_after_settlement_flags_mismatch() {
    let h = harness("EUR").await;

    let response = h
        .funding
        .create_intent(&intent_request(Method::Sepa, 1000, "EUR", "K6"))
        .await
        .unwrap();
    let reference = response.bank_details.unwrap().reference;

    h.funding
        .process_inbound_credit(&credit_for(&reference, 1000, "EUR", "stmt-a"))
        .await
        .unwrap();
    // Different statement, same reference: real money arrived twice.
    h.funding
        .process_inbound_credit(&credit_for(&reference, 1000, "EUR", "stmt-b"))
        .await
        .unwrap();

    assert_eq!(h.outbox.count_of(EVENT_FUNDING_SETTLED).await, 1);
    assert_eq!(h.outbox.count_of(EVENT_LEDGER_BATCH_POSTED).await, 1);

    let mismatch_row = h
        .outbox
        .all()
        .await
        .into_iter()
        .find(|e| e.event_type == EVENT_RECON_MISMATCH)
        .unwrap();
    let mismatch: ReconMismatchData = mismatch_row.envelope().unwrap().decode().unwrap();
    assert_eq!(mismatch.mismatch_type, "duplicate");
}

fn card_payment(intent_id: &str, transaction_id: &str, amount: i64, currency: &str) -> CardPayment {
    CardPayment {
        id: format!("card-{transaction_id}"),
        tenant_id: "tenant-a".into(),
        intent_id: intent_id.to_string(),
        customer_id: "cus-1".into(),
        card_token: "tok_test".into(),
        transaction_id: transaction_id.to_string(),
        auth_code: Some("A1B2C3".into()),
        card_last_four: Some("4242".into()),
        card_brand: Some("VISA".into()),
        amount_minor: amount,
        currency: currency.to_string(),
        three_ds_version: None,
        status: CardStatus::Authorised,
        initiated_at: Utc::now(),
        authorised_at: Some(Utc::now()),
        captured_at: None,
        refunded_at: None,
        chargeback_at: None,
        chargeback_reason: None,
        error_code: None,
        error_message: None,
        decline_reason: None,
        response_data: serde_json::Value::Null,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_duplicate_card_capture_webhook_is_noop() {
    let h = harness("USD").await;

    let response = h
        .funding
        .create_intent(&intent_request(Method::Card, 2500, "USD", "K7"))
        .await
        .unwrap();
    assert!(response.payment_session.is_some());

    let card_store = Arc::new(MemoryCardStore::new());
    let adapter = Arc::new(CardAdapter::new(CardConfig::default(), card_store.clone()));
    adapter.set_callbacks(h.funding.clone());

    use crate::rails::card::CardStore;
    card_store
        .create(&card_payment(&response.intent_id, "txn-T", 2500, "USD"))
        .await
        .unwrap();

    let webhook = CardWebhookPayload {
        transaction_id: "txn-T".into(),
        status: "CAPTURED".into(),
        reason: None,
        error_code: None,
        error_message: None,
    };

    adapter.handle_webhook(&webhook).await.unwrap();
    adapter.handle_webhook(&webhook).await.unwrap();

    let intent = h
        .funding
        .get_intent("tenant-a", &response.intent_id)
        .await
        .unwrap();
    assert_eq!(intent.status, IntentStatus::Settled);
    assert_eq!(intent.provider_ref.as_deref(), Some("txn-T"));

    assert_eq!(h.outbox.count_of(EVENT_FUNDING_SETTLED).await, 1);
    assert_eq!(h.outbox.count_of(EVENT_LEDGER_BATCH_POSTED).await, 1);
}

#[tokio::test]
async fn test_chargeback_posts_compensating_batch() {
    let h = harness("USD").await;

    let response = h
        .funding
        .create_intent(&intent_request(Method::Card, 2500, "USD", "K8"))
        .await
        .unwrap();

    h.funding
        .process_card_payment("tenant-a", &response.intent_id, "txn-CB", true)
        .await
        .unwrap();

    let settled = h
        .funding
        .get_intent("tenant-a", &response.intent_id)
        .await
        .unwrap();
    let original_batch_id = settled.ledger_batch_id.clone().unwrap();

    h.funding
        .process_chargeback("tenant-a", &response.intent_id, "fraud")
        .await
        .unwrap();

    let reversed = h
        .funding
        .get_intent("tenant-a", &response.intent_id)
        .await
        .unwrap();
    assert_eq!(reversed.status, IntentStatus::Reversed);
    assert_eq!(reversed.reversal_reason, "fraud");
    assert!(reversed.reversed_at.is_some());
    // The original settlement batch stays linked.
    assert_eq!(reversed.ledger_batch_id.as_deref(), Some(original_batch_id.as_str()));

    // The wallet liability and the card receivable both net to zero.
    let receivable = h.ledger.get_account_by_code("tenant-a", "1200").await.unwrap();
    let wallet = h.ledger.get_account_by_code("tenant-a", "2000").await.unwrap();
    assert_eq!(h.ledger.get_account_balance(&receivable.id).await.unwrap(), 0);
    assert_eq!(h.ledger.get_account_balance(&wallet.id).await.unwrap(), 0);

    // Compensating batch: debit wallet liability, credit receivable.
    let (wallet_entries, _) = h
        .ledger
        .get_account_entries(&wallet.id, None, None, 10, 0)
        .await
        .unwrap();
    assert_eq!(wallet_entries.len(), 2);
    assert_eq!(wallet_entries[0].entry_type, EntryType::Debit);
    assert_eq!(wallet_entries[0].amount.amount_minor, 2500);

    let comp_batch = h
        .ledger
        .get_batch("tenant-a", &wallet_entries[0].batch_id)
        .await
        .unwrap();
    assert_eq!(comp_batch.source_type, SourceType::Chargeback);
    assert_eq!(comp_batch.source_id, original_batch_id);

    assert_eq!(h.outbox.count_of(EVENT_FUNDING_REVERSED).await, 1);

    // Chargeback replays change nothing further.
    h.funding
        .process_chargeback("tenant-a", &response.intent_id, "fraud")
        .await
        .unwrap();
    assert_eq!(h.outbox.count_of(EVENT_FUNDING_REVERSED).await, 1);
}

#[tokio::test]
async fn test_refund_webhook_reverses_intent() {
    let h = harness("USD").await;

    let response = h
        .funding
        .create_intent(&intent_request(Method::Card, 2500, "USD", "K13"))
        .await
        .unwrap();

    h.funding
        .process_card_payment("tenant-a", &response.intent_id, "txn-R", true)
        .await
        .unwrap();

    let card_store = Arc::new(MemoryCardStore::new());
    let adapter = Arc::new(CardAdapter::new(CardConfig::default(), card_store.clone()));
    adapter.set_callbacks(h.funding.clone());

    use crate::rails::card::CardStore;
    let mut payment = card_payment(&response.intent_id, "txn-R", 2500, "USD");
    payment.status = CardStatus::Captured;
    payment.captured_at = Some(Utc::now());
    card_store.create(&payment).await.unwrap();

    let webhook = CardWebhookPayload {
        transaction_id: "txn-R".into(),
        status: "REFUNDED".into(),
        reason: None,
        error_code: None,
        error_message: None,
    };
    adapter.handle_webhook(&webhook).await.unwrap();

    let intent = h
        .funding
        .get_intent("tenant-a", &response.intent_id)
        .await
        .unwrap();
    assert_eq!(intent.status, IntentStatus::Reversed);
    assert_eq!(intent.reversal_reason, "merchant refund");

    let stored = card_store
        .get_by_transaction_id("txn-R")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, CardStatus::Refunded);

    // The refund undoes the settlement on both legs.
    let receivable = h.ledger.get_account_by_code("tenant-a", "1200").await.unwrap();
    let wallet = h.ledger.get_account_by_code("tenant-a", "2000").await.unwrap();
    assert_eq!(h.ledger.get_account_balance(&receivable.id).await.unwrap(), 0);
    assert_eq!(h.ledger.get_account_balance(&wallet.id).await.unwrap(), 0);

    assert_eq!(h.outbox.count_of(EVENT_FUNDING_REVERSED).await, 1);

    // Replayed refund confirmation is a no-op end to end.
    adapter.handle_webhook(&webhook).await.unwrap();
    assert_eq!(h.outbox.count_of(EVENT_FUNDING_REVERSED).await, 1);
}

struct MockCardProvider {
    refunds: std::sync::Mutex<Vec<(String, i64)>>,
}

impl MockCardProvider {
    fn new() -> Self {
        Self {
            refunds: std::sync::Mutex::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl crate::rails::CardProvider for MockCardProvider {
    async fn charge(
        &self,
        _intent: &crate::funding::FundingIntent,
        _card_token: &str,
        _three_ds: Option<&crate::rails::ThreeDsData>,
    ) -> Result<String, crate::rails::RailError> {
        Ok("txn-mock".to_string())
    }

    async fn capture(&self, _transaction_id: &str) -> Result<(), crate::rails::RailError> {
        Ok(())
    }

    async fn refund(
        &self,
        transaction_id: &str,
        amount: &Money,
    ) -> Result<(), crate::rails::RailError> {
        self.refunds
            .lock()
            .unwrap()
            .push((transaction_id.to_string(), amount.amount_minor));
        Ok(())
    }
}

#[tokio::test]
async fn test_refund_card_drives_the_provider() {
    let h = harness("USD").await;
    let provider = Arc::new(MockCardProvider::new());
    h.funding.set_card_provider(provider.clone());

    let response = h
        .funding
        .create_intent(&intent_request(Method::Card, 2500, "USD", "K14"))
        .await
        .unwrap();

    // Refund before settlement is not a thing.
    let err = h
        .funding
        .refund_card("tenant-a", &response.intent_id)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_STATE");

    h.funding
        .process_card_payment("tenant-a", &response.intent_id, "txn-RF", true)
        .await
        .unwrap();

    h.funding
        .refund_card("tenant-a", &response.intent_id)
        .await
        .unwrap();

    let refunds = provider.refunds.lock().unwrap();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0], ("txn-RF".to_string(), 2500));
}

#[tokio::test]
async fn test_refund_card_without_provider_is_rejected() {
    let h = harness("USD").await;
    let err = h.funding.refund_card("tenant-a", "no-intent").await.unwrap_err();
    assert_eq!(err.code(), "VALIDATION");
}

#[tokio::test]
async fn test_card_decline_fails_intent() {
    let h = harness("USD").await;

    let response = h
        .funding
        .create_intent(&intent_request(Method::Card, 2500, "USD", "K9"))
        .await
        .unwrap();

    h.funding
        .process_card_payment("tenant-a", &response.intent_id, "txn-D", false)
        .await
        .unwrap();

    let intent = h
        .funding
        .get_intent("tenant-a", &response.intent_id)
        .await
        .unwrap();
    assert_eq!(intent.status, IntentStatus::Failed);
    assert_eq!(intent.error_code, "CARD_DECLINED");
    assert!(intent.ledger_batch_id.is_none());
}

#[tokio::test]
async fn test_expiry_sweep_is_idempotent() {
    let outbox = Arc::new(MemoryOutboxStore::new());
    let ledger_store = Arc::new(MemoryLedgerStore::new(outbox.clone()));
    let ledger = Arc::new(LedgerService::new(ledger_store, LedgerConfig::default()));
    let funding_store = Arc::new(MemoryFundingStore::new(outbox.clone()));

    // Zero TTL: intents are born expired.
    let config = FundingConfig {
        default_expiry_secs: 0,
        ..FundingConfig::default()
    };
    let funding = Arc::new(FundingService::new(
        funding_store,
        ledger,
        outbox.clone(),
        config,
    ));

    let response = h_create(&funding, "K10").await;

    let cutoff = Utc::now() + chrono::Duration::seconds(1);
    let first = funding.expire_stale_intents(cutoff, 100).await.unwrap();
    let second = funding.expire_stale_intents(cutoff, 100).await.unwrap();
    assert_eq!(first, 1);
    assert_eq!(second, 0);

    let intent = funding.get_intent("tenant-a", &response).await.unwrap();
    assert_eq!(intent.status, IntentStatus::Expired);
    assert_eq!(h_count(&outbox, "funding.expired").await, 1);
}

async fn h_create(funding: &FundingService, key: &str) -> String {
    funding
        .create_intent(&intent_request(Method::Sepa, 1000, "EUR", key))
        .await
        .unwrap()
        .intent_id
}

async fn h_count(outbox: &MemoryOutboxStore, event_type: &str) -> usize {
    outbox.count_of(event_type).await
}

#[tokio::test]
async fn test_ach_is_rejected() {
    let h = harness("USD").await;
    let err = h
        .funding
        .create_intent(&intent_request(Method::Ach, 1000, "USD", "K11"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION");
}

#[tokio::test]
async fn test_settlement_without_accounts_raises_orphan_alarm() {
    // Ledger has no chart for this tenant: the rail settled but the
    // post cannot happen.
    let outbox = Arc::new(MemoryOutboxStore::new());
    let ledger_store = Arc::new(MemoryLedgerStore::new(outbox.clone()));
    let ledger = Arc::new(LedgerService::new(ledger_store, LedgerConfig::default()));
    let funding_store = Arc::new(MemoryFundingStore::new(outbox.clone()));
    let funding = Arc::new(FundingService::new(
        funding_store,
        ledger,
        outbox.clone(),
        FundingConfig::default(),
    ));

    let response = funding
        .create_intent(&intent_request(Method::Sepa, 1000, "EUR", "K12"))
        .await
        .unwrap();
    let reference = response.bank_details.unwrap().reference;

    let result = funding
        .process_inbound_credit(&credit_for(&reference, 1000, "EUR", "stmt-x"))
        .await;
    assert!(result.is_err());

    // Intent untouched, alarm emitted.
    let intent = funding.get_intent("tenant-a", &response.intent_id).await.unwrap();
    assert_eq!(intent.status, IntentStatus::Created);

    let alarm = outbox
        .all()
        .await
        .into_iter()
        .find(|e| e.event_type == EVENT_RECON_MISMATCH)
        .unwrap();
    let data: ReconMismatchData = alarm.envelope().unwrap().decode().unwrap();
    assert_eq!(data.mismatch_type, "orphan_settlement");
}
