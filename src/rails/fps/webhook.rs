//! FPS Webhook Ingestion
//!
//! Decoded webhook payloads land here (the HTTP plumbing lives outside
//! this crate). Each observation is applied through a CAS on the rail
//! record, so provider redeliveries of a terminal state change nothing
//! and push nothing upward.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::{error, info, warn};

use super::store::FpsStore;
use crate::events::{FundingUpdateData, InboundCreditEvent};
use crate::money::{Currency, Money};
use crate::rails::{parse_rfc3339, FundingCallbacks, RailError};

#[derive(Debug, Clone, Deserialize)]
pub struct FpsWebhookPayload {
    pub end_to_end_id: String,
    #[serde(default)]
    pub provider_payment_id: Option<String>,
    /// ACCEPTED, SETTLED, FAILED or RETURNED
    pub status: String,
    #[serde(default)]
    pub settled_at: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub return_reason: Option<String>,
}

pub struct FpsWebhookHandler {
    store: Arc<dyn FpsStore>,
    callbacks: Arc<dyn FundingCallbacks>,
}

impl FpsWebhookHandler {
    pub fn new(store: Arc<dyn FpsStore>, callbacks: Arc<dyn FundingCallbacks>) -> Self {
        Self { store, callbacks }
    }

    pub async fn handle(&self, payload: &FpsWebhookPayload) -> Result<(), RailError> {
        info!(
            end_to_end_id = %payload.end_to_end_id,
            status = %payload.status,
            "Received FPS webhook"
        );

        let payment = self
            .store
            .get_by_end_to_end_id(&payload.end_to_end_id)
            .await?
            .ok_or_else(|| RailError::NotFound(payload.end_to_end_id.clone()))?;

        match payload.status.as_str() {
            "ACCEPTED" => {
                let transitioned = self
                    .store
                    .mark_accepted(&payload.end_to_end_id, Utc::now())
                    .await?;
                if !transitioned {
                    warn!(
                        end_to_end_id = %payload.end_to_end_id,
                        current = payment.status.as_str(),
                        "Unexpected ACCEPTED webhook, ignoring"
                    );
                }
            }
            "SETTLED" => {
                let settled_at = payload
                    .settled_at
                    .as_deref()
                    .and_then(parse_rfc3339)
                    .unwrap_or_else(Utc::now);

                let transitioned = self
                    .store
                    .mark_settled(&payload.end_to_end_id, settled_at)
                    .await?;
                if !transitioned {
                    info!(
                        end_to_end_id = %payload.end_to_end_id,
                        "SETTLED webhook replay, no-op"
                    );
                    return Ok(());
                }

                // Translate upward: the orchestrator sees a normalized
                // inbound credit, never FPS grammar.
                let credit = InboundCreditEvent {
                    statement_id: format!("fps:{}", payload.end_to_end_id),
                    rail: "FPS".to_string(),
                    reference: payment.reference.clone(),
                    amount: Money::new(payment.amount_minor, Currency::new(&payment.currency)),
                    tenant_id: None,
                    sender_name: None,
                    sender_account: None,
                    received_at: settled_at,
                };
                if let Err(e) = self.callbacks.process_inbound_credit(&credit).await {
                    // The orchestrator owns resolution (orphan alarm is
                    // already raised); the webhook itself is consumed.
                    error!(
                        end_to_end_id = %payload.end_to_end_id,
                        error = %e,
                        "Settlement processing failed"
                    );
                }
            }
            "FAILED" => {
                let transitioned = self
                    .store
                    .mark_failed(
                        &payload.end_to_end_id,
                        payload.error_code.as_deref().unwrap_or("FPS_FAILED"),
                        payload.error_message.as_deref().unwrap_or(""),
                    )
                    .await?;
                if !transitioned {
                    info!(
                        end_to_end_id = %payload.end_to_end_id,
                        "FAILED webhook replay, no-op"
                    );
                    return Ok(());
                }

                let update = FundingUpdateData {
                    intent_id: payment.intent_id.clone(),
                    wallet_id: String::new(),
                    status: "failed".to_string(),
                    provider_ref: Some(payload.end_to_end_id.clone()),
                    rail: "FPS".to_string(),
                    amount: Money::new(payment.amount_minor, Currency::new(&payment.currency)),
                    error_code: payload.error_code.clone(),
                    error_message: payload.error_message.clone(),
                    settled_at: None,
                    ledger_batch_id: None,
                };
                if let Err(e) = self.callbacks.process_funding_update(&update).await {
                    error!(
                        intent_id = %payment.intent_id,
                        error = %e,
                        "Failure propagation failed"
                    );
                }
            }
            "RETURNED" => {
                let reason = payload
                    .return_reason
                    .clone()
                    .unwrap_or_else(|| "FPS return".to_string());
                let transitioned = self
                    .store
                    .mark_returned(&payload.end_to_end_id, &reason, Utc::now())
                    .await?;
                if !transitioned {
                    info!(
                        end_to_end_id = %payload.end_to_end_id,
                        "RETURNED webhook replay or unexpected state, no-op"
                    );
                    return Ok(());
                }

                if let Err(e) = self
                    .callbacks
                    .process_chargeback("", &payment.intent_id, &format!("FPS return: {reason}"))
                    .await
                {
                    error!(
                        intent_id = %payment.intent_id,
                        error = %e,
                        "Return reversal failed"
                    );
                }
            }
            other => {
                warn!(status = %other, "Unknown FPS webhook status");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::FundingUpdateData;
    use crate::funding::FundingError;
    use crate::rails::fps::store::MemoryFpsStore;
    use crate::rails::fps::{FpsPayment, FpsStatus};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingCallbacks {
        credits: StdMutex<Vec<InboundCreditEvent>>,
        updates: StdMutex<Vec<FundingUpdateData>>,
        chargebacks: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl FundingCallbacks for RecordingCallbacks {
        async fn process_inbound_credit(
            &self,
            event: &InboundCreditEvent,
        ) -> Result<(), FundingError> {
            self.credits.lock().unwrap().push(event.clone());
            Ok(())
        }

        async fn process_card_payment(
            &self,
            _tenant_id: &str,
            _intent_id: &str,
            _transaction_id: &str,
            _captured: bool,
        ) -> Result<(), FundingError> {
            Ok(())
        }

        async fn process_chargeback(
            &self,
            _tenant_id: &str,
            intent_id: &str,
            _reason: &str,
        ) -> Result<(), FundingError> {
            self.chargebacks.lock().unwrap().push(intent_id.to_string());
            Ok(())
        }

        async fn process_funding_update(
            &self,
            update: &FundingUpdateData,
        ) -> Result<(), FundingError> {
            self.updates.lock().unwrap().push(update.clone());
            Ok(())
        }
    }

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

    async fn handler_with_payment(
        e2e: &str,
    ) -> (FpsWebhookHandler, Arc<MemoryFpsStore>, Arc<RecordingCallbacks>) {
        let store = Arc::new(MemoryFpsStore::new());
        store.create(&payment(e2e)).await.unwrap();
        let callbacks = Arc::new(RecordingCallbacks::default());
        let handler = FpsWebhookHandler::new(store.clone(), callbacks.clone());
        (handler, store, callbacks)
    }

    fn webhook(e2e: &str, status: &str) -> FpsWebhookPayload {
        FpsWebhookPayload {
            end_to_end_id: e2e.to_string(),
            provider_payment_id: Some("PP-1".into()),
            status: status.to_string(),
            settled_at: Some("2026-03-01T12:00:00Z".into()),
            error_code: None,
            error_message: None,
            return_reason: None,
        }
    }

    #[tokio::test]
    async fn test_settled_webhook_emits_inbound_credit() {
        let (handler, store, callbacks) = handler_with_payment("E2E1").await;

        handler.handle(&webhook("E2E1", "SETTLED")).await.unwrap();

        let stored = store.get_by_end_to_end_id("E2E1").await.unwrap().unwrap();
        assert_eq!(stored.status, FpsStatus::Settled);

        let credits = callbacks.credits.lock().unwrap();
        assert_eq!(credits.len(), 1);
        assert_eq!(credits[0].reference, "W3G8-ABCD1234");
        assert_eq!(credits[0].statement_id, "fps:E2E1");
        assert_eq!(credits[0].amount.amount_minor, 5000);
    }

    #[tokio::test]
    async fn test_settled_replay_pushes_nothing_upward() {
        let (handler, _store, callbacks) = handler_with_payment("E2E1").await;

        handler.handle(&webhook("E2E1", "SETTLED")).await.unwrap();
        handler.handle(&webhook("E2E1", "SETTLED")).await.unwrap();

        assert_eq!(callbacks.credits.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_webhook_translates_upward() {
        let (handler, store, callbacks) = handler_with_payment("E2E1").await;

        let mut payload = webhook("E2E1", "FAILED");
        payload.error_code = Some("AC01".into());
        handler.handle(&payload).await.unwrap();

        let stored = store.get_by_end_to_end_id("E2E1").await.unwrap().unwrap();
        assert_eq!(stored.status, FpsStatus::Failed);

        let updates = callbacks.updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].status, "failed");
        assert_eq!(updates[0].error_code.as_deref(), Some("AC01"));
    }

    #[tokio::test]
    async fn test_return_after_settlement_routes_to_chargeback() {
        let (handler, _store, callbacks) = handler_with_payment("E2E1").await;

        handler.handle(&webhook("E2E1", "SETTLED")).await.unwrap();
        let mut payload = webhook("E2E1", "RETURNED");
        payload.return_reason = Some("AC03".into());
        handler.handle(&payload).await.unwrap();

        assert_eq!(callbacks.chargebacks.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_payment_is_an_error() {
        let store = Arc::new(MemoryFpsStore::new());
        let callbacks = Arc::new(RecordingCallbacks::default());
        let handler = FpsWebhookHandler::new(store, callbacks);

        let err = handler.handle(&webhook("ghost", "SETTLED")).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }
}
