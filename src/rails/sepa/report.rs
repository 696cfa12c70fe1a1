//! SEPA Report Ingestion
//!
//! The bank's word is final: camt.053 statements and pain.002 status
//! reports are the authoritative record of what settled, what bounced
//! and what arrived. Files are deduplicated by SHA-256 of their content,
//! so a re-presented file is processed once; inside a file, each
//! `(msg_id, pmt_inf_id)` applies at most one transition because the
//! store transitions are CAS-guarded.
//!
//! Booked CRDT entries are translated into normalized inbound-credit
//! events for the funding matcher; booked DBIT entries settle our own
//! submitted payments.

use std::sync::{Arc, RwLock};

use chrono::Utc;
use quick_xml::events::Event;
use quick_xml::Reader;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use ulid::Ulid;

use super::store::{ReportStatus, SepaReport, SepaReportStore, SepaStore};
use super::SepaStatus;
use crate::events::{FundingUpdateData, InboundCreditEvent};
use crate::money::{Currency, Money};
use crate::rails::{FundingCallbacks, RailError};

/// One payment status extracted from a report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub msg_id: String,
    pub pmt_inf_id: String,
    pub end_to_end_id: String,
    pub status: SepaStatus,
    pub reject_reason_code: String,
    pub reject_reason_desc: String,
}

/// One booked credit extracted from a camt.053 statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditLine {
    pub statement_id: String,
    pub reference: String,
    pub amount_minor: i64,
    pub currency: String,
    pub debtor_name: Option<String>,
}

#[derive(Debug)]
pub enum IngestOutcome {
    /// Same content hash seen before; nothing done.
    AlreadyProcessed,
    Processed {
        report_id: String,
        payments_updated: usize,
        credits_forwarded: usize,
    },
}

pub struct ReportIngester {
    payments: Arc<dyn SepaStore>,
    reports: Arc<dyn SepaReportStore>,
    callbacks: RwLock<Option<Arc<dyn FundingCallbacks>>>,
}

impl ReportIngester {
    pub fn new(payments: Arc<dyn SepaStore>, reports: Arc<dyn SepaReportStore>) -> Self {
        Self {
            payments,
            reports,
            callbacks: RwLock::new(None),
        }
    }

    pub fn set_callbacks(&self, callbacks: Arc<dyn FundingCallbacks>) {
        *self.callbacks.write().unwrap() = Some(callbacks);
    }

    fn callbacks(&self) -> Option<Arc<dyn FundingCallbacks>> {
        self.callbacks.read().unwrap().clone()
    }

    /// Ingest one report file.
    pub async fn ingest(&self, data: &[u8]) -> Result<IngestOutcome, RailError> {
        let mut hasher = Sha256::new();
        hasher.update(data);
        let file_hash = format!("{:x}", hasher.finalize());

        let report_type = detect_report_type(data);

        let report = SepaReport {
            id: Ulid::new().to_string(),
            report_type: report_type.to_string(),
            file_hash: file_hash.clone(),
            status: ReportStatus::Pending,
            payments_updated: 0,
            error_message: None,
            received_at: Utc::now(),
            processed_at: None,
        };

        if !self.reports.create(&report).await? {
            info!(file_hash = %file_hash, "Report already processed, ignoring");
            return Ok(IngestOutcome::AlreadyProcessed);
        }

        info!(
            report_id = %report.id,
            report_type = %report_type,
            "Ingesting SEPA report"
        );

        let parsed = match report_type {
            "pain.002" => parse_pain002(data).map(|updates| (updates, Vec::new())),
            "camt.053" => parse_camt053(data),
            other => Err(RailError::Rejected {
                code: "UNSUPPORTED_REPORT".into(),
                message: format!("unsupported report type: {other}"),
            }),
        };
        let (updates, credits) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                self.reports.mark_failed(&report.id, &e.to_string()).await?;
                return Err(e);
            }
        };

        let mut payments_updated = 0usize;
        for update in &updates {
            match self.apply_update(&report.id, update).await {
                Ok(true) => payments_updated += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        msg_id = %update.msg_id,
                        pmt_inf_id = %update.pmt_inf_id,
                        error = %e,
                        "Failed to apply report update"
                    );
                }
            }
        }

        let mut credits_forwarded = 0usize;
        if let Some(callbacks) = self.callbacks() {
            for credit in &credits {
                let event = InboundCreditEvent {
                    statement_id: credit.statement_id.clone(),
                    rail: "SEPA".to_string(),
                    reference: credit.reference.clone(),
                    amount: Money::new(credit.amount_minor, Currency::new(&credit.currency)),
                    tenant_id: None,
                    sender_name: credit.debtor_name.clone(),
                    sender_account: None,
                    received_at: Utc::now(),
                };
                match callbacks.process_inbound_credit(&event).await {
                    Ok(()) => credits_forwarded += 1,
                    Err(e) => {
                        warn!(
                            statement_id = %credit.statement_id,
                            reference = %credit.reference,
                            error = %e,
                            "Inbound credit processing failed"
                        );
                    }
                }
            }
        } else if !credits.is_empty() {
            warn!(
                count = credits.len(),
                "No funding callbacks wired, credits not forwarded"
            );
        }

        self.reports
            .mark_processed(&report.id, payments_updated as i32)
            .await?;

        info!(
            report_id = %report.id,
            payments_updated = payments_updated,
            credits_forwarded = credits_forwarded,
            "SEPA report processed"
        );

        Ok(IngestOutcome::Processed {
            report_id: report.id,
            payments_updated,
            credits_forwarded,
        })
    }

    async fn apply_update(
        &self,
        report_id: &str,
        update: &StatusUpdate,
    ) -> Result<bool, RailError> {
        let transitioned = match update.status {
            SepaStatus::Accepted => {
                self.payments
                    .mark_accepted(&update.msg_id, &update.pmt_inf_id, Utc::now())
                    .await?
            }
            SepaStatus::Settled => {
                self.payments
                    .mark_settled(&update.msg_id, &update.pmt_inf_id, Utc::now())
                    .await?
            }
            SepaStatus::Rejected => {
                self.payments
                    .mark_rejected(
                        &update.msg_id,
                        &update.pmt_inf_id,
                        &update.reject_reason_code,
                        &update.reject_reason_desc,
                    )
                    .await?
            }
            _ => false,
        };

        if transitioned {
            self.payments
                .record_report_touch(&update.msg_id, &update.pmt_inf_id, report_id)
                .await?;
        }

        // A rejection is the bank failing our own submission; push it
        // upward so the intent fails now rather than idling to expiry.
        if transitioned && update.status == SepaStatus::Rejected {
            self.forward_rejection(update).await?;
        }

        Ok(transitioned)
    }

    async fn forward_rejection(&self, update: &StatusUpdate) -> Result<(), RailError> {
        let callbacks = match self.callbacks() {
            Some(callbacks) => callbacks,
            None => return Ok(()),
        };
        let payment = match self
            .payments
            .get_by_msg_and_pmt_inf(&update.msg_id, &update.pmt_inf_id)
            .await?
        {
            Some(payment) if !payment.intent_id.is_empty() => payment,
            _ => return Ok(()),
        };

        let data = FundingUpdateData {
            intent_id: payment.intent_id.clone(),
            wallet_id: String::new(),
            status: "failed".to_string(),
            provider_ref: Some(format!("{}:{}", update.msg_id, update.pmt_inf_id)),
            rail: "SEPA".to_string(),
            amount: Money::new(payment.amount_minor, Currency::new(&payment.currency)),
            error_code: (!update.reject_reason_code.is_empty())
                .then(|| update.reject_reason_code.clone()),
            error_message: (!update.reject_reason_desc.is_empty())
                .then(|| update.reject_reason_desc.clone()),
            settled_at: None,
            ledger_batch_id: None,
        };
        if let Err(e) = callbacks.process_funding_update(&data).await {
            warn!(
                intent_id = %payment.intent_id,
                error = %e,
                "Rejection propagation failed"
            );
        }
        Ok(())
    }
}

/// Sniff the ISO 20022 message family from the namespace or root.
pub fn detect_report_type(data: &[u8]) -> &'static str {
    let head_len = data.len().min(512);
    let head = String::from_utf8_lossy(&data[..head_len]);
    if head.contains("pain.002") {
        "pain.002"
    } else if head.contains("camt.053") {
        "camt.053"
    } else if head.contains("camt.054") {
        "camt.054"
    } else {
        "unknown"
    }
}

fn map_pain002_status(tx_sts: &str) -> SepaStatus {
    match tx_sts {
        "ACCP" | "ACSP" | "ACSC" | "ACWC" => SepaStatus::Accepted,
        "RJCT" => SepaStatus::Rejected,
        _ => SepaStatus::Submitted,
    }
}

/// Convert an ISO 20022 decimal amount string into minor units.
fn amount_to_minor(value: &str, currency: &str) -> Option<i64> {
    let minor_units: u32 = match currency {
        "JPY" => 0,
        _ => 2,
    };
    let amount: Decimal = value.trim().parse().ok()?;
    let scaled = amount.checked_mul(Decimal::from(10i64.pow(minor_units)))?;
    if scaled.fract() != Decimal::ZERO {
        return None;
    }
    scaled.to_i64()
}

fn path_ends_with(path: &[String], suffix: &[&str]) -> bool {
    if path.len() < suffix.len() {
        return false;
    }
    path[path.len() - suffix.len()..]
        .iter()
        .zip(suffix)
        .all(|(a, b)| a == b)
}

/// Parse a pain.002 Customer Payment Status Report.
pub fn parse_pain002(data: &[u8]) -> Result<Vec<StatusUpdate>, RailError> {
    let mut reader = Reader::from_reader(data);

    let mut path: Vec<String> = Vec::new();
    let mut updates = Vec::new();

    let mut orgnl_msg_id = String::new();
    let mut current_pmt_inf_id = String::new();
    let mut tx_end_to_end = String::new();
    let mut tx_status = String::new();
    let mut tx_reason_code = String::new();
    let mut tx_reason_desc = String::new();

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if name == "TxInfAndSts" {
                    tx_end_to_end.clear();
                    tx_status.clear();
                    tx_reason_code.clear();
                    tx_reason_desc.clear();
                }
                path.push(name);
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().map_err(xml_error)?.trim().to_string();
                if text.is_empty() {
                    buf.clear();
                    continue;
                }
                if path_ends_with(&path, &["OrgnlGrpInfAndSts", "OrgnlMsgId"]) {
                    orgnl_msg_id = text;
                } else if path_ends_with(&path, &["OrgnlPmtInfAndSts", "OrgnlPmtInfId"]) {
                    current_pmt_inf_id = text;
                } else if path_ends_with(&path, &["TxInfAndSts", "OrgnlEndToEndId"]) {
                    tx_end_to_end = text;
                } else if path_ends_with(&path, &["TxInfAndSts", "TxSts"]) {
                    tx_status = text;
                } else if path_ends_with(&path, &["StsRsnInf", "Rsn", "Cd"]) {
                    tx_reason_code = text;
                } else if path_ends_with(&path, &["StsRsnInf", "AddtlInf"]) {
                    tx_reason_desc = text;
                }
            }
            Ok(Event::End(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if name == "TxInfAndSts" {
                    updates.push(StatusUpdate {
                        msg_id: orgnl_msg_id.clone(),
                        pmt_inf_id: current_pmt_inf_id.clone(),
                        end_to_end_id: tx_end_to_end.clone(),
                        status: map_pain002_status(&tx_status),
                        reject_reason_code: tx_reason_code.clone(),
                        reject_reason_desc: tx_reason_desc.clone(),
                    });
                }
                path.pop();
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(xml_error(e)),
        }
        buf.clear();
    }

    Ok(updates)
}

#[derive(Default)]
struct EntryAccumulator {
    amount: String,
    currency: String,
    cdt_dbt_ind: String,
    status: String,
    ntry_ref: String,
    acct_svcr_ref: String,
    msg_id: String,
    pmt_inf_id: String,
    end_to_end_id: String,
    remittance: String,
    debtor_name: String,
}

/// Parse a camt.053 Bank-to-Customer Statement into status updates for
/// our own payments (booked DBIT legs) and inbound credits (booked CRDT
/// legs).
pub fn parse_camt053(data: &[u8]) -> Result<(Vec<StatusUpdate>, Vec<CreditLine>), RailError> {
    let mut reader = Reader::from_reader(data);

    let mut path: Vec<String> = Vec::new();
    let mut updates = Vec::new();
    let mut credits = Vec::new();

    let mut stmt_id = String::new();
    let mut entry = EntryAccumulator::default();
    let mut entry_index = 0usize;

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if name == "Ntry" {
                    entry = EntryAccumulator::default();
                }
                if name == "Amt" && path_ends_with(&path, &["Ntry"]) {
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"Ccy" {
                            entry.currency =
                                String::from_utf8_lossy(&attr.value).to_string();
                        }
                    }
                }
                path.push(name);
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().map_err(xml_error)?.trim().to_string();
                if text.is_empty() {
                    buf.clear();
                    continue;
                }
                if path_ends_with(&path, &["Stmt", "Id"]) {
                    stmt_id = text;
                } else if path_ends_with(&path, &["Ntry", "Amt"]) {
                    entry.amount = text;
                } else if path_ends_with(&path, &["Ntry", "CdtDbtInd"]) {
                    entry.cdt_dbt_ind = text;
                } else if path_ends_with(&path, &["Ntry", "Sts"]) {
                    entry.status = text;
                } else if path_ends_with(&path, &["Ntry", "NtryRef"]) {
                    entry.ntry_ref = text;
                } else if path_ends_with(&path, &["Ntry", "AcctSvcrRef"]) {
                    entry.acct_svcr_ref = text;
                } else if path_ends_with(&path, &["Refs", "MsgId"]) {
                    entry.msg_id = text;
                } else if path_ends_with(&path, &["Refs", "PmtInfId"]) {
                    entry.pmt_inf_id = text;
                } else if path_ends_with(&path, &["Refs", "EndToEndId"]) {
                    entry.end_to_end_id = text;
                } else if path_ends_with(&path, &["RmtInf", "Ustrd"]) {
                    entry.remittance = text;
                } else if path_ends_with(&path, &["RltdPties", "Dbtr", "Nm"]) {
                    entry.debtor_name = text;
                }
            }
            Ok(Event::End(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                path.pop();
                if name == "Ntry" {
                    entry_index += 1;
                    if entry.status == "BOOK" {
                        match entry.cdt_dbt_ind.as_str() {
                            "DBIT" if !entry.msg_id.is_empty() && !entry.pmt_inf_id.is_empty() => {
                                updates.push(StatusUpdate {
                                    msg_id: entry.msg_id.clone(),
                                    pmt_inf_id: entry.pmt_inf_id.clone(),
                                    end_to_end_id: entry.end_to_end_id.clone(),
                                    status: SepaStatus::Settled,
                                    reject_reason_code: String::new(),
                                    reject_reason_desc: String::new(),
                                });
                            }
                            "CRDT" => {
                                let amount_minor =
                                    match amount_to_minor(&entry.amount, &entry.currency) {
                                        Some(amount) => amount,
                                        None => {
                                            warn!(
                                                amount = %entry.amount,
                                                "Skipping credit with unparseable amount"
                                            );
                                            continue;
                                        }
                                    };
                                let statement_id = if !entry.acct_svcr_ref.is_empty() {
                                    entry.acct_svcr_ref.clone()
                                } else if !entry.ntry_ref.is_empty() {
                                    entry.ntry_ref.clone()
                                } else {
                                    format!("{stmt_id}:{entry_index}")
                                };
                                credits.push(CreditLine {
                                    statement_id,
                                    reference: entry.remittance.clone(),
                                    amount_minor,
                                    currency: entry.currency.clone(),
                                    debtor_name: (!entry.debtor_name.is_empty())
                                        .then(|| entry.debtor_name.clone()),
                                });
                            }
                            _ => {}
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(xml_error(e)),
        }
        buf.clear();
    }

    Ok((updates, credits))
}

fn xml_error(e: quick_xml::Error) -> RailError {
    RailError::Rejected {
        code: "MALFORMED_REPORT".into(),
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::FundingUpdateData;
    use crate::funding::FundingError;
    use crate::rails::sepa::store::{MemorySepaReportStore, MemorySepaStore};
    use crate::rails::sepa::SepaPayment;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    const PAIN002: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Document xmlns="urn:iso:std:iso:20022:tech:xsd:pain.002.001.03">
  <CstmrPmtStsRpt>
    <GrpHdr><MsgId>REPORT-1</MsgId><CreDtTm>2026-03-01T10:00:00Z</CreDtTm></GrpHdr>
    <OrgnlGrpInfAndSts>
      <OrgnlMsgId>MSG1</OrgnlMsgId>
      <OrgnlMsgNmId>pain.001.001.03</OrgnlMsgNmId>
      <GrpSts>ACSP</GrpSts>
    </OrgnlGrpInfAndSts>
    <OrgnlPmtInfAndSts>
      <OrgnlPmtInfId>PMT1</OrgnlPmtInfId>
      <PmtInfSts>ACSP</PmtInfSts>
      <TxInfAndSts>
        <OrgnlEndToEndId>E2E1</OrgnlEndToEndId>
        <TxSts>ACSP</TxSts>
      </TxInfAndSts>
      <TxInfAndSts>
        <OrgnlEndToEndId>E2E2</OrgnlEndToEndId>
        <TxSts>RJCT</TxSts>
        <StsRsnInf><Rsn><Cd>AM04</Cd></Rsn><AddtlInf>Insufficient funds</AddtlInf></StsRsnInf>
      </TxInfAndSts>
    </OrgnlPmtInfAndSts>
  </CstmrPmtStsRpt>
</Document>"#;

    const CAMT053: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Document xmlns="urn:iso:std:iso:20022:tech:xsd:camt.053.001.02">
  <BkToCstmrStmt>
    <GrpHdr><MsgId>STMT-MSG-1</MsgId><CreDtTm>2026-03-01T06:00:00Z</CreDtTm></GrpHdr>
    <Stmt>
      <Id>STMT-1</Id>
      <Ntry>
        <NtryRef>REF-CR-1</NtryRef>
        <Amt Ccy="EUR">10.00</Amt>
        <CdtDbtInd>CRDT</CdtDbtInd>
        <Sts>BOOK</Sts>
        <BookgDt><Dt>2026-03-01</Dt></BookgDt>
        <NtryDtls><TxDtls>
          <RltdPties><Dbtr><Nm>ACME GMBH</Nm></Dbtr></RltdPties>
          <RmtInf><Ustrd>W3G8-01JABCDE</Ustrd></RmtInf>
        </TxDtls></NtryDtls>
      </Ntry>
      <Ntry>
        <Amt Ccy="EUR">25.50</Amt>
        <CdtDbtInd>DBIT</CdtDbtInd>
        <Sts>BOOK</Sts>
        <BookgDt><Dt>2026-03-01</Dt></BookgDt>
        <NtryDtls><TxDtls>
          <Refs><MsgId>MSG1</MsgId><PmtInfId>PMT1</PmtInfId><EndToEndId>E2E1</EndToEndId></Refs>
        </TxDtls></NtryDtls>
      </Ntry>
      <Ntry>
        <Amt Ccy="EUR">99.99</Amt>
        <CdtDbtInd>CRDT</CdtDbtInd>
        <Sts>PDNG</Sts>
        <BookgDt><Dt>2026-03-01</Dt></BookgDt>
      </Ntry>
    </Stmt>
  </BkToCstmrStmt>
</Document>"#;

    #[derive(Default)]
    struct RecordingCallbacks {
        credits: StdMutex<Vec<InboundCreditEvent>>,
        updates: StdMutex<Vec<FundingUpdateData>>,
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
            _intent_id: &str,
            _reason: &str,
        ) -> Result<(), FundingError> {
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

    #[test]
    fn test_detect_report_type() {
        assert_eq!(detect_report_type(PAIN002.as_bytes()), "pain.002");
        assert_eq!(detect_report_type(CAMT053.as_bytes()), "camt.053");
        assert_eq!(detect_report_type(b"<xml/>"), "unknown");
    }

    #[test]
    fn test_parse_pain002() {
        let updates = parse_pain002(PAIN002.as_bytes()).unwrap();
        assert_eq!(updates.len(), 2);

        assert_eq!(updates[0].msg_id, "MSG1");
        assert_eq!(updates[0].pmt_inf_id, "PMT1");
        assert_eq!(updates[0].end_to_end_id, "E2E1");
        assert_eq!(updates[0].status, SepaStatus::Accepted);

        assert_eq!(updates[1].status, SepaStatus::Rejected);
        assert_eq!(updates[1].reject_reason_code, "AM04");
        assert_eq!(updates[1].reject_reason_desc, "Insufficient funds");
    }

    #[test]
    fn test_parse_camt053_splits_credits_and_debits() {
        let (updates, credits) = parse_camt053(CAMT053.as_bytes()).unwrap();

        // One booked DBIT with refs -> settled update
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].msg_id, "MSG1");
        assert_eq!(updates[0].status, SepaStatus::Settled);

        // One booked CRDT; the pending one is skipped
        assert_eq!(credits.len(), 1);
        assert_eq!(credits[0].statement_id, "REF-CR-1");
        assert_eq!(credits[0].reference, "W3G8-01JABCDE");
        assert_eq!(credits[0].amount_minor, 1000);
        assert_eq!(credits[0].currency, "EUR");
        assert_eq!(credits[0].debtor_name.as_deref(), Some("ACME GMBH"));
    }

    #[test]
    fn test_amount_to_minor() {
        assert_eq!(amount_to_minor("10.00", "EUR"), Some(1000));
        assert_eq!(amount_to_minor("0.01", "GBP"), Some(1));
        assert_eq!(amount_to_minor("1500", "JPY"), Some(1500));
        assert_eq!(amount_to_minor("10.005", "EUR"), None);
        assert_eq!(amount_to_minor("not-a-number", "EUR"), None);
    }

    fn sepa_payment(msg: &str, pmt: &str) -> SepaPayment {
        SepaPayment {
            id: format!("sepa-{msg}"),
            attempt_id: "att-1".into(),
            intent_id: "int-1".into(),
            msg_id: msg.to_string(),
            pmt_inf_id: pmt.to_string(),
            end_to_end_id: format!("E2E-{msg}"),
            iban: None,
            bic: None,
            amount_minor: 2550,
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
    async fn test_ingest_camt053_updates_and_forwards_credits() {
        let payments = Arc::new(MemorySepaStore::new());
        let reports = Arc::new(MemorySepaReportStore::new());
        let callbacks = Arc::new(RecordingCallbacks::default());

        payments.create(&sepa_payment("MSG1", "PMT1")).await.unwrap();

        let ingester = ReportIngester::new(payments.clone(), reports.clone());
        ingester.set_callbacks(callbacks.clone());

        let outcome = ingester.ingest(CAMT053.as_bytes()).await.unwrap();
        match outcome {
            IngestOutcome::Processed {
                payments_updated,
                credits_forwarded,
                ..
            } => {
                assert_eq!(payments_updated, 1);
                assert_eq!(credits_forwarded, 1);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let payment = payments
            .get_by_msg_and_pmt_inf("MSG1", "PMT1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payment.status, SepaStatus::Settled);
        assert!(payment.last_report_id.is_some());

        let credits = callbacks.credits.lock().unwrap();
        assert_eq!(credits.len(), 1);
        assert_eq!(credits[0].reference, "W3G8-01JABCDE");
        assert_eq!(credits[0].rail, "SEPA");
    }

    #[tokio::test]
    async fn test_ingest_same_file_twice_is_noop() {
        let payments = Arc::new(MemorySepaStore::new());
        let reports = Arc::new(MemorySepaReportStore::new());
        let callbacks = Arc::new(RecordingCallbacks::default());

        let ingester = ReportIngester::new(payments, reports);
        ingester.set_callbacks(callbacks.clone());

        ingester.ingest(CAMT053.as_bytes()).await.unwrap();
        let second = ingester.ingest(CAMT053.as_bytes()).await.unwrap();
        assert!(matches!(second, IngestOutcome::AlreadyProcessed));

        // Credit forwarded exactly once.
        assert_eq!(callbacks.credits.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ingest_pain002_rejection() {
        let payments = Arc::new(MemorySepaStore::new());
        let reports = Arc::new(MemorySepaReportStore::new());
        let callbacks = Arc::new(RecordingCallbacks::default());

        payments.create(&sepa_payment("MSG1", "PMT1")).await.unwrap();

        let ingester = ReportIngester::new(payments.clone(), reports);
        ingester.set_callbacks(callbacks.clone());
        ingester.ingest(PAIN002.as_bytes()).await.unwrap();

        let payment = payments
            .get_by_msg_and_pmt_inf("MSG1", "PMT1")
            .await
            .unwrap()
            .unwrap();
        // Both updates target the same payment: accept then... the RJCT
        // arrives after acceptance and still applies from ACCEPTED.
        assert_eq!(payment.status, SepaStatus::Rejected);
        assert_eq!(payment.reject_reason_code.as_deref(), Some("AM04"));

        // The rejection is pushed upward so the intent fails now
        // instead of idling until expiry.
        let updates = callbacks.updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].intent_id, "int-1");
        assert_eq!(updates[0].status, "failed");
        assert_eq!(updates[0].error_code.as_deref(), Some("AM04"));
        assert_eq!(updates[0].provider_ref.as_deref(), Some("MSG1:PMT1"));
    }

    #[tokio::test]
    async fn test_rejection_replay_pushes_nothing_upward() {
        let payments = Arc::new(MemorySepaStore::new());
        let callbacks = Arc::new(RecordingCallbacks::default());

        payments.create(&sepa_payment("MSG1", "PMT1")).await.unwrap();

        // Two archives so the file-hash dedup does not short-circuit;
        // the payment-level CAS is what must hold.
        let ingester_a = ReportIngester::new(
            payments.clone(),
            Arc::new(MemorySepaReportStore::new()),
        );
        ingester_a.set_callbacks(callbacks.clone());
        ingester_a.ingest(PAIN002.as_bytes()).await.unwrap();

        let ingester_b = ReportIngester::new(
            payments.clone(),
            Arc::new(MemorySepaReportStore::new()),
        );
        ingester_b.set_callbacks(callbacks.clone());
        ingester_b.ingest(PAIN002.as_bytes()).await.unwrap();

        assert_eq!(callbacks.updates.lock().unwrap().len(), 1);
    }
}
