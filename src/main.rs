//! finrail service binary
//!
//! Wires config -> logging -> database -> services -> background
//! workers. The HTTP surface lives in a separate gateway process; this
//! binary runs the orchestrator, the outbox drainer and the expiry
//! sweep.

use std::sync::Arc;

use anyhow::{Context, Result};

use finrail::config::AppConfig;
use finrail::db::Database;
use finrail::events::BroadcastBus;
use finrail::funding::{ExpiryWorker, ExpiryWorkerConfig, FundingService, PostgresFundingStore};
use finrail::ledger::{LedgerService, PostgresLedgerStore};
use finrail::logging;
use finrail::outbox::{DrainerConfig, OutboxDrainer, PostgresOutboxStore};
use finrail::rails::card::{CardAdapter, PostgresCardStore};
use finrail::rails::fps::{FpsAdapter, PostgresFpsStore};
use finrail::rails::openbanking::{OpenBankingAdapter, PostgresObStore};
use finrail::rails::sepa::{
    PostgresSepaReportStore, PostgresSepaStore, ReportIngester, SepaAdapter,
};

#[tokio::main]
async fn main() -> Result<()> {
    let env = std::env::var("FINRAIL_ENV").unwrap_or_else(|_| "dev".to_string());
    let config = AppConfig::load(&env).unwrap_or_else(|_| AppConfig::default());

    let _log_guard = logging::init_logging(&config);
    tracing::info!(env = %env, "Starting finrail");

    let postgres_url = config
        .postgres_url
        .clone()
        .context("postgres_url is required (config file or FINRAIL_POSTGRES_URL)")?;
    let db = Database::connect(&postgres_url).await?;
    let pool = db.pool().clone();

    // Ledger
    let ledger_store = Arc::new(PostgresLedgerStore::new(pool.clone()));
    let ledger = Arc::new(LedgerService::new(ledger_store, config.ledger.clone()));

    // Outbox + bus
    let outbox_store = Arc::new(PostgresOutboxStore::new(pool.clone()));
    let bus = Arc::new(BroadcastBus::default());

    // Orchestrator
    let funding_store = Arc::new(PostgresFundingStore::new(pool.clone()));
    let funding = Arc::new(FundingService::new(
        funding_store,
        ledger.clone(),
        outbox_store.clone(),
        config.funding.clone(),
    ));

    // Rail adapters, with the orchestrator capability injected after
    // construction.
    let fps_store = Arc::new(PostgresFpsStore::new(pool.clone()));
    let fps = Arc::new(FpsAdapter::new(config.fps.clone(), fps_store));
    fps.set_callbacks(funding.clone());
    funding.set_fps_provider(fps.clone());

    let sepa_store = Arc::new(PostgresSepaStore::new(pool.clone()));
    let sepa = Arc::new(SepaAdapter::new(config.sepa.clone(), sepa_store.clone()));
    sepa.set_callbacks(funding.clone());
    funding.set_sepa_provider(sepa.clone());

    let sepa_reports = Arc::new(PostgresSepaReportStore::new(pool.clone()));
    let report_ingester = Arc::new(ReportIngester::new(sepa_store, sepa_reports));
    report_ingester.set_callbacks(funding.clone());

    let ob_store = Arc::new(PostgresObStore::new(pool.clone()));
    let open_banking = Arc::new(OpenBankingAdapter::new(config.open_banking.clone(), ob_store));
    open_banking.set_callbacks(funding.clone());
    funding.set_open_banking_provider(open_banking.clone());

    let card_store = Arc::new(PostgresCardStore::new(pool.clone()));
    let cards = Arc::new(CardAdapter::new(config.cards.clone(), card_store));
    cards.set_callbacks(funding.clone());
    funding.set_card_provider(cards.clone());

    // Background workers
    let drainer = OutboxDrainer::new(
        outbox_store,
        bus,
        DrainerConfig {
            poll_interval: config.outbox.poll_interval(),
            batch_size: config.outbox.batch_size,
            base_retry_secs: config.outbox.base_retry_secs,
            max_retry_secs: config.outbox.max_retry_secs,
            shard: config.outbox.shard,
        },
    );
    tokio::spawn(async move { drainer.run().await });

    let expiry = ExpiryWorker::new(
        funding.clone(),
        ExpiryWorkerConfig {
            scan_interval: config.funding.expiry_scan_interval(),
            batch_size: 100,
        },
    );
    tokio::spawn(async move { expiry.run().await });

    tracing::info!("finrail running; Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    Ok(())
}
