//! Expiry Worker
//!
//! Background sweep that expires intents whose TTL elapsed with no
//! progress. Safe to run in every process: each expiry is a per-intent
//! CAS, so concurrent sweepers cannot double-expire.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info};

use super::service::FundingService;

#[derive(Debug, Clone)]
pub struct ExpiryWorkerConfig {
    /// How often to scan for stale intents
    pub scan_interval: Duration,
    /// Maximum intents to expire per scan
    pub batch_size: i64,
}

impl Default for ExpiryWorkerConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(60),
            batch_size: 100,
        }
    }
}

pub struct ExpiryWorker {
    service: Arc<FundingService>,
    config: ExpiryWorkerConfig,
}

impl ExpiryWorker {
    pub fn new(service: Arc<FundingService>, config: ExpiryWorkerConfig) -> Self {
        Self { service, config }
    }

    pub fn with_defaults(service: Arc<FundingService>) -> Self {
        Self::new(service, ExpiryWorkerConfig::default())
    }

    /// Run the sweep loop until the process shuts down.
    pub async fn run(&self) {
        info!(
            scan_interval_secs = self.config.scan_interval.as_secs(),
            batch_size = self.config.batch_size,
            "Starting intent expiry worker"
        );

        loop {
            match self
                .service
                .expire_stale_intents(Utc::now(), self.config.batch_size)
                .await
            {
                Ok(0) => debug!("No stale intents found"),
                Ok(n) => info!(count = n, "Expired stale intents"),
                Err(e) => error!(error = %e, "Expiry scan failed"),
            }

            tokio::time::sleep(self.config.scan_interval).await;
        }
    }
}
