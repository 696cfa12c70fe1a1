use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use anyhow::{Context, Result};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// PostgreSQL connection URL
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default)]
    pub funding: FundingConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub outbox: OutboxConfig,
    #[serde(default)]
    pub fps: RailConfig,
    #[serde(default)]
    pub sepa: SepaConfig,
    #[serde(default)]
    pub open_banking: OpenBankingConfig,
    #[serde(default)]
    pub cards: CardConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FundingConfig {
    /// Intent TTL in seconds when the customer never completes the flow
    pub default_expiry_secs: u64,
    /// How often the expiry sweep runs, in seconds
    pub expiry_scan_interval_secs: u64,
    /// Platform collection account handed out with SEPA bank details
    pub collection_iban: String,
    pub collection_bic: String,
    /// Platform collection account handed out with FPS bank details
    pub collection_sort_code: String,
    pub collection_account_number: String,
}

impl Default for FundingConfig {
    fn default() -> Self {
        Self {
            default_expiry_secs: 24 * 60 * 60,
            expiry_scan_interval_secs: 60,
            collection_iban: "GB82WEST12345698765432".to_string(),
            collection_bic: "WESTGB2L".to_string(),
            collection_sort_code: "123456".to_string(),
            collection_account_number: "98765432".to_string(),
        }
    }
}

impl FundingConfig {
    pub fn default_expiry(&self) -> Duration {
        Duration::from_secs(self.default_expiry_secs)
    }

    pub fn expiry_scan_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_scan_interval_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LedgerConfig {
    /// Posting retries on serialization failure
    pub max_post_attempts: u32,
    /// Base backoff between posting retries, in milliseconds
    pub base_backoff_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_post_attempts: 3,
            base_backoff_ms: 10,
        }
    }
}

impl LedgerConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OutboxConfig {
    pub poll_interval_secs: u64,
    pub batch_size: i64,
    pub base_retry_secs: u64,
    pub max_retry_secs: u64,
    /// Advisory-lock shard this drainer owns
    pub shard: i64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 1,
            batch_size: 100,
            base_retry_secs: 2,
            max_retry_secs: 300,
            shard: 0,
        }
    }
}

impl OutboxConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Shared shape for rail provider endpoints (FPS uses it as-is).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RailConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout_secs: u64,
    pub webhook_path: String,
}

impl Default for RailConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9401".to_string(),
            api_key: String::new(),
            timeout_secs: 30,
            webhook_path: "/webhooks/fps".to_string(),
        }
    }
}

impl RailConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SepaConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout_secs: u64,
    pub webhook_path: String,
    /// How often settlement reports are polled, in seconds
    pub report_poll_interval_secs: u64,
}

impl Default for SepaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9402".to_string(),
            api_key: String::new(),
            timeout_secs: 30,
            webhook_path: "/webhooks/sepa".to_string(),
            report_poll_interval_secs: 300,
        }
    }
}

impl SepaConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn report_poll_interval(&self) -> Duration {
        Duration::from_secs(self.report_poll_interval_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenBankingConfig {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_url: String,
    pub timeout_secs: u64,
}

impl Default for OpenBankingConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9403".to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            redirect_url: "http://localhost:8080/funding/return".to_string(),
            timeout_secs: 30,
        }
    }
}

impl OpenBankingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CardConfig {
    pub base_url: String,
    pub merchant_id: String,
    pub api_key: String,
    pub timeout_secs: u64,
    pub auto_capture: bool,
}

impl Default for CardConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9404".to_string(),
            merchant_id: String::new(),
            api_key: String::new(),
            timeout_secs: 30,
            auto_capture: true,
        }
    }
}

impl CardConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl AppConfig {
    /// Load config from YAML file based on environment
    pub fn load(env: &str) -> Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        let mut config: Self =
            serde_yaml::from_str(&content).context("Failed to parse config yaml")?;

        config.apply_env_overrides();

        Ok(config)
    }

    /// Apply environment variable overrides
    ///
    /// Environment variables take precedence over YAML config.
    ///
    /// Supported overrides:
    /// - FINRAIL_POSTGRES_URL: PostgreSQL connection URL
    /// - FINRAIL_LOG_LEVEL: Log level (trace/debug/info/warn/error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("FINRAIL_POSTGRES_URL") {
            tracing::info!("Config override: postgres_url = [REDACTED] (from FINRAIL_POSTGRES_URL)");
            self.postgres_url = Some(url);
        }

        if let Ok(level) = std::env::var("FINRAIL_LOG_LEVEL") {
            tracing::info!("Config override: log_level = {} (from FINRAIL_LOG_LEVEL)", level);
            self.log_level = level;
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "./logs".to_string(),
            log_file: "finrail.log".to_string(),
            use_json: false,
            rotation: "daily".to_string(),
            postgres_url: None,
            funding: FundingConfig::default(),
            ledger: LedgerConfig::default(),
            outbox: OutboxConfig::default(),
            fps: RailConfig::default(),
            sepa: SepaConfig::default(),
            open_banking: OpenBankingConfig::default(),
            cards: CardConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.funding.default_expiry_secs, 86400);
        assert_eq!(config.ledger.max_post_attempts, 3);
        assert_eq!(config.ledger.base_backoff_ms, 10);
        assert_eq!(config.fps.timeout_secs, 30);
        assert_eq!(config.sepa.report_poll_interval_secs, 300);
        assert!(config.cards.auto_capture);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
log_level: debug
log_dir: ./logs
log_file: test.log
use_json: true
rotation: hourly
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.outbox.batch_size, 100);
        assert_eq!(config.funding.expiry_scan_interval_secs, 60);
    }
}
