//! Configuration for the donation ledger

use crate::types::Currency;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Optimistic retry configuration
    pub retry: RetryConfig,

    /// Intake admission rules
    pub admission: AdmissionConfig,

    /// Reconciliation sweep configuration
    pub reconciliation: ReconciliationConfig,

    /// Reporting cache configuration
    pub reporting: ReportingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/donation-ledger"),
            service_name: "donation-ledger".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            rocksdb: RocksDBConfig::default(),
            retry: RetryConfig::default(),
            admission: AdmissionConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            reporting: ReportingConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            max_background_jobs: 4,
            enable_statistics: false,
        }
    }
}

/// Optimistic retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts of a whole transition before surfacing `Conflict`
    pub max_attempts: u32,

    /// CAS attempts on a campaign's aggregate before surfacing `Conflict`
    pub aggregate_max_attempts: u32,

    /// First backoff delay (milliseconds)
    pub initial_backoff_ms: u64,

    /// Backoff ceiling (milliseconds)
    pub max_backoff_ms: u64,

    /// Growth factor between attempts
    pub backoff_multiplier: f64,

    /// Relative jitter, 0.1 = ±10%
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            aggregate_max_attempts: 64,
            initial_backoff_ms: 5,
            max_backoff_ms: 100,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

/// Intake admission rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Currencies accepted at intake
    pub accepted_currencies: Vec<Currency>,

    /// Optional per-donation ceiling
    pub max_donation: Option<Decimal>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            accepted_currencies: vec![
                Currency::USD,
                Currency::EUR,
                Currency::GBP,
                Currency::CAD,
                Currency::AUD,
            ],
            max_donation: None,
        }
    }
}

/// Reconciliation sweep configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    /// Interval between sweeps in the server (seconds)
    pub sweep_interval_secs: u64,

    /// Attempts per campaign before the sweep gives up on it
    pub max_attempts: u32,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 300,
            max_attempts: 5,
        }
    }
}

/// Reporting cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportingConfig {
    /// Maximum staleness of a cached report view (seconds)
    pub cache_ttl_secs: u64,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self { cache_ttl_secs: 30 }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("DONATION_LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(attempts) = std::env::var("DONATION_LEDGER_MAX_ATTEMPTS") {
            config.retry.max_attempts = attempts.parse().map_err(|e| {
                crate::Error::Config(format!("Invalid DONATION_LEDGER_MAX_ATTEMPTS: {}", e))
            })?;
        }

        if let Ok(interval) = std::env::var("DONATION_LEDGER_SWEEP_INTERVAL_SECS") {
            config.reconciliation.sweep_interval_secs = interval.parse().map_err(|e| {
                crate::Error::Config(format!(
                    "Invalid DONATION_LEDGER_SWEEP_INTERVAL_SECS: {}",
                    e
                ))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the ledger cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.retry.max_attempts == 0 || self.retry.aggregate_max_attempts == 0 {
            return Err(crate::Error::Config(
                "Retry attempts must be at least 1".to_string(),
            ));
        }
        if self.reconciliation.max_attempts == 0 {
            return Err(crate::Error::Config(
                "Reconciliation attempts must be at least 1".to_string(),
            ));
        }
        if self.admission.accepted_currencies.is_empty() {
            return Err(crate::Error::Config(
                "At least one accepted currency is required".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "donation-ledger");
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.admission.accepted_currencies.contains(&Currency::USD));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.toml");
        let mut config = Config::default();
        config.retry.max_attempts = 7;
        config.reporting.cache_ttl_secs = 5;
        std::fs::write(&path, toml::to_string(&config).unwrap()).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.retry.max_attempts, 7);
        assert_eq!(loaded.reporting.cache_ttl_secs, 5);
    }
}
