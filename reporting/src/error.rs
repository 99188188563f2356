//! Error types for reporting

use thiserror::Error;

/// Result type for reporting operations
pub type Result<T> = std::result::Result<T, Error>;

/// Reporting errors
#[derive(Error, Debug)]
pub enum Error {
    /// Underlying ledger read failed
    #[error("Ledger error: {0}")]
    Ledger(#[from] donation_ledger::Error),

    /// Report export failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Bad report parameters
    #[error("Invalid range: {0}")]
    InvalidRange(String),
}
