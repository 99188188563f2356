//! Error types for the donation ledger

use crate::admission::Rejection;
use crate::types::DonationStatus;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input (caller error, not retried)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Campaign rules refused the donation
    #[error("Rejected by policy: {0}")]
    RejectedByPolicy(Rejection),

    /// Record does not exist
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Record type
        kind: &'static str,
        /// Record ID
        id: String,
    },

    /// Illegal state edge
    #[error("Invalid transition {from} -> {to}: {reason}")]
    InvalidTransition {
        /// Stored status
        from: DonationStatus,
        /// Requested status
        to: DonationStatus,
        /// Why the edge was refused
        reason: String,
    },

    /// Optimistic retries exhausted; safe to retry the operation
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Stored aggregates disagree with their source records
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error classes exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller error, not retried
    ValidationError,
    /// Business-visible refusal, not retried
    RejectedByPolicy,
    /// Unknown record
    NotFound,
    /// Illegal state edge
    InvalidTransition,
    /// Transient contention
    Conflict,
    /// Store unreachable or corrupted
    InfrastructureFailure,
}

impl Error {
    /// Not-found helper for donations
    pub fn donation_not_found(id: impl ToString) -> Self {
        Error::NotFound {
            kind: "Donation",
            id: id.to_string(),
        }
    }

    /// Not-found helper for campaigns
    pub fn campaign_not_found(id: impl ToString) -> Self {
        Error::NotFound {
            kind: "Campaign",
            id: id.to_string(),
        }
    }

    /// Taxonomy class
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::ValidationError,
            Error::RejectedByPolicy(_) => ErrorKind::RejectedByPolicy,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::InvariantViolation(_)
            | Error::Storage(_)
            | Error::Serialization(_)
            | Error::Metrics(_)
            | Error::Config(_)
            | Error::Io(_) => ErrorKind::InfrastructureFailure,
        }
    }

    /// Whether the caller may retry the same request
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict(_) | Error::Storage(_) | Error::Io(_))
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
