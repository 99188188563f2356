//! Campaign Donation Ledger
//!
//! Records donations to fundraising campaigns and keeps each campaign's
//! `raised` and `donors_count` consistent under concurrent writes and admin
//! reversals.
//!
//! # Architecture
//!
//! - **Optimistic concurrency**: every write is a version-checked RocksDB
//!   transaction; contention turns into bounded retries, never a global lock
//! - **Explicit state machine**: one transition table, one writer of status
//!   and aggregates
//! - **Reconciliation**: aggregate failures after a status write flag the
//!   donation; a sweep recomputes the campaign from its donations
//!
//! # Invariants
//!
//! - `campaign.raised` = Σ amount of the campaign's completed donations
//! - `campaign.donors_count` = count of those donations
//! - Both hold at every quiescent point

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]

pub mod admission;
pub mod campaigns;
pub mod config;
pub mod donations;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod reconcile;
pub mod retry;
pub mod storage;
pub mod transition;
pub mod types;

// Re-exports
pub use admission::{admit, Admission, AdmissionPolicy, CampaignTarget, Rejection};
pub use config::Config;
pub use donations::{DonationFilter, Page, PageRequest};
pub use error::{Error, ErrorKind, Result};
pub use ledger::{AdminOverride, CampaignDetail, Intake, Ledger, PaymentConfirmation};
pub use reconcile::{AggregateCheck, AggregateSnapshot, ReconciliationReport, SweepSummary};
pub use storage::{ConditionalWrite, Storage};
pub use transition::{AggregateEffect, TransitionOutcome};
pub use types::{
    Actor, AggregateDelta, Campaign, CampaignId, CampaignStatus, CampaignUpdate, Currency,
    Donation, DonationId, DonationStatus, Donor, DonorKey, FollowUp, GuestDonor, NewCampaign,
    NewDonation, PaymentMethod, UserId,
};
