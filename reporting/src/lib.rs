//! Donation reporting
//!
//! Derived, read-only views over the donation ledger: totals per day,
//! campaign and payment method, top campaigns and period summaries. Views are
//! cached with a bounded staleness and grouped per currency.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]

pub mod cache;
pub mod error;
pub mod reader;
pub mod views;

pub use cache::{Report, ViewCache, ViewKey};
pub use error::{Error, Result};
pub use reader::ReportingReader;
pub use views::{
    CampaignTotal, CurrencyTotal, DailyTotal, DateRange, LargestDonation, PaymentMethodTotal,
    Summary,
};
