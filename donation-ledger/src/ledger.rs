//! Ledger facade
//!
//! Wires storage, stores, the admission gate, the transition engine and the
//! reconciler into the API the request handlers call.
//!
//! # Example
//!
//! ```no_run
//! use donation_ledger::{Actor, Config, Currency, Donor, Ledger, NewDonation};
//! use rust_decimal::Decimal;
//!
//! #[tokio::main]
//! async fn main() -> donation_ledger::Result<()> {
//!     let ledger = Ledger::open(Config::default())?;
//!
//!     let intake = ledger
//!         .submit_donation(NewDonation::new(
//!             Decimal::new(2500, 2),
//!             Currency::USD,
//!             Donor::user("user-42"),
//!             None,
//!         ))
//!         .await?
//!         .into_result()?;
//!
//!     ledger
//!         .transition(intake.id, donation_ledger::DonationStatus::Completed, Actor::System)
//!         .await?;
//!     Ok(())
//! }
//! ```

use crate::{
    admission::{admit, Admission, AdmissionPolicy, CampaignTarget, Rejection},
    campaigns::CampaignStore,
    donations::{DonationFilter, DonationStore, Page, PageRequest},
    metrics::Metrics,
    reconcile::{AggregateCheck, ReconciliationReport, Reconciler, SweepSummary},
    retry::RetryPolicy,
    storage::StorageStats,
    transition::{TransitionEngine, TransitionOutcome},
    types::{
        Actor, Campaign, CampaignId, CampaignUpdate, Donation, DonationId, DonationStatus,
        DonorKey, FollowUp, NewCampaign, NewDonation,
    },
    Config, Error, Result, Storage,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Intake result
#[derive(Debug, Clone, PartialEq)]
pub enum Intake {
    /// Donation recorded
    Accepted(Donation),
    /// Refused by campaign rules; nothing was stored
    Rejected(Rejection),
}

impl Intake {
    /// Whether the donation was recorded
    pub fn is_accepted(&self) -> bool {
        matches!(self, Intake::Accepted(_))
    }

    /// Turn a rejection into [`Error::RejectedByPolicy`]
    pub fn into_result(self) -> Result<Donation> {
        match self {
            Intake::Accepted(donation) => Ok(donation),
            Intake::Rejected(rejection) => Err(Error::RejectedByPolicy(rejection)),
        }
    }
}

/// Payment gateway callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentConfirmation {
    /// Donation
    pub donation_id: DonationId,
    /// `completed` or `failed`
    pub status: DonationStatus,
    /// Gateway transaction reference
    pub transaction_id: Option<String>,
}

/// Administrator status override
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminOverride {
    /// Donation
    pub donation_id: DonationId,
    /// Target status
    pub status: DonationStatus,
    /// Administrator
    pub admin_id: String,
    /// Reason
    pub reason: Option<String>,
    /// Notes appended to the donation
    pub notes: Option<String>,
}

/// Campaign with its derived figures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignDetail {
    /// Stored campaign
    pub campaign: Campaign,
    /// raised / goal × 100
    pub funding_percentage: Decimal,
    /// goal - raised, floored at zero
    pub remaining: Decimal,
    /// Whether intake would accept donations now
    pub accepting_donations: bool,
}

/// Donation ledger
pub struct Ledger {
    storage: Arc<Storage>,
    donations: Arc<DonationStore>,
    campaigns: Arc<CampaignStore>,
    engine: TransitionEngine,
    reconciler: Reconciler,
    policy: AdmissionPolicy,
    metrics: Arc<Metrics>,
    config: Config,
}

impl Ledger {
    /// Open ledger with configuration
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;

        let storage = Arc::new(Storage::open(&config)?);
        let metrics = Arc::new(Metrics::new()?);
        let retry = RetryPolicy::new(config.retry.clone());
        let donations = Arc::new(DonationStore::new(storage.clone(), retry.clone()));
        let campaigns = Arc::new(CampaignStore::new(storage.clone(), retry.clone()));
        let engine = TransitionEngine::new(
            storage.clone(),
            donations.clone(),
            campaigns.clone(),
            retry.clone(),
            metrics.clone(),
        );
        let reconciler = Reconciler::new(
            storage.clone(),
            donations.clone(),
            campaigns.clone(),
            metrics.clone(),
            retry,
            config.reconciliation.max_attempts,
        );
        let policy = AdmissionPolicy::new(&config.admission);

        info!(
            service = %config.service_name,
            version = %config.service_version,
            "Donation ledger opened"
        );

        Ok(Self {
            storage,
            donations,
            campaigns,
            engine,
            reconciler,
            policy,
            metrics,
            config,
        })
    }

    // ----- campaigns -----

    /// Create a campaign
    pub fn create_campaign(&self, new: NewCampaign) -> Result<Campaign> {
        self.campaigns.create(new)
    }

    /// Update plain campaign fields
    pub fn update_campaign(&self, id: CampaignId, update: &CampaignUpdate) -> Result<Campaign> {
        self.campaigns.update(id, update)
    }

    /// Delete a campaign
    pub fn delete_campaign(&self, id: CampaignId) -> Result<()> {
        self.campaigns.delete(id)
    }

    /// Get a campaign
    pub fn get_campaign(&self, id: CampaignId) -> Result<Campaign> {
        self.campaigns.require(id)
    }

    /// All campaigns
    pub fn list_campaigns(&self) -> Result<Vec<Campaign>> {
        self.campaigns.list()
    }

    /// Campaign with funding percentage and admission state
    pub fn campaign_detail(&self, id: CampaignId) -> Result<CampaignDetail> {
        let campaign = self.campaigns.require(id)?;
        let accepting_donations = admit(
            CampaignTarget::Campaign(&campaign),
            campaign.minimum_donation.max(Decimal::ONE),
            campaign.currency,
            Utc::now(),
            &self.policy,
        )
        .is_admitted();

        Ok(CampaignDetail {
            funding_percentage: campaign.funding_percentage(),
            remaining: campaign.remaining(),
            accepting_donations,
            campaign,
        })
    }

    // ----- intake -----

    /// Validate, admit and record a donation
    pub async fn submit_donation(&self, new: NewDonation) -> Result<Intake> {
        self.submit_donation_at(new, Utc::now()).await
    }

    /// [`Ledger::submit_donation`] evaluated at `now`
    pub async fn submit_donation_at(
        &self,
        mut new: NewDonation,
        now: DateTime<Utc>,
    ) -> Result<Intake> {
        new.validate()?;

        let campaign = match new.campaign_id {
            Some(id) => self.campaigns.get(id)?,
            None => None,
        };
        let target = match (new.campaign_id, campaign.as_ref()) {
            (None, _) => CampaignTarget::GeneralFund,
            (Some(id), None) => CampaignTarget::Missing(id),
            (Some(_), Some(campaign)) => CampaignTarget::Campaign(campaign),
        };

        match admit(target, new.amount, new.currency, now, &self.policy) {
            Admission::Admitted => {}
            Admission::Rejected(Rejection::CampaignNotFound(id)) => {
                self.metrics.record_intake("not_found");
                return Err(Error::campaign_not_found(id));
            }
            Admission::Rejected(rejection) => {
                info!(
                    campaign_id = ?new.campaign_id,
                    amount = %new.amount,
                    reason = %rejection,
                    "Donation rejected"
                );
                self.metrics.record_intake("rejected");
                return Ok(Intake::Rejected(rejection));
            }
        }

        let donation = match new.confirmed_transaction_id.take() {
            Some(transaction_id) => {
                let pending = new.into_donation(DonationId::new(), now);
                self.engine
                    .record_confirmed(pending, transaction_id)
                    .await?
                    .donation
            }
            None => self.donations.create_at(new, now)?,
        };
        self.metrics.record_intake("accepted");

        Ok(Intake::Accepted(donation))
    }

    // ----- transitions -----

    /// Apply a status transition
    pub async fn transition(
        &self,
        id: DonationId,
        status: DonationStatus,
        actor: Actor,
    ) -> Result<TransitionOutcome> {
        self.engine.transition(id, status, actor).await
    }

    /// Payment gateway callback; idempotent under duplicate delivery
    pub async fn confirm_payment(
        &self,
        confirmation: PaymentConfirmation,
    ) -> Result<TransitionOutcome> {
        if !matches!(
            confirmation.status,
            DonationStatus::Completed | DonationStatus::Failed
        ) {
            return Err(Error::Validation(format!(
                "Payment confirmation cannot set status {}",
                confirmation.status
            )));
        }
        self.engine
            .transition(
                confirmation.donation_id,
                confirmation.status,
                Actor::PaymentGateway {
                    transaction_id: confirmation.transaction_id,
                },
            )
            .await
    }

    /// Administrator override
    pub async fn admin_override(&self, request: AdminOverride) -> Result<TransitionOutcome> {
        self.engine
            .transition(
                request.donation_id,
                request.status,
                Actor::Admin {
                    admin_id: request.admin_id,
                    reason: request.reason,
                    notes: request.notes,
                },
            )
            .await
    }

    // ----- annotations -----

    /// Record a sent receipt
    pub async fn record_receipt(
        &self,
        id: DonationId,
        receipt_number: impl Into<String>,
    ) -> Result<Donation> {
        self.engine.record_receipt(id, receipt_number).await
    }

    /// Record a sent thank-you
    pub async fn record_thank_you(&self, id: DonationId) -> Result<Donation> {
        self.engine.record_thank_you(id).await
    }

    /// Append an admin note
    pub async fn add_admin_note(
        &self,
        id: DonationId,
        author: impl Into<String>,
        note: impl Into<String>,
    ) -> Result<Donation> {
        self.engine.add_admin_note(id, author, note).await
    }

    /// Replace follow-up tracking
    pub async fn set_follow_up(&self, id: DonationId, follow_up: FollowUp) -> Result<Donation> {
        self.engine.set_follow_up(id, follow_up).await
    }

    // ----- reads -----

    /// Get a donation
    pub fn get_donation(&self, id: DonationId) -> Result<Donation> {
        self.donations.get(id)
    }

    /// Admin listing
    pub fn list_donations(
        &self,
        filter: &DonationFilter,
        page: PageRequest,
    ) -> Result<Page<Donation>> {
        self.donations.query(filter, page)
    }

    /// Donations of one donor
    pub fn donations_by_donor(&self, donor: &DonorKey) -> Result<Vec<Donation>> {
        self.donations.find_by_donor(donor)
    }

    /// Donations of one campaign
    pub fn donations_by_campaign(
        &self,
        campaign_id: CampaignId,
        status: Option<DonationStatus>,
    ) -> Result<Vec<Donation>> {
        self.donations.find_by_campaign(campaign_id, status)
    }

    // ----- reconciliation -----

    /// Recompute one campaign's aggregates
    pub fn reconcile_campaign(&self, id: CampaignId) -> Result<ReconciliationReport> {
        self.reconciler.reconcile_campaign(id)
    }

    /// Reconcile every campaign with flagged donations
    pub fn reconcile_flagged(&self) -> Result<SweepSummary> {
        self.reconciler.reconcile_flagged()
    }

    /// Compare a campaign's stored aggregates with its donations
    pub fn check_aggregate_invariant(&self, id: CampaignId) -> Result<AggregateCheck> {
        self.reconciler.check_campaign(id)
    }

    // ----- accessors -----

    /// Donation store
    pub fn donations(&self) -> &DonationStore {
        &self.donations
    }

    /// Campaign store
    pub fn campaigns(&self) -> &CampaignStore {
        &self.campaigns
    }

    /// Metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Approximate record counts
    pub fn storage_stats(&self) -> Result<StorageStats> {
        self.storage.stats()
    }
}
