//! Aggregate reconciliation
//!
//! Recomputes a campaign's `raised` and `donors_count` from its completed
//! donations. Every write that changes a campaign's completed set or sets a
//! reconciliation flag on one of its donations also bumps the campaign version,
//! so the recompute is written back, together with clearing the flags it read,
//! in one transaction conditional on that version.

use crate::{
    campaigns::CampaignStore,
    donations::DonationStore,
    error::{Error, Result},
    metrics::Metrics,
    retry::RetryPolicy,
    storage::{commit, ConditionalWrite, Storage},
    types::{AggregateDelta, Campaign, CampaignId, Donation, DonationId, DonationStatus},
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Campaign aggregate values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    /// Σ amount
    pub raised: Decimal,
    /// Count
    pub donors_count: u64,
}

impl AggregateSnapshot {
    fn of(campaign: &Campaign) -> Self {
        Self {
            raised: campaign.raised,
            donors_count: campaign.donors_count,
        }
    }

    /// Recompute from donation records
    pub fn from_donations<'a>(
        campaign_id: CampaignId,
        donations: impl IntoIterator<Item = &'a Donation>,
    ) -> Self {
        donations
            .into_iter()
            .filter(|d| d.counts_toward(campaign_id))
            .fold(
                Self {
                    raised: Decimal::ZERO,
                    donors_count: 0,
                },
                |acc, d| Self {
                    raised: acc.raised + d.amount,
                    donors_count: acc.donors_count + 1,
                },
            )
    }
}

/// Stored versus recomputed aggregates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateCheck {
    /// Campaign
    pub campaign_id: CampaignId,
    /// As stored on the campaign
    pub stored: AggregateSnapshot,
    /// As recomputed from donations
    pub computed: AggregateSnapshot,
}

impl AggregateCheck {
    /// Stored equals recomputed
    pub fn is_consistent(&self) -> bool {
        self.stored == self.computed
    }
}

/// Result of reconciling one campaign
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    /// Campaign
    pub campaign_id: CampaignId,
    /// Aggregates before the sweep
    pub before: AggregateSnapshot,
    /// Aggregates after the sweep
    pub after: AggregateSnapshot,
    /// after - before
    pub drift: AggregateDelta,
    /// Donations whose reconciliation flag was cleared
    pub cleared_flags: usize,
}

impl ReconciliationReport {
    /// Whether the stored aggregates were wrong
    pub fn corrected(&self) -> bool {
        !self.drift.is_zero()
    }
}

/// Result of sweeping every flagged donation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepSummary {
    /// Per-campaign reports
    pub reports: Vec<ReconciliationReport>,
    /// General-fund donations unflagged (no aggregate to fix)
    pub general_fund_cleared: usize,
    /// Donations whose campaign no longer exists; left flagged
    pub orphaned: Vec<DonationId>,
    /// Campaigns the sweep could not settle
    pub failed: Vec<CampaignId>,
}

impl SweepSummary {
    /// Campaigns whose aggregates changed
    pub fn corrected(&self) -> usize {
        self.reports.iter().filter(|r| r.corrected()).count()
    }
}

/// What a reconciliation read: the campaign version, both aggregates and
/// the campaign's flagged donations
struct Plan {
    campaign_version: u64,
    before: AggregateSnapshot,
    after: AggregateSnapshot,
    flagged: Vec<Donation>,
}

/// Reconciliation sweep
pub struct Reconciler {
    storage: Arc<Storage>,
    donations: Arc<DonationStore>,
    campaigns: Arc<CampaignStore>,
    metrics: Arc<Metrics>,
    retry: RetryPolicy,
    max_attempts: u32,
}

impl Reconciler {
    /// Create new reconciler
    pub(crate) fn new(
        storage: Arc<Storage>,
        donations: Arc<DonationStore>,
        campaigns: Arc<CampaignStore>,
        metrics: Arc<Metrics>,
        retry: RetryPolicy,
        max_attempts: u32,
    ) -> Self {
        Self {
            storage,
            donations,
            campaigns,
            metrics,
            retry,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Compare stored aggregates with the donations, without writing
    pub fn check_campaign(&self, campaign_id: CampaignId) -> Result<AggregateCheck> {
        let campaign = self.campaigns.require(campaign_id)?;
        let completed = self
            .donations
            .find_by_campaign(campaign_id, Some(DonationStatus::Completed))?;
        Ok(AggregateCheck {
            campaign_id,
            stored: AggregateSnapshot::of(&campaign),
            computed: AggregateSnapshot::from_donations(campaign_id, &completed),
        })
    }

    /// Recompute one campaign's aggregates and clear its donations' flags
    pub fn reconcile_campaign(&self, campaign_id: CampaignId) -> Result<ReconciliationReport> {
        for attempt in 1..=self.max_attempts {
            let plan = self.plan(campaign_id)?;
            match self.apply(campaign_id, &plan)? {
                ConditionalWrite::Written(cleared_flags) => {
                    let (before, after) = (plan.before, plan.after);
                    if before != after {
                        warn!(
                            campaign_id = %campaign_id,
                            raised_before = %before.raised,
                            raised_after = %after.raised,
                            donors_before = before.donors_count,
                            donors_after = after.donors_count,
                            "Corrected campaign aggregate drift"
                        );
                        self.metrics.record_drift_correction();
                    }
                    return Ok(ReconciliationReport {
                        campaign_id,
                        before,
                        after,
                        drift: AggregateDelta {
                            raised: after.raised - before.raised,
                            donors: after.donors_count as i64 - before.donors_count as i64,
                        },
                        cleared_flags,
                    });
                }
                ConditionalWrite::Stale => {
                    debug!(campaign_id = %campaign_id, attempt, "Campaign changed during reconciliation, retrying");
                    if attempt < self.max_attempts {
                        std::thread::sleep(self.retry.delay_for(attempt));
                    }
                }
            }
        }

        Err(Error::Conflict(format!(
            "Campaign {} kept changing during reconciliation ({} attempts)",
            campaign_id, self.max_attempts
        )))
    }

    /// Reconcile every campaign referenced by a flagged donation
    pub fn reconcile_flagged(&self) -> Result<SweepSummary> {
        let flagged = self.donations.flagged_for_reconciliation()?;
        let mut summary = SweepSummary::default();
        if flagged.is_empty() {
            return Ok(summary);
        }

        let mut by_campaign: BTreeMap<CampaignId, Vec<DonationId>> = BTreeMap::new();
        let mut general_fund = Vec::new();
        for donation in flagged {
            match donation.campaign_id {
                Some(campaign_id) => by_campaign.entry(campaign_id).or_default().push(donation.id),
                None => general_fund.push(donation),
            }
        }

        for donation in &general_fund {
            if self.clear_flag(donation)? {
                summary.general_fund_cleared += 1;
            }
        }

        for (campaign_id, donation_ids) in by_campaign {
            match self.reconcile_campaign(campaign_id) {
                Ok(report) => summary.reports.push(report),
                Err(Error::NotFound { .. }) => {
                    warn!(
                        campaign_id = %campaign_id,
                        donations = donation_ids.len(),
                        "Flagged donations reference a deleted campaign"
                    );
                    summary.orphaned.extend(donation_ids);
                }
                Err(e) => {
                    error!(campaign_id = %campaign_id, error = %e, "Reconciliation failed");
                    summary.failed.push(campaign_id);
                }
            }
        }

        info!(
            campaigns = summary.reports.len(),
            corrected = summary.corrected(),
            orphaned = summary.orphaned.len(),
            failed = summary.failed.len(),
            "Reconciliation sweep finished"
        );
        Ok(summary)
    }

    fn plan(&self, campaign_id: CampaignId) -> Result<Plan> {
        // Campaign first: anything committed after this read moves its version
        let campaign = self.campaigns.require(campaign_id)?;
        let completed = self
            .donations
            .find_by_campaign(campaign_id, Some(DonationStatus::Completed))?;
        let flagged = self
            .donations
            .flagged_for_reconciliation()?
            .into_iter()
            .filter(|d| d.campaign_id == Some(campaign_id))
            .collect();

        Ok(Plan {
            campaign_version: campaign.version,
            before: AggregateSnapshot::of(&campaign),
            after: AggregateSnapshot::from_donations(campaign_id, &completed),
            flagged,
        })
    }

    /// Write `plan` if neither the campaign nor any flagged donation it read
    /// has moved; carries the number of flags cleared
    fn apply(&self, campaign_id: CampaignId, plan: &Plan) -> Result<ConditionalWrite<usize>> {
        let txn = self.storage.transaction();
        let reset = self.campaigns.stage_reset(
            &txn,
            campaign_id,
            plan.campaign_version,
            plan.after.raised,
            plan.after.donors_count,
        )?;
        if reset.is_none() {
            return Ok(ConditionalWrite::Stale);
        }

        let now = Utc::now();
        for seen in &plan.flagged {
            let mut next = seen.clone();
            next.needs_reconciliation = false;
            next.updated_at = now;
            if self.donations.stage_update(&txn, &next, seen.version)?.is_none() {
                return Ok(ConditionalWrite::Stale);
            }
        }

        Ok(match commit(txn)? {
            ConditionalWrite::Written(()) => ConditionalWrite::Written(plan.flagged.len()),
            ConditionalWrite::Stale => ConditionalWrite::Stale,
        })
    }

    /// Clear the flag on a general-fund donation; no aggregate depends on it
    fn clear_flag(&self, seen: &Donation) -> Result<bool> {
        let mut current = seen.clone();
        for attempt in 1..=self.max_attempts {
            if !current.needs_reconciliation {
                return Ok(false);
            }
            let mut next = current.clone();
            next.needs_reconciliation = false;
            next.updated_at = Utc::now();
            match self.donations.update_if_version(&next, current.version)? {
                ConditionalWrite::Written(_) => return Ok(true),
                ConditionalWrite::Stale => {
                    std::thread::sleep(self.retry.delay_for(attempt));
                    current = self.donations.get(seen.id)?;
                }
            }
        }
        Err(Error::Conflict(format!(
            "Could not clear reconciliation flag on donation {}",
            seen.id
        )))
    }
}
