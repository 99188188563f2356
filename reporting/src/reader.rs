//! Read-only reporting over a ledger

use crate::cache::{Report, ViewCache, ViewKey};
use crate::views::{
    self, CampaignTotal, DailyTotal, DateRange, PaymentMethodTotal, Summary,
};
use crate::Result;
use donation_ledger::config::ReportingConfig;
use donation_ledger::{Donation, DonationStatus, Ledger};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

/// Cached report views over a shared `Ledger`
///
/// Views may lag ledger writes by up to the configured TTL. Campaign
/// `raised` and `donors_count` on the ledger remain the authoritative figures.
pub struct ReportingReader {
    ledger: Arc<Ledger>,
    cache: ViewCache,
}

impl ReportingReader {
    /// Reader with an explicit cache configuration
    pub fn new(ledger: Arc<Ledger>, config: ReportingConfig) -> Self {
        info!(cache_ttl_secs = config.cache_ttl_secs, "Reporting reader ready");
        Self {
            ledger,
            cache: ViewCache::new(Duration::from_secs(config.cache_ttl_secs)),
        }
    }

    /// Reader using the ledger's own reporting configuration
    pub fn from_ledger(ledger: Arc<Ledger>) -> Self {
        let config = ledger.config().reporting.clone();
        Self::new(ledger, config)
    }

    /// Completed totals per day, optionally limited to a creation range
    #[instrument(skip(self))]
    pub fn totals_by_day(&self, range: Option<DateRange>) -> Result<Report<Vec<DailyTotal>>> {
        self.cache.get_or_compute(ViewKey::TotalsByDay(range), || {
            let completed = self.completed(range)?;
            Ok(views::totals_by_day(&completed))
        })
    }

    /// Completed totals per campaign, largest first
    #[instrument(skip(self))]
    pub fn totals_by_campaign(&self) -> Result<Report<Vec<CampaignTotal>>> {
        self.cache.get_or_compute(ViewKey::TotalsByCampaign, || {
            let completed = self.completed(None)?;
            let campaigns = self.ledger.list_campaigns()?;
            Ok(views::totals_by_campaign(&completed, &campaigns))
        })
    }

    /// Completed totals per payment method
    #[instrument(skip(self))]
    pub fn totals_by_payment_method(&self) -> Result<Report<Vec<PaymentMethodTotal>>> {
        self.cache.get_or_compute(ViewKey::TotalsByPaymentMethod, || {
            let completed = self.completed(None)?;
            Ok(views::totals_by_payment_method(&completed))
        })
    }

    /// The `limit` campaigns with the highest completed totals
    #[instrument(skip(self))]
    pub fn top_campaigns(&self, limit: usize) -> Result<Report<Vec<CampaignTotal>>> {
        self.cache.get_or_compute(ViewKey::TopCampaigns(limit), || {
            let completed = self.completed(None)?;
            let campaigns = self.ledger.list_campaigns()?;
            Ok(views::top_campaigns(&completed, &campaigns, limit))
        })
    }

    /// Overview of donations created in `range`
    #[instrument(skip(self))]
    pub fn summary(&self, range: DateRange) -> Result<Report<Summary>> {
        self.cache.get_or_compute(ViewKey::Summary(range), || {
            let mut donations = Vec::new();
            for status in DonationStatus::ALL {
                donations.extend(self.ledger.donations().scan_status(
                    status,
                    Some(range.from),
                    Some(range.to),
                )?);
            }
            Ok(views::summary(&donations, range))
        })
    }

    /// Drop cached views so the next read recomputes
    pub fn invalidate(&self) {
        self.cache.invalidate();
    }

    /// Cache TTL
    pub fn cache_ttl(&self) -> Duration {
        self.cache.ttl()
    }

    fn completed(&self, range: Option<DateRange>) -> Result<Vec<Donation>> {
        Ok(self.ledger.donations().scan_status(
            DonationStatus::Completed,
            range.map(|r| r.from),
            range.map(|r| r.to),
        )?)
    }
}
