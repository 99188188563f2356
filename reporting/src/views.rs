//! Report views
//!
//! Pure aggregations over donation records. Totals are grouped per currency;
//! nothing is converted. These figures are derived and may lag the campaign
//! aggregates, which stay authoritative.

use crate::{Error, Result};
use chrono::{DateTime, NaiveDate, Utc};
use donation_ledger::{Campaign, CampaignId, Currency, Donation, DonationId, DonationStatus, PaymentMethod};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Half-open creation-time range `[from, to)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    /// Inclusive start
    pub from: DateTime<Utc>,
    /// Exclusive end
    pub to: DateTime<Utc>,
}

impl DateRange {
    /// Create a range, rejecting `from > to`
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Self> {
        if from > to {
            return Err(Error::InvalidRange(format!(
                "range start {} is after its end {}",
                from, to
            )));
        }
        Ok(Self { from, to })
    }

    /// The `days` days up to `now`
    pub fn last_days(now: DateTime<Utc>, days: i64) -> Result<Self> {
        Self::new(now - chrono::Duration::days(days), now)
    }

    /// Whether `at` falls inside
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.from && at < self.to
    }
}

/// Amount and count in one currency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrencyTotal {
    /// Currency
    pub currency: Currency,
    /// Σ amount
    pub total: Decimal,
    /// Donations counted
    pub count: u64,
}

/// Completed donations made on one day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyTotal {
    /// UTC day of creation
    pub day: NaiveDate,
    /// Currency
    pub currency: Currency,
    /// Σ amount
    pub total: Decimal,
    /// Donations counted
    pub count: u64,
}

/// Completed donations of one campaign
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignTotal {
    /// Campaign
    pub campaign_id: CampaignId,
    /// Title, if the campaign still exists
    pub title: Option<String>,
    /// Currency
    pub currency: Currency,
    /// Σ amount
    pub total: Decimal,
    /// Donations counted
    pub count: u64,
    /// total / goal × 100, when the goal is known
    pub funding_percentage: Option<Decimal>,
}

/// Completed donations per payment method
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMethodTotal {
    /// Payment method
    pub method: PaymentMethod,
    /// Currency
    pub currency: Currency,
    /// Σ amount
    pub total: Decimal,
    /// Donations counted
    pub count: u64,
}

/// Largest completed donation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LargestDonation {
    /// Donation
    pub donation_id: DonationId,
    /// Amount
    pub amount: Decimal,
    /// Currency
    pub currency: Currency,
}

/// Overview of a period
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    /// Period
    pub range: DateRange,
    /// Donations per status
    pub counts_by_status: BTreeMap<DonationStatus, u64>,
    /// Completed totals per currency
    pub completed: Vec<CurrencyTotal>,
    /// Mean completed amount per currency
    pub average: BTreeMap<Currency, Decimal>,
    /// Largest completed donation (compared within its own currency only)
    pub largest: Vec<LargestDonation>,
    /// Distinct identified donors among completed donations
    pub distinct_donors: u64,
}

#[derive(Default)]
struct Bucket {
    total: Decimal,
    count: u64,
}

impl Bucket {
    fn add(&mut self, amount: Decimal) {
        self.total += amount;
        self.count += 1;
    }
}

fn completed(donations: &[Donation]) -> impl Iterator<Item = &Donation> {
    donations
        .iter()
        .filter(|d| d.status == DonationStatus::Completed)
}

/// Completed totals per creation day, oldest day first
pub fn totals_by_day(donations: &[Donation]) -> Vec<DailyTotal> {
    let mut buckets: BTreeMap<(NaiveDate, Currency), Bucket> = BTreeMap::new();
    for donation in completed(donations) {
        buckets
            .entry((donation.created_at.date_naive(), donation.currency))
            .or_default()
            .add(donation.amount);
    }
    buckets
        .into_iter()
        .map(|((day, currency), bucket)| DailyTotal {
            day,
            currency,
            total: bucket.total,
            count: bucket.count,
        })
        .collect()
}

/// Completed totals per campaign, largest first
///
/// General-fund donations are excluded.
pub fn totals_by_campaign(donations: &[Donation], campaigns: &[Campaign]) -> Vec<CampaignTotal> {
    let known: HashMap<CampaignId, &Campaign> = campaigns.iter().map(|c| (c.id, c)).collect();

    let mut buckets: HashMap<(CampaignId, Currency), Bucket> = HashMap::new();
    for donation in completed(donations) {
        if let Some(campaign_id) = donation.campaign_id {
            buckets
                .entry((campaign_id, donation.currency))
                .or_default()
                .add(donation.amount);
        }
    }

    let mut totals: Vec<CampaignTotal> = buckets
        .into_iter()
        .map(|((campaign_id, currency), bucket)| {
            let campaign = known.get(&campaign_id);
            let funding_percentage = campaign
                .filter(|c| c.goal > Decimal::ZERO && c.currency == currency)
                .and_then(|c| bucket.total.checked_div(c.goal))
                .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
                .map(|pct| pct.round_dp(2));
            CampaignTotal {
                campaign_id,
                title: campaign.map(|c| c.title.clone()),
                currency,
                total: bucket.total,
                count: bucket.count,
                funding_percentage,
            }
        })
        .collect();

    totals.sort_by(|a, b| {
        b.total
            .cmp(&a.total)
            .then(b.count.cmp(&a.count))
            .then(a.campaign_id.cmp(&b.campaign_id))
    });
    totals
}

/// Completed totals per payment method
pub fn totals_by_payment_method(donations: &[Donation]) -> Vec<PaymentMethodTotal> {
    let mut buckets: BTreeMap<(PaymentMethod, Currency), Bucket> = BTreeMap::new();
    for donation in completed(donations) {
        buckets
            .entry((donation.payment_method, donation.currency))
            .or_default()
            .add(donation.amount);
    }
    buckets
        .into_iter()
        .map(|((method, currency), bucket)| PaymentMethodTotal {
            method,
            currency,
            total: bucket.total,
            count: bucket.count,
        })
        .collect()
}

/// The `limit` campaigns with the highest completed totals
pub fn top_campaigns(donations: &[Donation], campaigns: &[Campaign], limit: usize) -> Vec<CampaignTotal> {
    let mut totals = totals_by_campaign(donations, campaigns);
    totals.truncate(limit);
    totals
}

/// Period overview; `donations` holds every status
pub fn summary(donations: &[Donation], range: DateRange) -> Summary {
    let mut counts_by_status = BTreeMap::new();
    for status in DonationStatus::ALL {
        counts_by_status.insert(status, 0u64);
    }

    let mut per_currency: BTreeMap<Currency, Bucket> = BTreeMap::new();
    let mut largest: BTreeMap<Currency, LargestDonation> = BTreeMap::new();
    let mut donors = HashSet::new();

    for donation in donations.iter().filter(|d| range.contains(d.created_at)) {
        *counts_by_status.entry(donation.status).or_insert(0) += 1;
        if donation.status != DonationStatus::Completed {
            continue;
        }

        per_currency
            .entry(donation.currency)
            .or_default()
            .add(donation.amount);

        let candidate = LargestDonation {
            donation_id: donation.id,
            amount: donation.amount,
            currency: donation.currency,
        };
        largest
            .entry(donation.currency)
            .and_modify(|current| {
                if candidate.amount > current.amount {
                    *current = candidate.clone();
                }
            })
            .or_insert_with(|| candidate.clone());

        if let Some(key) = donation.donor.lookup_key() {
            donors.insert(key);
        }
    }

    let average = per_currency
        .iter()
        .map(|(currency, bucket)| {
            (
                *currency,
                (bucket.total / Decimal::from(bucket.count)).round_dp(2),
            )
        })
        .collect();
    let completed = per_currency
        .into_iter()
        .map(|(currency, bucket)| CurrencyTotal {
            currency,
            total: bucket.total,
            count: bucket.count,
        })
        .collect();

    Summary {
        range,
        counts_by_status,
        completed,
        average,
        largest: largest.into_values().collect(),
        distinct_donors: donors.len() as u64,
    }
}
