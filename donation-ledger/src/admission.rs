//! Donation admission rules
//!
//! [`admit`] is a pure function: the caller looks the campaign up and passes
//! the result in as a [`CampaignTarget`]. Rules are checked in a fixed order
//! and the first failing rule decides the [`Rejection`].

use crate::config::AdmissionConfig;
use crate::types::{Campaign, CampaignId, CampaignStatus, Currency};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What a prospective donation points at
#[derive(Debug, Clone, Copy)]
pub enum CampaignTarget<'a> {
    /// No campaign; the general fund
    GeneralFund,
    /// A campaign ID that did not resolve
    Missing(CampaignId),
    /// A resolved campaign
    Campaign(&'a Campaign),
}

/// Why a donation was refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum Rejection {
    /// Referenced campaign does not exist
    #[error("campaign {0} not found")]
    CampaignNotFound(CampaignId),

    /// Campaign is not active
    #[error("campaign is not accepting donations (status: {status})")]
    NotAcceptingDonations {
        /// Current campaign status
        status: CampaignStatus,
    },

    /// Campaign window closed and late donations are off
    #[error("campaign ended at {ended_at}")]
    CampaignEnded {
        /// Campaign end date
        ended_at: DateTime<Utc>,
    },

    /// Amount under the campaign minimum
    #[error("donation is below the minimum of {minimum} {currency}")]
    BelowMinimum {
        /// Campaign minimum
        minimum: Decimal,
        /// Campaign currency
        currency: Currency,
    },

    /// Zero or negative amount
    #[error("donation amount must be positive")]
    NonPositiveAmount,

    /// Amount over the configured ceiling
    #[error("donation exceeds the maximum of {maximum}")]
    AboveMaximum {
        /// Configured ceiling
        maximum: Decimal,
    },

    /// Currency not accepted at all
    #[error("currency {0} is not accepted")]
    UnsupportedCurrency(Currency),

    /// Currency differs from the campaign's
    #[error("campaign accepts {expected}, got {got}")]
    CurrencyMismatch {
        /// Campaign currency
        expected: Currency,
        /// Donation currency
        got: Currency,
    },
}

/// Admission decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Donation may be created
    Admitted,
    /// Donation must not be created
    Rejected(Rejection),
}

impl Admission {
    /// Whether the donation was admitted
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

/// Platform-wide admission settings
#[derive(Debug, Clone)]
pub struct AdmissionPolicy {
    accepted_currencies: Vec<Currency>,
    max_donation: Option<Decimal>,
}

impl AdmissionPolicy {
    /// Build from configuration
    pub fn new(config: &AdmissionConfig) -> Self {
        Self {
            accepted_currencies: config.accepted_currencies.clone(),
            max_donation: config.max_donation,
        }
    }

    /// Whether `currency` is accepted at all
    pub fn accepts(&self, currency: Currency) -> bool {
        self.accepted_currencies.contains(&currency)
    }

    /// Configured ceiling
    pub fn max_donation(&self) -> Option<Decimal> {
        self.max_donation
    }
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self::new(&AdmissionConfig::default())
    }
}

/// Decide whether a donation may be admitted
pub fn admit(
    target: CampaignTarget<'_>,
    amount: Decimal,
    currency: Currency,
    now: DateTime<Utc>,
    policy: &AdmissionPolicy,
) -> Admission {
    match check(target, amount, currency, now, policy) {
        Ok(()) => Admission::Admitted,
        Err(rejection) => Admission::Rejected(rejection),
    }
}

fn check(
    target: CampaignTarget<'_>,
    amount: Decimal,
    currency: Currency,
    now: DateTime<Utc>,
    policy: &AdmissionPolicy,
) -> std::result::Result<(), Rejection> {
    let campaign = match target {
        CampaignTarget::GeneralFund => None,
        CampaignTarget::Missing(id) => return Err(Rejection::CampaignNotFound(id)),
        CampaignTarget::Campaign(campaign) => Some(campaign),
    };

    if let Some(campaign) = campaign {
        if campaign.status != CampaignStatus::Active {
            return Err(Rejection::NotAcceptingDonations {
                status: campaign.status,
            });
        }

        if campaign.has_ended(now) && !campaign.allow_donations_after_end {
            return Err(Rejection::CampaignEnded {
                ended_at: campaign.end_date,
            });
        }

        if amount < campaign.minimum_donation {
            return Err(Rejection::BelowMinimum {
                minimum: campaign.minimum_donation,
                currency: campaign.currency,
            });
        }
    }

    if amount <= Decimal::ZERO {
        return Err(Rejection::NonPositiveAmount);
    }

    if !policy.accepts(currency) {
        return Err(Rejection::UnsupportedCurrency(currency));
    }

    if let Some(campaign) = campaign {
        if campaign.currency != currency {
            return Err(Rejection::CurrencyMismatch {
                expected: campaign.currency,
                got: currency,
            });
        }
    }

    if let Some(maximum) = policy.max_donation {
        if amount > maximum {
            return Err(Rejection::AboveMaximum { maximum });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewCampaign;
    use rust_decimal_macros::dec;

    fn active_campaign(now: DateTime<Utc>) -> Campaign {
        NewCampaign {
            title: "Campaign X".to_string(),
            description: None,
            goal: dec!(1000),
            currency: Currency::USD,
            status: CampaignStatus::Active,
            start_date: now - chrono::Duration::days(1),
            end_date: now + chrono::Duration::days(30),
            allow_donations_after_end: false,
            minimum_donation: dec!(5),
        }
        .into_campaign(CampaignId::new(), now)
    }

    fn reason(admission: Admission) -> Rejection {
        match admission {
            Admission::Rejected(rejection) => rejection,
            Admission::Admitted => panic!("expected a rejection"),
        }
    }

    #[test]
    fn test_admits_valid_donation() {
        let now = Utc::now();
        let campaign = active_campaign(now);
        let policy = AdmissionPolicy::default();

        let admission = admit(
            CampaignTarget::Campaign(&campaign),
            dec!(20),
            Currency::USD,
            now,
            &policy,
        );
        assert!(admission.is_admitted());
    }

    #[test]
    fn test_missing_campaign() {
        let id = CampaignId::new();
        let admission = admit(
            CampaignTarget::Missing(id),
            dec!(20),
            Currency::USD,
            Utc::now(),
            &AdmissionPolicy::default(),
        );
        assert_eq!(reason(admission), Rejection::CampaignNotFound(id));
    }

    #[test]
    fn test_inactive_campaign() {
        let now = Utc::now();
        let mut campaign = active_campaign(now);
        campaign.status = CampaignStatus::Draft;

        let admission = admit(
            CampaignTarget::Campaign(&campaign),
            dec!(20),
            Currency::USD,
            now,
            &AdmissionPolicy::default(),
        );
        assert_eq!(
            reason(admission),
            Rejection::NotAcceptingDonations {
                status: CampaignStatus::Draft
            }
        );
    }

    #[test]
    fn test_ended_campaign_respects_late_flag() {
        let now = Utc::now();
        let mut campaign = active_campaign(now);
        campaign.end_date = now - chrono::Duration::hours(1);
        let policy = AdmissionPolicy::default();

        let admission = admit(
            CampaignTarget::Campaign(&campaign),
            dec!(20),
            Currency::USD,
            now,
            &policy,
        );
        assert!(matches!(reason(admission), Rejection::CampaignEnded { .. }));

        campaign.allow_donations_after_end = true;
        let admission = admit(
            CampaignTarget::Campaign(&campaign),
            dec!(20),
            Currency::USD,
            now,
            &policy,
        );
        assert!(admission.is_admitted());
    }

    #[test]
    fn test_below_minimum_carries_minimum() {
        let now = Utc::now();
        let campaign = active_campaign(now);

        let admission = admit(
            CampaignTarget::Campaign(&campaign),
            dec!(3),
            Currency::USD,
            now,
            &AdmissionPolicy::default(),
        );
        assert_eq!(
            reason(admission),
            Rejection::BelowMinimum {
                minimum: dec!(5),
                currency: Currency::USD
            }
        );
    }

    #[test]
    fn test_minimum_is_inclusive() {
        let now = Utc::now();
        let campaign = active_campaign(now);
        let admission = admit(
            CampaignTarget::Campaign(&campaign),
            dec!(5),
            Currency::USD,
            now,
            &AdmissionPolicy::default(),
        );
        assert!(admission.is_admitted());
    }

    #[test]
    fn test_general_fund_checks_amount_and_currency() {
        let policy = AdmissionPolicy::default();
        let now = Utc::now();

        assert!(admit(CampaignTarget::GeneralFund, dec!(1), Currency::EUR, now, &policy).is_admitted());
        assert_eq!(
            reason(admit(CampaignTarget::GeneralFund, dec!(0), Currency::USD, now, &policy)),
            Rejection::NonPositiveAmount
        );
        assert_eq!(
            reason(admit(CampaignTarget::GeneralFund, dec!(10), Currency::INR, now, &policy)),
            Rejection::UnsupportedCurrency(Currency::INR)
        );
    }

    #[test]
    fn test_currency_must_match_campaign() {
        let now = Utc::now();
        let campaign = active_campaign(now);
        let admission = admit(
            CampaignTarget::Campaign(&campaign),
            dec!(20),
            Currency::EUR,
            now,
            &AdmissionPolicy::default(),
        );
        assert_eq!(
            reason(admission),
            Rejection::CurrencyMismatch {
                expected: Currency::USD,
                got: Currency::EUR
            }
        );
    }

    #[test]
    fn test_maximum_ceiling() {
        let policy = AdmissionPolicy::new(&AdmissionConfig {
            max_donation: Some(dec!(10000)),
            ..AdmissionConfig::default()
        });
        let admission = admit(
            CampaignTarget::GeneralFund,
            dec!(10000.01),
            Currency::USD,
            Utc::now(),
            &policy,
        );
        assert_eq!(
            reason(admission),
            Rejection::AboveMaximum {
                maximum: dec!(10000)
            }
        );
    }

    #[test]
    fn test_rejection_display() {
        let rejection = Rejection::BelowMinimum {
            minimum: dec!(5),
            currency: Currency::USD,
        };
        assert_eq!(
            rejection.to_string(),
            "donation is below the minimum of 5 USD"
        );
    }
}
