//! Reporting reader over a live ledger

use chrono::Utc;
use donation_ledger::config::ReportingConfig;
use donation_ledger::{
    Actor, CampaignId, CampaignStatus, Config, Currency, DonationStatus, Donor, Ledger,
    NewCampaign, NewDonation,
};
use ledger_reporting::{DateRange, ReportingReader};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tempfile::TempDir;

fn create_test_ledger() -> (Arc<Ledger>, TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.data_dir = temp_dir.path().to_path_buf();
    (Arc::new(Ledger::open(config).unwrap()), temp_dir)
}

fn create_campaign(ledger: &Ledger, title: &str, goal: Decimal) -> CampaignId {
    let now = Utc::now();
    ledger
        .create_campaign(NewCampaign {
            title: title.to_string(),
            description: None,
            goal,
            currency: Currency::USD,
            status: CampaignStatus::Active,
            start_date: now - chrono::Duration::days(1),
            end_date: now + chrono::Duration::days(30),
            allow_donations_after_end: false,
            minimum_donation: dec!(1),
        })
        .unwrap()
        .id
}

async fn donate(
    ledger: &Ledger,
    campaign_id: Option<CampaignId>,
    amount: Decimal,
    to: DonationStatus,
) {
    let donation = ledger
        .submit_donation(NewDonation::new(
            amount,
            Currency::USD,
            Donor::user("donor-r"),
            campaign_id,
        ))
        .await
        .unwrap()
        .into_result()
        .unwrap();
    if to != DonationStatus::Pending {
        ledger.transition(donation.id, to, Actor::System).await.unwrap();
    }
}

#[tokio::test]
async fn test_totals_match_campaign_aggregates() {
    let (ledger, _temp) = create_test_ledger();
    let garden = create_campaign(&ledger, "Garden", dec!(1000));
    let library = create_campaign(&ledger, "Library", dec!(500));

    donate(&ledger, Some(garden), dec!(120), DonationStatus::Completed).await;
    donate(&ledger, Some(garden), dec!(80), DonationStatus::Completed).await;
    donate(&ledger, Some(garden), dec!(999), DonationStatus::Failed).await;
    donate(&ledger, Some(library), dec!(50), DonationStatus::Completed).await;
    donate(&ledger, Some(library), dec!(70), DonationStatus::Pending).await;
    donate(&ledger, None, dec!(25), DonationStatus::Completed).await;

    let reader = ReportingReader::new(Arc::clone(&ledger), ReportingConfig { cache_ttl_secs: 0 });

    let by_campaign = reader.totals_by_campaign().unwrap().data;
    assert_eq!(by_campaign.len(), 2);
    for total in &by_campaign {
        let campaign = ledger.get_campaign(total.campaign_id).unwrap();
        assert_eq!(total.total, campaign.raised);
        assert_eq!(total.count, campaign.donors_count);
    }
    assert_eq!(by_campaign[0].campaign_id, garden);
    assert_eq!(by_campaign[0].funding_percentage, Some(dec!(20)));

    let top = reader.top_campaigns(1).unwrap().data;
    assert_eq!(top[0].title.as_deref(), Some("Garden"));

    let by_day = reader.totals_by_day(None).unwrap().data;
    let day_total: Decimal = by_day.iter().map(|d| d.total).sum();
    assert_eq!(day_total, dec!(275));

    let methods = reader.totals_by_payment_method().unwrap().data;
    assert_eq!(methods.len(), 1);
    assert_eq!(methods[0].count, 4);

    let range = DateRange::last_days(Utc::now() + chrono::Duration::minutes(1), 1).unwrap();
    let summary = reader.summary(range).unwrap().data;
    assert_eq!(summary.counts_by_status[&DonationStatus::Completed], 4);
    assert_eq!(summary.counts_by_status[&DonationStatus::Failed], 1);
    assert_eq!(summary.counts_by_status[&DonationStatus::Pending], 1);
    assert_eq!(summary.completed[0].total, dec!(275));
    assert_eq!(summary.distinct_donors, 1);
}

#[tokio::test]
async fn test_views_are_stale_until_invalidated() {
    let (ledger, _temp) = create_test_ledger();
    let campaign_id = create_campaign(&ledger, "Shelter", dec!(100));
    donate(&ledger, Some(campaign_id), dec!(10), DonationStatus::Completed).await;

    let reader = ReportingReader::new(
        Arc::clone(&ledger),
        ReportingConfig {
            cache_ttl_secs: 3600,
        },
    );
    let before = reader.totals_by_campaign().unwrap();
    assert_eq!(before.data[0].total, dec!(10));

    donate(&ledger, Some(campaign_id), dec!(15), DonationStatus::Completed).await;

    // Cached view lags the ledger; the campaign aggregate does not
    let cached = reader.totals_by_campaign().unwrap();
    assert_eq!(cached.data[0].total, dec!(10));
    assert_eq!(cached.generated_at, before.generated_at);
    assert_eq!(ledger.get_campaign(campaign_id).unwrap().raised, dec!(25));

    reader.invalidate();
    let fresh = reader.totals_by_campaign().unwrap();
    assert_eq!(fresh.data[0].total, dec!(25));
}

#[tokio::test]
async fn test_from_ledger_uses_ledger_config() {
    let (ledger, _temp) = create_test_ledger();
    let reader = ReportingReader::from_ledger(Arc::clone(&ledger));
    assert_eq!(
        reader.cache_ttl().as_secs(),
        ledger.config().reporting.cache_ttl_secs
    );
    assert!(reader.totals_by_campaign().unwrap().data.is_empty());
}

#[test]
fn test_inverted_range_is_rejected() {
    let now = Utc::now();
    assert!(DateRange::new(now, now - chrono::Duration::hours(1)).is_err());
}
