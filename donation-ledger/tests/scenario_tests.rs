//! End-to-end donation scenarios
//!
//! Intake, payment confirmation, admin reversal and reconciliation through the
//! public `Ledger` API.

use chrono::Utc;
use donation_ledger::{
    Actor, AdminOverride, AggregateEffect, CampaignId, CampaignStatus, CampaignUpdate, Config,
    Currency, DonationFilter, DonationStatus, Donor, DonorKey, Error, ErrorKind, GuestDonor,
    Ledger, NewCampaign, NewDonation, PageRequest, PaymentConfirmation, Rejection,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tempfile::TempDir;

fn create_test_ledger() -> (Ledger, TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.data_dir = temp_dir.path().to_path_buf();
    (Ledger::open(config).unwrap(), temp_dir)
}

fn campaign_x(ledger: &Ledger) -> CampaignId {
    let now = Utc::now();
    ledger
        .create_campaign(NewCampaign {
            title: "Campaign X".to_string(),
            description: Some("Community garden".to_string()),
            goal: dec!(1000),
            currency: Currency::USD,
            status: CampaignStatus::Active,
            start_date: now - chrono::Duration::days(1),
            end_date: now + chrono::Duration::days(30),
            allow_donations_after_end: false,
            minimum_donation: dec!(5),
        })
        .unwrap()
        .id
}

fn admin(reason: &str) -> Actor {
    Actor::Admin {
        admin_id: "admin-1".to_string(),
        reason: Some(reason.to_string()),
        notes: None,
    }
}

fn assert_totals(ledger: &Ledger, campaign_id: CampaignId, raised: Decimal, donors: u64) {
    let campaign = ledger.get_campaign(campaign_id).unwrap();
    assert_eq!(campaign.raised, raised);
    assert_eq!(campaign.donors_count, donors);
    assert!(ledger
        .check_aggregate_invariant(campaign_id)
        .unwrap()
        .is_consistent());
}

#[tokio::test]
async fn test_campaign_x_scenario() {
    let (ledger, _temp) = create_test_ledger();
    let campaign_id = campaign_x(&ledger);
    assert_totals(&ledger, campaign_id, dec!(0), 0);

    // A = 20 is admitted and starts pending
    let a = ledger
        .submit_donation(NewDonation::new(
            dec!(20),
            Currency::USD,
            Donor::user("donor-a"),
            Some(campaign_id),
        ))
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(a.status, DonationStatus::Pending);
    assert_totals(&ledger, campaign_id, dec!(0), 0);

    // Gateway confirms A
    let outcome = ledger
        .confirm_payment(PaymentConfirmation {
            donation_id: a.id,
            status: DonationStatus::Completed,
            transaction_id: Some("tx-a".to_string()),
        })
        .await
        .unwrap();
    assert_eq!(outcome.previous_status, DonationStatus::Pending);
    assert_totals(&ledger, campaign_id, dec!(20), 1);

    // B = 3 is below the minimum and leaves no record
    let intake = ledger
        .submit_donation(NewDonation::new(
            dec!(3),
            Currency::USD,
            Donor::user("donor-b"),
            Some(campaign_id),
        ))
        .await
        .unwrap();
    match intake.into_result() {
        Err(Error::RejectedByPolicy(Rejection::BelowMinimum { minimum, .. })) => {
            assert_eq!(minimum, dec!(5))
        }
        other => panic!("expected below-minimum rejection, got {:?}", other),
    }
    let listed = ledger
        .list_donations(
            &DonationFilter {
                campaign_id: Some(campaign_id),
                ..Default::default()
            },
            PageRequest::default(),
        )
        .unwrap();
    assert_eq!(listed.total, 1);

    // Admin refunds A
    let refunded = ledger
        .admin_override(AdminOverride {
            donation_id: a.id,
            status: DonationStatus::Refunded,
            admin_id: "admin-1".to_string(),
            reason: Some("donor request".to_string()),
            notes: None,
        })
        .await
        .unwrap();
    assert_eq!(refunded.donation.status, DonationStatus::Refunded);
    assert_totals(&ledger, campaign_id, dec!(0), 0);

    // Refunded is terminal
    let err = ledger
        .transition(a.id, DonationStatus::Completed, admin("retry"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTransition);
    assert_totals(&ledger, campaign_id, dec!(0), 0);
    assert_eq!(
        ledger.get_donation(a.id).unwrap().status,
        DonationStatus::Refunded
    );
}

#[tokio::test]
async fn test_repeated_completion_is_idempotent() {
    let (ledger, _temp) = create_test_ledger();
    let campaign_id = campaign_x(&ledger);
    let donation = ledger
        .submit_donation(NewDonation::new(
            dec!(42.42),
            Currency::USD,
            Donor::user("donor-a"),
            Some(campaign_id),
        ))
        .await
        .unwrap()
        .into_result()
        .unwrap();

    for _ in 0..5 {
        ledger
            .transition(
                donation.id,
                DonationStatus::Completed,
                Actor::PaymentGateway {
                    transaction_id: Some("tx-dup".to_string()),
                },
            )
            .await
            .unwrap();
    }

    assert_totals(&ledger, campaign_id, dec!(42.42), 1);
    let stored = ledger.get_donation(donation.id).unwrap();
    assert_eq!(stored.history.len(), 1);
    assert_eq!(stored.version, 2);
}

#[tokio::test]
async fn test_failed_then_admin_completion_then_refund() {
    let (ledger, _temp) = create_test_ledger();
    let campaign_id = campaign_x(&ledger);
    let donation = ledger
        .submit_donation(NewDonation::new(
            dec!(100),
            Currency::USD,
            Donor::user("donor-c"),
            Some(campaign_id),
        ))
        .await
        .unwrap()
        .into_result()
        .unwrap();

    ledger
        .transition(donation.id, DonationStatus::Failed, Actor::System)
        .await
        .unwrap();
    assert_totals(&ledger, campaign_id, dec!(0), 0);

    // Only an admin may complete a failed donation
    let err = ledger
        .transition(donation.id, DonationStatus::Completed, Actor::System)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));

    let completed = ledger
        .transition(donation.id, DonationStatus::Completed, admin("bank confirmed"))
        .await
        .unwrap();
    assert!(matches!(completed.aggregate, AggregateEffect::Applied { .. }));
    assert_totals(&ledger, campaign_id, dec!(100), 1);

    ledger
        .transition(donation.id, DonationStatus::Refunded, admin("chargeback"))
        .await
        .unwrap();
    assert_totals(&ledger, campaign_id, dec!(0), 0);

    let stored = ledger.get_donation(donation.id).unwrap();
    assert!(stored.failed_at.is_some());
    assert!(stored.completed_at.is_some());
    assert!(stored.refunded_at.is_some());
    assert_eq!(stored.history.len(), 3);
    assert_eq!(stored.admin_notes.len(), 2);
}

#[tokio::test]
async fn test_general_fund_donation_touches_no_campaign() {
    let (ledger, _temp) = create_test_ledger();
    let campaign_id = campaign_x(&ledger);
    let donation = ledger
        .submit_donation(NewDonation::new(
            dec!(15),
            Currency::EUR,
            Donor::Guest(GuestDonor::named("Grace").with_email("grace@example.org")),
            None,
        ))
        .await
        .unwrap()
        .into_result()
        .unwrap();

    let outcome = ledger
        .transition(donation.id, DonationStatus::Completed, Actor::System)
        .await
        .unwrap();
    assert_eq!(outcome.aggregate, AggregateEffect::Unchanged);
    assert_totals(&ledger, campaign_id, dec!(0), 0);

    let by_donor = ledger
        .donations_by_donor(&DonorKey::email("GRACE@example.org"))
        .unwrap();
    assert_eq!(by_donor.len(), 1);
}

#[tokio::test]
async fn test_closed_campaign_rejects_intake() {
    let (ledger, _temp) = create_test_ledger();
    let campaign_id = campaign_x(&ledger);
    ledger
        .update_campaign(
            campaign_id,
            &CampaignUpdate {
                status: Some(CampaignStatus::Cancelled),
                ..Default::default()
            },
        )
        .unwrap();

    let intake = ledger
        .submit_donation(NewDonation::new(
            dec!(50),
            Currency::USD,
            Donor::user("donor-d"),
            Some(campaign_id),
        ))
        .await
        .unwrap();
    assert!(!intake.is_accepted());
    assert!(!ledger.campaign_detail(campaign_id).unwrap().accepting_donations);
}

#[tokio::test]
async fn test_late_donation_policy() {
    let (ledger, _temp) = create_test_ledger();
    let campaign_id = campaign_x(&ledger);
    let after_end = Utc::now() + chrono::Duration::days(45);

    let new = NewDonation::new(dec!(10), Currency::USD, Donor::user("donor-e"), Some(campaign_id));
    let intake = ledger.submit_donation_at(new.clone(), after_end).await.unwrap();
    assert!(matches!(
        intake.into_result(),
        Err(Error::RejectedByPolicy(Rejection::CampaignEnded { .. }))
    ));

    ledger
        .update_campaign(
            campaign_id,
            &CampaignUpdate {
                allow_donations_after_end: Some(true),
                ..Default::default()
            },
        )
        .unwrap();
    let intake = ledger.submit_donation_at(new, after_end).await.unwrap();
    assert!(intake.is_accepted());
}

#[tokio::test]
async fn test_orphaned_donation_is_flagged_and_reported() {
    let (ledger, _temp) = create_test_ledger();
    let campaign_id = campaign_x(&ledger);
    let donation = ledger
        .submit_donation(NewDonation::new(
            dec!(20),
            Currency::USD,
            Donor::user("donor-f"),
            Some(campaign_id),
        ))
        .await
        .unwrap()
        .into_result()
        .unwrap();
    ledger.delete_campaign(campaign_id).unwrap();

    let outcome = ledger
        .transition(donation.id, DonationStatus::Completed, Actor::System)
        .await
        .unwrap();
    assert_eq!(outcome.aggregate, AggregateEffect::FlaggedForReconciliation);

    let summary = ledger.reconcile_flagged().unwrap();
    assert_eq!(summary.orphaned, vec![donation.id]);
    assert!(ledger.get_donation(donation.id).unwrap().needs_reconciliation);
}

#[tokio::test]
async fn test_admin_listing_by_status_and_amount() {
    let (ledger, _temp) = create_test_ledger();
    let campaign_id = campaign_x(&ledger);

    let mut ids = Vec::new();
    for amount in [dec!(5), dec!(50), dec!(500)] {
        let donation = ledger
            .submit_donation(NewDonation::new(
                amount,
                Currency::USD,
                Donor::user("donor-g"),
                Some(campaign_id),
            ))
            .await
            .unwrap()
            .into_result()
            .unwrap();
        ids.push(donation.id);
    }
    ledger
        .transition(ids[1], DonationStatus::Completed, Actor::System)
        .await
        .unwrap();
    ledger
        .transition(ids[2], DonationStatus::Completed, Actor::System)
        .await
        .unwrap();

    let completed_large = ledger
        .list_donations(
            &DonationFilter {
                status: Some(DonationStatus::Completed),
                min_amount: Some(dec!(100)),
                ..Default::default()
            },
            PageRequest::default(),
        )
        .unwrap();
    assert_eq!(completed_large.total, 1);
    assert_eq!(completed_large.items[0].id, ids[2]);

    let pending = ledger
        .list_donations(
            &DonationFilter {
                status: Some(DonationStatus::Pending),
                ..Default::default()
            },
            PageRequest::default(),
        )
        .unwrap();
    assert_eq!(pending.total, 1);
    assert_eq!(pending.items[0].id, ids[0]);
}
