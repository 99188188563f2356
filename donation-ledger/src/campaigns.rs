//! Campaign store
//!
//! Plain reads and field updates, plus the operations that move `raised` and
//! `donors_count`. Every write is a compare-and-swap on the campaign's version
//! inside an optimistic transaction. Standalone writes retry with backoff; the
//! transition engine and the reconciler instead stage campaign writes into
//! their own transaction so a donation and its campaign commit together.

use crate::{
    error::{Error, Result},
    retry::RetryPolicy,
    storage::{commit, decode, encode, ConditionalWrite, Db, Storage, CF_CAMPAIGNS},
    types::{AggregateDelta, Campaign, CampaignId, CampaignUpdate, NewCampaign},
};
use chrono::Utc;
use rocksdb::Transaction;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Result of an aggregate update
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateUpdate {
    /// Campaign as written
    pub campaign: Campaign,
    /// Lost CAS races before the write landed
    pub conflicts: u32,
}

/// Aggregate delta staged into a caller's transaction
#[derive(Debug)]
pub(crate) enum StagedDelta {
    /// Delta staged; the campaign as it will read after commit
    Applied(Campaign),
    /// Delta refused; only the campaign version is bumped
    Refused(Error),
    /// No such campaign
    Missing,
}

/// Campaign persistence
pub struct CampaignStore {
    storage: Arc<Storage>,
    retry: RetryPolicy,
}

impl CampaignStore {
    /// Create new store; CAS loops are bounded by the aggregate attempt limit
    pub fn new(storage: Arc<Storage>, retry: RetryPolicy) -> Self {
        Self { storage, retry }
    }

    fn max_attempts(&self) -> u32 {
        self.retry.aggregate_max_attempts().max(1)
    }

    /// Validate and persist a new campaign with zeroed aggregates
    pub fn create(&self, new: NewCampaign) -> Result<Campaign> {
        new.validate()?;
        let campaign = new.into_campaign(CampaignId::new(), Utc::now());

        let cf = self.storage.cf(CF_CAMPAIGNS)?;
        self.storage
            .db()
            .put_cf(&cf, campaign.id.as_uuid().as_bytes(), encode(&campaign)?)?;

        info!(campaign_id = %campaign.id, title = %campaign.title, "Campaign created");
        Ok(campaign)
    }

    /// Point lookup
    pub fn get(&self, id: CampaignId) -> Result<Option<Campaign>> {
        self.storage.get(CF_CAMPAIGNS, id.as_uuid().as_bytes())
    }

    /// Point lookup, `NotFound` when absent
    pub fn require(&self, id: CampaignId) -> Result<Campaign> {
        self.get(id)?.ok_or_else(|| Error::campaign_not_found(id))
    }

    /// All campaigns, oldest first
    pub fn list(&self) -> Result<Vec<Campaign>> {
        let mut campaigns: Vec<Campaign> = self.storage.scan_all(CF_CAMPAIGNS)?;
        campaigns.sort_by_key(|c| (c.created_at, c.id));
        Ok(campaigns)
    }

    /// Update plain fields; aggregates are untouched
    pub fn update(&self, id: CampaignId, update: &CampaignUpdate) -> Result<Campaign> {
        let (campaign, _) = self.modify(id, |campaign| update.apply_to(campaign))?;
        debug!(campaign_id = %id, version = campaign.version, "Campaign updated");
        Ok(campaign)
    }

    /// Remove a campaign record
    ///
    /// Donations keep their campaign reference. Any that still need an
    /// aggregate change surface through reconciliation as orphans.
    pub fn delete(&self, id: CampaignId) -> Result<()> {
        let cf = self.storage.cf(CF_CAMPAIGNS)?;
        let key = id.as_uuid().as_bytes();
        let max_attempts = self.max_attempts();

        for attempt in 1..=max_attempts {
            let txn = self.storage.transaction();
            if txn.get_for_update_cf(&cf, key, true)?.is_none() {
                return Err(Error::campaign_not_found(id));
            }
            txn.delete_cf(&cf, key)?;
            match commit(txn)? {
                ConditionalWrite::Written(()) => {
                    info!(campaign_id = %id, "Campaign deleted");
                    return Ok(());
                }
                ConditionalWrite::Stale => {
                    trace!(campaign_id = %id, attempt, "Campaign delete raced a write");
                    std::thread::sleep(self.retry.delay_for(attempt));
                }
            }
        }

        Err(Error::Conflict(format!(
            "Campaign {} could not be deleted after {} attempts",
            id, max_attempts
        )))
    }

    /// Add `delta` to the campaign's `raised` and `donors_count` atomically
    ///
    /// A result below zero means the stored aggregate has drifted from its
    /// donations; the write is refused with `InvariantViolation`.
    pub fn apply_aggregate_delta(
        &self,
        id: CampaignId,
        delta: AggregateDelta,
    ) -> Result<AggregateUpdate> {
        let (campaign, conflicts) = self.modify(id, |campaign| add_delta(campaign, delta))?;

        debug!(
            campaign_id = %id,
            raised = %campaign.raised,
            donors_count = campaign.donors_count,
            conflicts,
            "Campaign aggregate updated"
        );
        Ok(AggregateUpdate {
            campaign,
            conflicts,
        })
    }

    /// Stage `delta` into `txn`
    ///
    /// A refused delta still bumps the campaign version, so a reconciliation
    /// planned against the old version cannot commit over it.
    pub(crate) fn stage_aggregate_delta(
        &self,
        txn: &Transaction<'_, Db>,
        id: CampaignId,
        delta: AggregateDelta,
    ) -> Result<StagedDelta> {
        let cf = self.storage.cf(CF_CAMPAIGNS)?;
        let key = id.as_uuid().as_bytes();

        let mut campaign: Campaign = match txn.get_for_update_cf(&cf, key, true)? {
            Some(bytes) => decode(&bytes)?,
            None => return Ok(StagedDelta::Missing),
        };

        let refused = add_delta(&mut campaign, delta).err();
        campaign.version += 1;
        campaign.updated_at = Utc::now();
        txn.put_cf(&cf, key, encode(&campaign)?)?;

        Ok(match refused {
            None => StagedDelta::Applied(campaign),
            Some(reason) => StagedDelta::Refused(reason),
        })
    }

    /// Stage an aggregate overwrite into `txn` if the campaign is still at
    /// `expected_version`
    ///
    /// The campaign key is tracked either way, so a write landing before the
    /// commit makes it stale. Nothing is written when the values already match.
    pub(crate) fn stage_reset(
        &self,
        txn: &Transaction<'_, Db>,
        id: CampaignId,
        expected_version: u64,
        raised: Decimal,
        donors_count: u64,
    ) -> Result<Option<Campaign>> {
        let cf = self.storage.cf(CF_CAMPAIGNS)?;
        let key = id.as_uuid().as_bytes();

        let mut campaign: Campaign = match txn.get_for_update_cf(&cf, key, true)? {
            Some(bytes) => decode(&bytes)?,
            None => return Err(Error::campaign_not_found(id)),
        };
        if campaign.version != expected_version {
            return Ok(None);
        }

        if campaign.raised != raised || campaign.donors_count != donors_count {
            campaign.raised = raised;
            campaign.donors_count = donors_count;
            campaign.version += 1;
            campaign.updated_at = Utc::now();
            txn.put_cf(&cf, key, encode(&campaign)?)?;
        }
        Ok(Some(campaign))
    }

    fn modify<F>(&self, id: CampaignId, mut change: F) -> Result<(Campaign, u32)>
    where
        F: FnMut(&mut Campaign) -> Result<()>,
    {
        let max_attempts = self.max_attempts();
        for attempt in 1..=max_attempts {
            match self.try_modify(id, &mut change)? {
                ConditionalWrite::Written(campaign) => return Ok((campaign, attempt - 1)),
                ConditionalWrite::Stale => {
                    trace!(campaign_id = %id, attempt, "Campaign CAS lost, retrying");
                    std::thread::sleep(self.retry.delay_for(attempt));
                }
            }
        }

        Err(Error::Conflict(format!(
            "Campaign {} stayed contended for {} attempts",
            id, max_attempts
        )))
    }

    fn try_modify<F>(&self, id: CampaignId, change: &mut F) -> Result<ConditionalWrite<Campaign>>
    where
        F: FnMut(&mut Campaign) -> Result<()>,
    {
        let cf = self.storage.cf(CF_CAMPAIGNS)?;
        let key = id.as_uuid().as_bytes();
        let txn = self.storage.transaction();

        let mut campaign: Campaign = match txn.get_for_update_cf(&cf, key, true)? {
            Some(bytes) => decode(&bytes)?,
            None => return Err(Error::campaign_not_found(id)),
        };

        change(&mut campaign)?;
        campaign.version += 1;
        campaign.updated_at = Utc::now();
        txn.put_cf(&cf, key, encode(&campaign)?)?;

        Ok(match commit(txn)? {
            ConditionalWrite::Written(()) => ConditionalWrite::Written(campaign),
            ConditionalWrite::Stale => ConditionalWrite::Stale,
        })
    }
}

/// Apply `delta` in place, refusing overflow or a negative result
fn add_delta(campaign: &mut Campaign, delta: AggregateDelta) -> Result<()> {
    let raised = campaign.raised.checked_add(delta.raised).ok_or_else(|| {
        Error::InvariantViolation(format!("Campaign {} raised overflowed", campaign.id))
    })?;
    let donors = campaign.donors_count as i64 + delta.donors;
    if raised < Decimal::ZERO || donors < 0 {
        return Err(Error::InvariantViolation(format!(
            "Campaign {} aggregate would go negative (raised {}, donors {})",
            campaign.id, raised, donors
        )));
    }
    campaign.raised = raised;
    campaign.donors_count = donors as u64;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::temp_storage;
    use crate::types::{CampaignStatus, Currency};
    use rust_decimal_macros::dec;
    use std::thread;

    fn store() -> (Arc<CampaignStore>, tempfile::TempDir) {
        let (storage, temp) = temp_storage();
        (Arc::new(CampaignStore::new(storage, RetryPolicy::default())), temp)
    }

    fn new_campaign() -> NewCampaign {
        let now = Utc::now();
        NewCampaign {
            title: "Food bank".to_string(),
            description: Some("Winter drive".to_string()),
            goal: dec!(1000),
            currency: Currency::USD,
            status: CampaignStatus::Active,
            start_date: now,
            end_date: now + chrono::Duration::days(7),
            allow_donations_after_end: false,
            minimum_donation: dec!(1),
        }
    }

    #[test]
    fn test_create_and_get() {
        let (store, _temp) = store();
        let campaign = store.create(new_campaign()).unwrap();
        assert_eq!(campaign.raised, Decimal::ZERO);
        assert_eq!(campaign.donors_count, 0);
        assert_eq!(store.require(campaign.id).unwrap(), campaign);
        assert!(store.get(CampaignId::new()).unwrap().is_none());
    }

    #[test]
    fn test_create_validates() {
        let (store, _temp) = store();
        let mut invalid = new_campaign();
        invalid.goal = dec!(0);
        assert!(matches!(store.create(invalid), Err(Error::Validation(_))));
    }

    #[test]
    fn test_update_keeps_aggregates() {
        let (store, _temp) = store();
        let campaign = store.create(new_campaign()).unwrap();
        store
            .apply_aggregate_delta(campaign.id, AggregateDelta::credit(dec!(40)))
            .unwrap();

        let updated = store
            .update(
                campaign.id,
                &CampaignUpdate {
                    title: Some("Food bank 2026".to_string()),
                    status: Some(CampaignStatus::Completed),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(updated.title, "Food bank 2026");
        assert_eq!(updated.status, CampaignStatus::Completed);
        assert_eq!(updated.raised, dec!(40));
        assert_eq!(updated.donors_count, 1);
        assert_eq!(updated.version, 3);
    }

    #[test]
    fn test_aggregate_delta_round_trip() {
        let (store, _temp) = store();
        let campaign = store.create(new_campaign()).unwrap();

        store
            .apply_aggregate_delta(campaign.id, AggregateDelta::credit(dec!(20)))
            .unwrap();
        let after = store
            .apply_aggregate_delta(campaign.id, AggregateDelta::debit(dec!(20)))
            .unwrap();

        assert_eq!(after.campaign.raised, dec!(0));
        assert_eq!(after.campaign.donors_count, 0);
    }

    #[test]
    fn test_aggregate_refuses_negative() {
        let (store, _temp) = store();
        let campaign = store.create(new_campaign()).unwrap();

        let result = store.apply_aggregate_delta(campaign.id, AggregateDelta::debit(dec!(5)));
        assert!(matches!(result, Err(Error::InvariantViolation(_))));
        assert_eq!(store.require(campaign.id).unwrap().version, 1);
    }

    #[test]
    fn test_aggregate_on_missing_campaign() {
        let (store, _temp) = store();
        let result = store.apply_aggregate_delta(CampaignId::new(), AggregateDelta::credit(dec!(5)));
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_concurrent_deltas_sum_exactly() {
        let (store, _temp) = store();
        let campaign = store.create(new_campaign()).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..25 {
                        store
                            .apply_aggregate_delta(campaign.id, AggregateDelta::credit(dec!(2.50)))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stored = store.require(campaign.id).unwrap();
        assert_eq!(stored.raised, dec!(500.00));
        assert_eq!(stored.donors_count, 200);
    }

    #[test]
    fn test_stage_reset_is_conditional() {
        let (store, _temp) = store();
        let campaign = store.create(new_campaign()).unwrap();

        let txn = store.storage.transaction();
        let staged = store
            .stage_reset(&txn, campaign.id, 1, dec!(75), 3)
            .unwrap()
            .unwrap();
        assert_eq!(staged.raised, dec!(75));
        assert_eq!(commit(txn).unwrap(), ConditionalWrite::Written(()));

        let txn = store.storage.transaction();
        assert!(store
            .stage_reset(&txn, campaign.id, 1, dec!(0), 0)
            .unwrap()
            .is_none());
        drop(txn);
        assert_eq!(store.require(campaign.id).unwrap().donors_count, 3);
    }

    #[test]
    fn test_staged_delta_loses_to_a_concurrent_write() {
        let (store, _temp) = store();
        let campaign = store.create(new_campaign()).unwrap();

        let txn = store.storage.transaction();
        let staged = store
            .stage_aggregate_delta(&txn, campaign.id, AggregateDelta::credit(dec!(10)))
            .unwrap();
        assert!(matches!(staged, StagedDelta::Applied(ref c) if c.raised == dec!(10)));

        store
            .apply_aggregate_delta(campaign.id, AggregateDelta::credit(dec!(4)))
            .unwrap();
        assert_eq!(commit(txn).unwrap(), ConditionalWrite::Stale);
        assert_eq!(store.require(campaign.id).unwrap().raised, dec!(4));
    }

    #[test]
    fn test_refused_delta_bumps_version_only() {
        let (store, _temp) = store();
        let campaign = store.create(new_campaign()).unwrap();

        let txn = store.storage.transaction();
        let staged = store
            .stage_aggregate_delta(&txn, campaign.id, AggregateDelta::debit(dec!(10)))
            .unwrap();
        assert!(matches!(staged, StagedDelta::Refused(Error::InvariantViolation(_))));
        commit(txn).unwrap();

        let stored = store.require(campaign.id).unwrap();
        assert_eq!(stored.raised, Decimal::ZERO);
        assert_eq!(stored.version, 2);

        let txn = store.storage.transaction();
        let missing = store
            .stage_aggregate_delta(&txn, CampaignId::new(), AggregateDelta::credit(dec!(1)))
            .unwrap();
        assert!(matches!(missing, StagedDelta::Missing));
    }

    #[test]
    fn test_delete() {
        let (store, _temp) = store();
        let campaign = store.create(new_campaign()).unwrap();
        store.delete(campaign.id).unwrap();
        assert!(store.get(campaign.id).unwrap().is_none());
        assert!(matches!(store.delete(campaign.id), Err(Error::NotFound { .. })));
        assert_eq!(store.list().unwrap().len(), 0);
    }
}
