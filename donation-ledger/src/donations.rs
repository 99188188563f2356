//! Donation store
//!
//! Persists donation records and their secondary index entries. The store
//! validates fields but knows nothing about the state machine. Status changes
//! are staged by the transition engine through [`DonationStore::stage_update`]
//! into the same transaction as the campaign aggregate change.

use crate::{
    error::{Error, Result},
    retry::RetryPolicy,
    storage::{
        commit, decode, encode, keys, ConditionalWrite, Db, Storage, CF_CAMPAIGNS, CF_DONATIONS,
        CF_INDICES,
    },
    types::{CampaignId, Donation, DonationId, DonationStatus, DonorKey, NewDonation},
};
use chrono::{DateTime, Utc};
use rocksdb::Transaction;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Largest page a listing may request
pub const MAX_PAGE_SIZE: usize = 100;

/// Page size when the caller does not ask for one
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// Admin listing filter; every set field must match
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DonationFilter {
    /// Exact status
    pub status: Option<DonationStatus>,
    /// Exact campaign
    pub campaign_id: Option<CampaignId>,
    /// Donor lookup key
    pub donor: Option<DonorKey>,
    /// Created at or after
    pub created_from: Option<DateTime<Utc>>,
    /// Created strictly before
    pub created_to: Option<DateTime<Utc>>,
    /// Amount at least
    pub min_amount: Option<Decimal>,
    /// Amount at most
    pub max_amount: Option<Decimal>,
}

impl DonationFilter {
    /// Whether `donation` passes every set criterion
    pub fn matches(&self, donation: &Donation) -> bool {
        if let Some(status) = self.status {
            if donation.status != status {
                return false;
            }
        }
        if let Some(campaign_id) = self.campaign_id {
            if donation.campaign_id != Some(campaign_id) {
                return false;
            }
        }
        if let Some(donor) = &self.donor {
            if donation.donor.lookup_key().as_ref() != Some(donor) {
                return false;
            }
        }
        if let Some(from) = self.created_from {
            if donation.created_at < from {
                return false;
            }
        }
        if let Some(to) = self.created_to {
            if donation.created_at >= to {
                return false;
            }
        }
        if let Some(min) = self.min_amount {
            if donation.amount < min {
                return false;
            }
        }
        if let Some(max) = self.max_amount {
            if donation.amount > max {
                return false;
            }
        }
        true
    }

    /// Reject contradictory bounds
    pub fn validate(&self) -> Result<()> {
        if let (Some(from), Some(to)) = (self.created_from, self.created_to) {
            if from > to {
                return Err(Error::Validation(
                    "created_from is after created_to".to_string(),
                ));
            }
        }
        if let (Some(min), Some(max)) = (self.min_amount, self.max_amount) {
            if min > max {
                return Err(Error::Validation(
                    "min_amount is greater than max_amount".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Offset pagination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    /// Items to skip
    pub offset: usize,
    /// Page size, clamped to `1..=MAX_PAGE_SIZE`
    pub limit: usize,
}

impl PageRequest {
    /// Create a request with a clamped limit
    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit: limit.clamp(1, MAX_PAGE_SIZE),
        }
    }

    fn effective_limit(&self) -> usize {
        self.limit.clamp(1, MAX_PAGE_SIZE)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(0, DEFAULT_PAGE_SIZE)
    }
}

/// One page of results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Items on this page
    pub items: Vec<T>,
    /// Matches across all pages
    pub total: usize,
    /// Offset used
    pub offset: usize,
    /// Limit used
    pub limit: usize,
}

impl<T> Page<T> {
    /// Whether another page follows
    pub fn has_more(&self) -> bool {
        self.offset + self.items.len() < self.total
    }
}

/// Donation persistence
pub struct DonationStore {
    storage: Arc<Storage>,
    retry: RetryPolicy,
}

impl DonationStore {
    /// Create new store
    pub fn new(storage: Arc<Storage>, retry: RetryPolicy) -> Self {
        Self { storage, retry }
    }

    /// Validate and persist a new pending donation
    pub fn create(&self, new: NewDonation) -> Result<Donation> {
        self.create_at(new, Utc::now())
    }

    /// [`DonationStore::create`] with an explicit creation time
    pub fn create_at(&self, new: NewDonation, now: DateTime<Utc>) -> Result<Donation> {
        new.validate()?;
        let donation = new.into_donation(DonationId::new(), now);
        let max_attempts = self.retry.max_attempts().max(1);

        for attempt in 1..=max_attempts {
            let txn = self.storage.transaction();
            self.stage_insert(&txn, &donation)?;
            match commit(txn)? {
                ConditionalWrite::Written(()) => {
                    debug!(
                        donation_id = %donation.id,
                        campaign_id = ?donation.campaign_id,
                        amount = %donation.amount,
                        "Donation created"
                    );
                    return Ok(donation);
                }
                ConditionalWrite::Stale => {
                    warn!(donation_id = %donation.id, attempt, "Donation create conflicted, retrying");
                    std::thread::sleep(self.retry.delay_for(attempt));
                }
            }
        }

        Err(Error::Conflict(format!(
            "Donation {} could not be created after {} attempts",
            donation.id, max_attempts
        )))
    }

    /// Stage a new record and its index entries into `txn`
    ///
    /// Tracks the campaign key so a concurrent campaign delete aborts the commit.
    pub(crate) fn stage_insert(&self, txn: &Transaction<'_, Db>, donation: &Donation) -> Result<()> {
        let donations = self.storage.cf(CF_DONATIONS)?;
        let campaigns = self.storage.cf(CF_CAMPAIGNS)?;
        let indices = self.storage.cf(CF_INDICES)?;

        if let Some(campaign_id) = donation.campaign_id {
            if txn
                .get_for_update_cf(&campaigns, campaign_id.as_uuid().as_bytes(), false)?
                .is_none()
            {
                return Err(Error::campaign_not_found(campaign_id));
            }
        }

        let key = donation.id.as_uuid().as_bytes();
        if txn.get_for_update_cf(&donations, key, true)?.is_some() {
            return Err(Error::InvariantViolation(format!(
                "Donation {} already exists",
                donation.id
            )));
        }

        txn.put_cf(&donations, key, encode(donation)?)?;
        for index_key in index_entries(donation) {
            txn.put_cf(&indices, index_key, b"")?;
        }
        Ok(())
    }

    /// Point lookup
    pub fn find_by_id(&self, id: DonationId) -> Result<Option<Donation>> {
        self.storage.get(CF_DONATIONS, id.as_uuid().as_bytes())
    }

    /// Point lookup, `NotFound` when absent
    pub fn get(&self, id: DonationId) -> Result<Donation> {
        self.find_by_id(id)?
            .ok_or_else(|| Error::donation_not_found(id))
    }

    /// Donations of one donor, oldest first
    pub fn find_by_donor(&self, donor: &DonorKey) -> Result<Vec<Donation>> {
        let keys = self.storage.index_keys(&keys::donor_prefix(donor), None, None)?;
        let mut donations = self.load(&keys)?;
        donations.sort_by_key(|d| (d.created_at, d.id));
        Ok(donations)
    }

    /// Donations of one campaign, optionally of one status, oldest first
    pub fn find_by_campaign(
        &self,
        campaign_id: CampaignId,
        status: Option<DonationStatus>,
    ) -> Result<Vec<Donation>> {
        let prefix = keys::campaign_prefix(campaign_id.as_uuid(), status);
        let keys = self.storage.index_keys(&prefix, None, None)?;
        let mut donations = self.load(&keys)?;
        // Index entries move in the same commit as the record, but the scan
        // and the loads are separate reads
        if let Some(status) = status {
            donations.retain(|d| d.status == status);
        }
        donations.sort_by_key(|d| (d.created_at, d.id));
        Ok(donations)
    }

    /// Donations in `status` created in `[from, to)`, oldest first
    pub fn scan_status(
        &self,
        status: DonationStatus,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<Donation>> {
        let prefix = keys::status_prefix(status);
        let start = from.map(|at| keys::status_bound(status, at));
        let end = to.map(|at| keys::status_bound(status, at));
        let keys = self
            .storage
            .index_keys(&prefix, start.as_deref(), end.as_deref())?;
        let mut donations = self.load(&keys)?;
        donations.retain(|d| d.status == status);
        Ok(donations)
    }

    /// Filtered admin listing, newest first
    pub fn query(&self, filter: &DonationFilter, page: PageRequest) -> Result<Page<Donation>> {
        filter.validate()?;

        let mut candidates = if let Some(campaign_id) = filter.campaign_id {
            self.find_by_campaign(campaign_id, filter.status)?
        } else if let Some(status) = filter.status {
            self.scan_status(status, filter.created_from, filter.created_to)?
        } else if let Some(donor) = &filter.donor {
            self.find_by_donor(donor)?
        } else {
            self.storage.scan_all::<Donation>(CF_DONATIONS)?
        };

        candidates.retain(|d| filter.matches(d));
        candidates.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let limit = page.effective_limit();
        let total = candidates.len();
        let items = candidates
            .into_iter()
            .skip(page.offset)
            .take(limit)
            .collect();

        Ok(Page {
            items,
            total,
            offset: page.offset,
            limit,
        })
    }

    /// Donations whose aggregate step did not land
    pub fn flagged_for_reconciliation(&self) -> Result<Vec<Donation>> {
        let keys = self
            .storage
            .index_keys(&keys::reconcile_prefix(), None, None)?;
        let mut donations = self.load(&keys)?;
        donations.retain(|d| d.needs_reconciliation);
        Ok(donations)
    }

    /// Replace the stored record if its version is still `expected_version`
    pub(crate) fn update_if_version(
        &self,
        updated: &Donation,
        expected_version: u64,
    ) -> Result<ConditionalWrite<Donation>> {
        let txn = self.storage.transaction();
        let Some(next) = self.stage_update(&txn, updated, expected_version)? else {
            return Ok(ConditionalWrite::Stale);
        };
        Ok(match commit(txn)? {
            ConditionalWrite::Written(()) => ConditionalWrite::Written(next),
            ConditionalWrite::Stale => ConditionalWrite::Stale,
        })
    }

    /// Stage a replacement of the record at `expected_version` into `txn`
    ///
    /// `None` when the stored version has moved on. The staged record gets
    /// version `expected_version + 1`. Index entries follow a status change and
    /// the reconciliation flag. Identity and money fields are immutable.
    pub(crate) fn stage_update(
        &self,
        txn: &Transaction<'_, Db>,
        updated: &Donation,
        expected_version: u64,
    ) -> Result<Option<Donation>> {
        let donations = self.storage.cf(CF_DONATIONS)?;
        let indices = self.storage.cf(CF_INDICES)?;
        let key = updated.id.as_uuid().as_bytes();

        let current: Donation = match txn.get_for_update_cf(&donations, key, true)? {
            Some(bytes) => decode(&bytes)?,
            None => return Err(Error::donation_not_found(updated.id)),
        };

        if current.version != expected_version {
            return Ok(None);
        }

        ensure_immutable_fields(&current, updated)?;

        let mut next = updated.clone();
        next.version = expected_version + 1;

        if current.status != next.status {
            if let Some(campaign_id) = current.campaign_id {
                txn.delete_cf(
                    &indices,
                    keys::campaign_status(
                        campaign_id.as_uuid(),
                        current.status,
                        current.created_at,
                        &current.id,
                    ),
                )?;
                txn.put_cf(
                    &indices,
                    keys::campaign_status(
                        campaign_id.as_uuid(),
                        next.status,
                        next.created_at,
                        &next.id,
                    ),
                    b"",
                )?;
            }
            txn.delete_cf(
                &indices,
                keys::status_created(current.status, current.created_at, &current.id),
            )?;
            txn.put_cf(
                &indices,
                keys::status_created(next.status, next.created_at, &next.id),
                b"",
            )?;
        }

        match (current.needs_reconciliation, next.needs_reconciliation) {
            (false, true) => txn.put_cf(&indices, keys::reconcile(&next.id), b"")?,
            (true, false) => txn.delete_cf(&indices, keys::reconcile(&next.id))?,
            _ => {}
        }

        txn.put_cf(&donations, key, encode(&next)?)?;
        Ok(Some(next))
    }

    fn load(&self, index_keys: &[Box<[u8]>]) -> Result<Vec<Donation>> {
        let mut donations = Vec::with_capacity(index_keys.len());
        for key in index_keys {
            let Some(id) = keys::donation_id_suffix(key) else {
                continue;
            };
            if let Some(donation) = self.find_by_id(id)? {
                donations.push(donation);
            }
        }
        Ok(donations)
    }
}

fn index_entries(donation: &Donation) -> Vec<Vec<u8>> {
    let mut entries = Vec::with_capacity(4);
    if let Some(campaign_id) = donation.campaign_id {
        entries.push(keys::campaign_status(
            campaign_id.as_uuid(),
            donation.status,
            donation.created_at,
            &donation.id,
        ));
    }
    entries.push(keys::status_created(
        donation.status,
        donation.created_at,
        &donation.id,
    ));
    if let Some(donor) = donation.donor.lookup_key() {
        entries.push(keys::donor(&donor, &donation.id));
    }
    if donation.needs_reconciliation {
        entries.push(keys::reconcile(&donation.id));
    }
    entries
}

fn ensure_immutable_fields(current: &Donation, updated: &Donation) -> Result<()> {
    let unchanged = current.id == updated.id
        && current.amount == updated.amount
        && current.currency == updated.currency
        && current.donor == updated.donor
        && current.campaign_id == updated.campaign_id
        && current.created_at == updated.created_at;
    if unchanged {
        Ok(())
    } else {
        Err(Error::InvariantViolation(format!(
            "Immutable fields of donation {} changed",
            current.id
        )))
    }
}
