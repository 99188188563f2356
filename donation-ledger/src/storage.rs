//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `donations` - Donation records (key: donation_id)
//! - `campaigns` - Campaign records (key: campaign_id)
//! - `indices` - Secondary indices, tag byte first:
//!   - `c` campaign_id || status || created_at || donation_id
//!   - `s` status || created_at || donation_id
//!   - `d` donor_key || 0x00 || donation_id
//!   - `r` donation_id (flagged for reconciliation)
//!
//! The database is an optimistic transaction DB. Conditional writes read the
//! record with `get_for_update` and commit; a concurrent committed write to
//! the same key makes the commit fail with `Busy`/`TryAgain`, which the stores
//! report as a stale write instead of an error.

use crate::{
    error::{Error, Result},
    types::{DonationId, DonationStatus, DonorKey},
    Config,
};
use chrono::{DateTime, Utc};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, Direction, ErrorKind,
    IteratorMode, MultiThreaded, OptimisticTransactionDB, Options, Transaction,
};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Column family names
pub(crate) const CF_DONATIONS: &str = "donations";
pub(crate) const CF_CAMPAIGNS: &str = "campaigns";
pub(crate) const CF_INDICES: &str = "indices";

pub(crate) type Db = OptimisticTransactionDB<MultiThreaded>;

/// Outcome of a version-checked write
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionalWrite<T> {
    /// Committed; carries the stored record
    Written(T),
    /// Another writer got there first; re-read and retry
    Stale,
}

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Db,
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);
        db_opts.set_compaction_style(DBCompactionStyle::Level);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_DONATIONS, Self::cf_options_records()),
            ColumnFamilyDescriptor::new(CF_CAMPAIGNS, Self::cf_options_records()),
            ColumnFamilyDescriptor::new(CF_INDICES, Self::cf_options_indices()),
        ];

        let db = Db::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened donation ledger storage");

        Ok(Self { db })
    }

    fn cf_options_records() -> Options {
        let mut opts = Options::default();
        // Records are read on every transition, favour speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_indices() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    pub(crate) fn db(&self) -> &Db {
        &self.db
    }

    /// Optimistic transaction; stores stage their writes into it
    pub(crate) fn transaction(&self) -> Transaction<'_, Db> {
        self.db.transaction()
    }

    pub(crate) fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    /// Point read and decode
    pub(crate) fn get<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(&cf, key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Decode every value of a column family
    pub(crate) fn scan_all<T: DeserializeOwned>(&self, cf_name: &str) -> Result<Vec<T>> {
        let cf = self.cf(cf_name)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    /// Index keys in `[start, end)` that also begin with `prefix`
    pub(crate) fn index_keys(
        &self,
        prefix: &[u8],
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<Vec<Box<[u8]>>> {
        let cf = self.cf(CF_INDICES)?;
        let from = start.unwrap_or(prefix);
        let mut keys = Vec::new();
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(from, Direction::Forward))
        {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            if let Some(end) = end {
                if &key[..] >= end {
                    break;
                }
            }
            keys.push(key);
        }
        Ok(keys)
    }

    /// Approximate number of keys per column family
    pub fn stats(&self) -> Result<StorageStats> {
        let donations = self.cf(CF_DONATIONS)?;
        let campaigns = self.cf(CF_CAMPAIGNS)?;
        let indices = self.cf(CF_INDICES)?;

        Ok(StorageStats {
            approx_donations: self.approximate_count(&donations)?,
            approx_campaigns: self.approximate_count(&campaigns)?,
            approx_index_entries: self.approximate_count(&indices)?,
        })
    }

    fn approximate_count(&self, cf: &Arc<BoundColumnFamily<'_>>) -> Result<u64> {
        let prop = self
            .db
            .property_int_value_cf(cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0);
        Ok(prop)
    }
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StorageStats {
    /// Estimated donation records
    pub approx_donations: u64,
    /// Estimated campaign records
    pub approx_campaigns: u64,
    /// Estimated index entries
    pub approx_index_entries: u64,
}

/// Commit error that signals a lost optimistic race
pub(crate) fn is_write_conflict(err: &rocksdb::Error) -> bool {
    matches!(err.kind(), ErrorKind::Busy | ErrorKind::TryAgain)
}

/// Commit, reporting a lost optimistic race as [`ConditionalWrite::Stale`]
pub(crate) fn commit(txn: Transaction<'_, Db>) -> Result<ConditionalWrite<()>> {
    match txn.commit() {
        Ok(()) => Ok(ConditionalWrite::Written(())),
        Err(e) if is_write_conflict(&e) => Ok(ConditionalWrite::Stale),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Index key builders
pub(crate) mod keys {
    use super::*;

    const TAG_CAMPAIGN: u8 = b'c';
    const TAG_STATUS: u8 = b's';
    const TAG_DONOR: u8 = b'd';
    const TAG_RECONCILE: u8 = b'r';

    /// Big-endian, sign-flipped millis so byte order matches time order
    pub(crate) fn time_bytes(at: DateTime<Utc>) -> [u8; 8] {
        ((at.timestamp_millis() as u64) ^ (1u64 << 63)).to_be_bytes()
    }

    pub(crate) fn campaign_prefix(campaign: &Uuid, status: Option<DonationStatus>) -> Vec<u8> {
        let mut key = Vec::with_capacity(18);
        key.push(TAG_CAMPAIGN);
        key.extend_from_slice(campaign.as_bytes());
        if let Some(status) = status {
            key.push(status.as_u8());
        }
        key
    }

    pub(crate) fn campaign_status(
        campaign: &Uuid,
        status: DonationStatus,
        created_at: DateTime<Utc>,
        donation: &DonationId,
    ) -> Vec<u8> {
        let mut key = campaign_prefix(campaign, Some(status));
        key.extend_from_slice(&time_bytes(created_at));
        key.extend_from_slice(donation.as_uuid().as_bytes());
        key
    }

    pub(crate) fn status_prefix(status: DonationStatus) -> Vec<u8> {
        vec![TAG_STATUS, status.as_u8()]
    }

    pub(crate) fn status_bound(status: DonationStatus, at: DateTime<Utc>) -> Vec<u8> {
        let mut key = status_prefix(status);
        key.extend_from_slice(&time_bytes(at));
        key
    }

    pub(crate) fn status_created(
        status: DonationStatus,
        created_at: DateTime<Utc>,
        donation: &DonationId,
    ) -> Vec<u8> {
        let mut key = status_bound(status, created_at);
        key.extend_from_slice(donation.as_uuid().as_bytes());
        key
    }

    pub(crate) fn donor_prefix(donor: &DonorKey) -> Vec<u8> {
        let mut key = vec![TAG_DONOR];
        match donor {
            DonorKey::User(user) => {
                key.push(b'u');
                key.extend_from_slice(user.as_str().as_bytes());
            }
            DonorKey::Email(email) => {
                key.push(b'e');
                key.extend_from_slice(email.as_bytes());
            }
        }
        key.push(0);
        key
    }

    pub(crate) fn donor(donor: &DonorKey, donation: &DonationId) -> Vec<u8> {
        let mut key = donor_prefix(donor);
        key.extend_from_slice(donation.as_uuid().as_bytes());
        key
    }

    pub(crate) fn reconcile_prefix() -> Vec<u8> {
        vec![TAG_RECONCILE]
    }

    pub(crate) fn reconcile(donation: &DonationId) -> Vec<u8> {
        let mut key = reconcile_prefix();
        key.extend_from_slice(donation.as_uuid().as_bytes());
        key
    }

    /// Every index key ends with the donation ID
    pub(crate) fn donation_id_suffix(key: &[u8]) -> Option<DonationId> {
        if key.len() < 16 {
            return None;
        }
        let bytes: [u8; 16] = key[key.len() - 16..].try_into().ok()?;
        Some(DonationId::from_uuid(Uuid::from_bytes(bytes)))
    }
}
