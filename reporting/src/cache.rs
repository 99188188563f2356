//! TTL cache for report views
//!
//! Entries are type-erased so one map serves every view. A view older than the
//! TTL is recomputed on the next read; nothing is refreshed in the background.
//! Expired views under any key are dropped whenever a view is stored.

use crate::{DateRange, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Identity of a cached view
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ViewKey {
    /// Completed totals per day
    TotalsByDay(Option<DateRange>),
    /// Completed totals per campaign
    TotalsByCampaign,
    /// Completed totals per payment method
    TotalsByPaymentMethod,
    /// Highest-raising campaigns
    TopCampaigns(usize),
    /// Period overview
    Summary(DateRange),
}

struct CachedView {
    generated_at: DateTime<Utc>,
    inserted: Instant,
    value: Arc<dyn Any + Send + Sync>,
}

/// A computed view and when it was computed
#[derive(Debug, Clone, Serialize)]
pub struct Report<T> {
    /// Computation time
    pub generated_at: DateTime<Utc>,
    /// After this the view is recomputed
    pub stale_after: DateTime<Utc>,
    /// View data
    pub data: T,
}

impl<T: Serialize> Report<T> {
    /// Export as pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Shared view cache
pub struct ViewCache {
    entries: Arc<DashMap<ViewKey, CachedView>>,
    ttl: Duration,
}

impl ViewCache {
    /// Cache holding views for `ttl`
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
        }
    }

    /// Configured TTL
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached value for `key`, or compute and store it
    ///
    /// Concurrent misses may both compute; the last insert wins.
    pub fn get_or_compute<T, F>(&self, key: ViewKey, compute: F) -> Result<Report<T>>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Result<T>,
    {
        if let Some(entry) = self.entries.get(&key) {
            if entry.inserted.elapsed() < self.ttl {
                if let Some(value) = entry.value.downcast_ref::<T>() {
                    return Ok(self.report(entry.generated_at, value.clone()));
                }
            }
        }

        debug!(?key, "Computing report view");
        let value = compute()?;
        let generated_at = Utc::now();
        let ttl = self.ttl;
        self.entries.retain(|_, cached| cached.inserted.elapsed() < ttl);
        self.entries.insert(
            key,
            CachedView {
                generated_at,
                inserted: Instant::now(),
                value: Arc::new(value.clone()),
            },
        );
        Ok(self.report(generated_at, value))
    }

    /// Drop every cached view
    pub fn invalidate(&self) {
        self.entries.clear();
    }

    /// Number of cached views, including expired ones not yet evicted
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No cached views
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn report<T>(&self, generated_at: DateTime<Utc>, data: T) -> Report<T> {
        let stale_after = chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| generated_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Report {
            generated_at,
            stale_after,
            data,
        }
    }
}
