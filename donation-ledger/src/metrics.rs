//! Metrics collection for observability
//!
//! Prometheus metrics for monitoring the ledger. Each [`Metrics`] owns its
//! registry, so several ledgers can live in one process (tests, tools).
//!
//! # Metrics
//!
//! - `donation_transitions_total{outcome}` - Transition results
//! - `donation_transition_retries_total` - Optimistic retries of a transition
//! - `donation_transition_duration_seconds` - Transition latency
//! - `donation_intake_total{result}` - Intake results
//! - `campaign_aggregate_conflicts_total` - Lost CAS races on campaign aggregates
//! - `donation_reconciliation_flags_total` - Donations flagged for reconciliation
//! - `reconciliation_drift_corrections_total` - Campaigns corrected by the sweep

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Transition results by outcome
    pub transitions: IntCounterVec,

    /// Optimistic retries of a transition
    pub transition_retries: IntCounter,

    /// Transition latency
    pub transition_duration: Histogram,

    /// Intake results
    pub intake: IntCounterVec,

    /// Lost CAS races on campaign aggregates
    pub aggregate_conflicts: IntCounter,

    /// Donations flagged for reconciliation
    pub reconciliation_flags: IntCounter,

    /// Campaigns whose aggregates the sweep corrected
    pub drift_corrections: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let transitions = IntCounterVec::new(
            Opts::new("donation_transitions_total", "Donation transition results"),
            &["outcome"],
        )?;
        registry.register(Box::new(transitions.clone()))?;

        let transition_retries = IntCounter::new(
            "donation_transition_retries_total",
            "Optimistic retries of donation transitions",
        )?;
        registry.register(Box::new(transition_retries.clone()))?;

        let transition_duration = Histogram::with_opts(
            HistogramOpts::new(
                "donation_transition_duration_seconds",
                "Donation transition latency",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 1.0]),
        )?;
        registry.register(Box::new(transition_duration.clone()))?;

        let intake = IntCounterVec::new(
            Opts::new("donation_intake_total", "Donation intake results"),
            &["result"],
        )?;
        registry.register(Box::new(intake.clone()))?;

        let aggregate_conflicts = IntCounter::new(
            "campaign_aggregate_conflicts_total",
            "Lost compare-and-swap races on campaign aggregates",
        )?;
        registry.register(Box::new(aggregate_conflicts.clone()))?;

        let reconciliation_flags = IntCounter::new(
            "donation_reconciliation_flags_total",
            "Donations flagged for reconciliation",
        )?;
        registry.register(Box::new(reconciliation_flags.clone()))?;

        let drift_corrections = IntCounter::new(
            "reconciliation_drift_corrections_total",
            "Campaign aggregates corrected by the reconciliation sweep",
        )?;
        registry.register(Box::new(drift_corrections.clone()))?;

        Ok(Self {
            transitions,
            transition_retries,
            transition_duration,
            intake,
            aggregate_conflicts,
            reconciliation_flags,
            drift_corrections,
            registry,
        })
    }

    /// Record a transition result
    pub fn record_transition(&self, outcome: &str, duration_seconds: f64) {
        self.transitions.with_label_values(&[outcome]).inc();
        self.transition_duration.observe(duration_seconds);
    }

    /// Record an optimistic retry
    pub fn record_retry(&self) {
        self.transition_retries.inc();
    }

    /// Record an intake result
    pub fn record_intake(&self, result: &str) {
        self.intake.with_label_values(&[result]).inc();
    }

    /// Record lost CAS races on an aggregate
    pub fn record_aggregate_conflicts(&self, count: u32) {
        self.aggregate_conflicts.inc_by(u64::from(count));
    }

    /// Record a reconciliation flag
    pub fn record_reconciliation_flag(&self) {
        self.reconciliation_flags.inc();
    }

    /// Record a sweep correction
    pub fn record_drift_correction(&self) {
        self.drift_corrections.inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition format
    pub fn export(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
