//! Donation state machine
//!
//! ```text
//! pending   -> completed, failed
//! completed -> refunded        (admin only)
//! failed    -> completed       (admin only)
//! refunded  -> (terminal)
//! ```
//!
//! [`TransitionEngine`] is the only writer of a donation's status and of a
//! campaign's aggregates. A transition re-reads the donation, validates the
//! edge, then stages the new status and the campaign delta into one optimistic
//! transaction conditioned on both records' versions. Either both land or
//! neither does; a lost race restarts from the read.
//!
//! A delta the campaign cannot take (campaign deleted, or a result below zero)
//! does not block the status change. The donation commits flagged for
//! reconciliation instead.

use crate::{
    campaigns::{CampaignStore, StagedDelta},
    donations::DonationStore,
    error::{Error, Result},
    metrics::Metrics,
    retry::RetryPolicy,
    storage::{commit, ConditionalWrite, Db, Storage},
    types::{
        Actor, AdminNote, AggregateDelta, CampaignId, Donation, DonationId, DonationStatus,
        FollowUp, ReceiptDetails, StatusChange, MAX_NOTE_LEN,
    },
};
use chrono::Utc;
use rocksdb::Transaction;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// How a requested status relates to the stored one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    /// Legal edge; persist it
    Apply,
    /// Already there (duplicate confirmation); nothing to write
    AlreadyApplied,
}

/// Validate `from -> to` for `actor`
pub fn check_edge(from: DonationStatus, to: DonationStatus, actor: &Actor) -> Result<Edge> {
    use DonationStatus::*;

    let invalid = |reason: &str| Error::InvalidTransition {
        from,
        to,
        reason: reason.to_string(),
    };

    match (from, to) {
        (Refunded, _) => Err(invalid("refunded donations are terminal")),
        (_, Pending) => Err(invalid("donations never return to pending")),
        (Completed, Completed) | (Failed, Failed) => Ok(Edge::AlreadyApplied),
        (Pending, Completed) | (Pending, Failed) => Ok(Edge::Apply),
        (Completed, Refunded) | (Failed, Completed) => {
            if actor.is_admin() {
                Ok(Edge::Apply)
            } else {
                Err(invalid("requires an administrator"))
            }
        }
        _ => Err(invalid("no such edge")),
    }
}

/// Change to the campaign aggregate caused by `from -> to`
pub fn aggregate_delta(from: DonationStatus, to: DonationStatus, amount: Decimal) -> AggregateDelta {
    match (from.counts_toward_aggregate(), to.counts_toward_aggregate()) {
        (false, true) => AggregateDelta::credit(amount),
        (true, false) => AggregateDelta::debit(amount),
        _ => AggregateDelta::ZERO,
    }
}

/// What happened to the campaign aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateEffect {
    /// No campaign, or the delta was zero
    Unchanged,
    /// Delta applied; totals after the write
    Applied {
        /// Campaign `raised` after the write
        raised: Decimal,
        /// Campaign `donors_count` after the write
        donors_count: u64,
    },
    /// Delta did not land; the donation is flagged for reconciliation
    FlaggedForReconciliation,
}

/// Result of a transition request
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionOutcome {
    /// Donation as stored after the request
    pub donation: Donation,
    /// Status read before the write
    pub previous_status: DonationStatus,
    /// Delta computed for the campaign
    pub delta: AggregateDelta,
    /// Attempts used, 1 when there was no contention
    pub attempts: u32,
    /// Aggregate result
    pub aggregate: AggregateEffect,
}

impl TransitionOutcome {
    /// Whether the status actually changed
    pub fn changed(&self) -> bool {
        self.previous_status != self.donation.status
    }

    fn metric_label(&self) -> &'static str {
        match self.aggregate {
            _ if !self.changed() => "noop",
            AggregateEffect::FlaggedForReconciliation => "flagged",
            _ => "applied",
        }
    }
}

/// Status transition engine
pub struct TransitionEngine {
    storage: Arc<Storage>,
    donations: Arc<DonationStore>,
    campaigns: Arc<CampaignStore>,
    retry: RetryPolicy,
    metrics: Arc<Metrics>,
}

impl TransitionEngine {
    /// Create new engine
    pub fn new(
        storage: Arc<Storage>,
        donations: Arc<DonationStore>,
        campaigns: Arc<CampaignStore>,
        retry: RetryPolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            storage,
            donations,
            campaigns,
            retry,
            metrics,
        }
    }

    /// Move a donation to `to`
    ///
    /// Duplicate requests for the current status of a completed or failed
    /// donation return it unchanged without writing.
    pub async fn transition(
        &self,
        id: DonationId,
        to: DonationStatus,
        actor: Actor,
    ) -> Result<TransitionOutcome> {
        let started = Instant::now();
        let result = self.run_transition(id, to, &actor).await;
        self.observe(started, &result);
        result
    }

    fn observe(&self, started: Instant, result: &Result<TransitionOutcome>) {
        let label = match result {
            Ok(outcome) => outcome.metric_label(),
            Err(Error::InvalidTransition { .. }) => "invalid",
            Err(Error::NotFound { .. }) => "not_found",
            Err(Error::Conflict(_)) => "conflict",
            Err(_) => "error",
        };
        self.metrics
            .record_transition(label, started.elapsed().as_secs_f64());
    }

    async fn run_transition(
        &self,
        id: DonationId,
        to: DonationStatus,
        actor: &Actor,
    ) -> Result<TransitionOutcome> {
        validate_actor(actor)?;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let current = self.donations.get(id)?;
            let from = current.status;

            if check_edge(from, to, actor)? == Edge::AlreadyApplied {
                debug!(donation_id = %id, status = %from, "Transition already applied");
                return Ok(TransitionOutcome {
                    donation: current,
                    previous_status: from,
                    delta: AggregateDelta::ZERO,
                    attempts: attempt,
                    aggregate: AggregateEffect::Unchanged,
                });
            }

            let delta = aggregate_delta(from, to, current.amount);
            let mut next = apply_status(&current, to, actor);
            let target = next.campaign_id.filter(|_| !delta.is_zero());

            let (aggregate, committed) = {
                let txn = self.storage.transaction();
                let aggregate = self.stage_delta(&txn, &mut next, target, delta)?;
                let committed = match self.donations.stage_update(&txn, &next, current.version)? {
                    Some(stored) => match commit(txn)? {
                        ConditionalWrite::Written(()) => Some(stored),
                        ConditionalWrite::Stale => None,
                    },
                    None => None,
                };
                (aggregate, committed)
            };

            if let Some(donation) = committed {
                info!(
                    donation_id = %id,
                    campaign_id = ?donation.campaign_id,
                    from = %from,
                    to = %to,
                    actor = actor.label(),
                    attempt,
                    "Donation transitioned"
                );
                if aggregate == AggregateEffect::FlaggedForReconciliation {
                    self.metrics.record_reconciliation_flag();
                }
                return Ok(TransitionOutcome {
                    donation,
                    previous_status: from,
                    delta,
                    attempts: attempt,
                    aggregate,
                });
            }

            // Campaign-wide contention gets the larger attempt budget
            let max_attempts = if target.is_some() {
                self.metrics.record_aggregate_conflicts(1);
                self.retry.aggregate_max_attempts()
            } else {
                self.retry.max_attempts()
            };
            warn!(donation_id = %id, from = %from, to = %to, attempt, "Transition raced, retrying");
            self.metrics.record_retry();
            if attempt >= max_attempts {
                return Err(Error::Conflict(format!(
                    "Donation {} stayed contended for {} attempts",
                    id, attempt
                )));
            }
            tokio::time::sleep(self.retry.delay_for(attempt)).await;
        }
    }

    /// Record a donation whose payment is already confirmed
    ///
    /// `pending` is a fresh record that was never stored. It is written as
    /// `completed` together with its campaign credit in one commit, so a failure
    /// leaves no record behind.
    pub(crate) async fn record_confirmed(
        &self,
        pending: Donation,
        transaction_id: String,
    ) -> Result<TransitionOutcome> {
        let started = Instant::now();
        let result = self.run_confirmed(pending, transaction_id).await;
        self.observe(started, &result);
        result
    }

    async fn run_confirmed(
        &self,
        pending: Donation,
        transaction_id: String,
    ) -> Result<TransitionOutcome> {
        let actor = Actor::PaymentGateway {
            transaction_id: Some(transaction_id),
        };
        let delta = aggregate_delta(pending.status, DonationStatus::Completed, pending.amount);
        let max_attempts = self.retry.aggregate_max_attempts();

        for attempt in 1..=max_attempts {
            let next = apply_status(&pending, DonationStatus::Completed, &actor);
            let (aggregate, written) = {
                let txn = self.storage.transaction();
                let aggregate = match next.campaign_id {
                    Some(campaign_id) => {
                        match self.campaigns.stage_aggregate_delta(&txn, campaign_id, delta)? {
                            StagedDelta::Applied(campaign) => AggregateEffect::Applied {
                                raised: campaign.raised,
                                donors_count: campaign.donors_count,
                            },
                            StagedDelta::Missing => {
                                return Err(Error::campaign_not_found(campaign_id))
                            }
                            StagedDelta::Refused(reason) => return Err(reason),
                        }
                    }
                    None => AggregateEffect::Unchanged,
                };
                self.donations.stage_insert(&txn, &next)?;
                (aggregate, commit(txn)?)
            };

            match written {
                ConditionalWrite::Written(()) => {
                    info!(
                        donation_id = %next.id,
                        campaign_id = ?next.campaign_id,
                        attempt,
                        "Confirmed donation recorded"
                    );
                    return Ok(TransitionOutcome {
                        donation: next,
                        previous_status: pending.status,
                        delta,
                        attempts: attempt,
                        aggregate,
                    });
                }
                ConditionalWrite::Stale => {
                    warn!(donation_id = %next.id, attempt, "Confirmed intake raced, retrying");
                    self.metrics.record_retry();
                    if attempt < max_attempts {
                        tokio::time::sleep(self.retry.delay_for(attempt)).await;
                    }
                }
            }
        }

        Err(Error::Conflict(format!(
            "Donation {} could not be recorded after {} attempts",
            pending.id, max_attempts
        )))
    }

    /// Stage the campaign side of a transition, flagging `next` when the
    /// campaign cannot take the delta
    fn stage_delta(
        &self,
        txn: &Transaction<'_, Db>,
        next: &mut Donation,
        target: Option<CampaignId>,
        delta: AggregateDelta,
    ) -> Result<AggregateEffect> {
        let Some(campaign_id) = target else {
            return Ok(AggregateEffect::Unchanged);
        };

        let reason = match self.campaigns.stage_aggregate_delta(txn, campaign_id, delta)? {
            StagedDelta::Applied(campaign) => {
                return Ok(AggregateEffect::Applied {
                    raised: campaign.raised,
                    donors_count: campaign.donors_count,
                })
            }
            StagedDelta::Missing => Error::campaign_not_found(campaign_id),
            StagedDelta::Refused(reason) => reason,
        };

        error!(
            donation_id = %next.id,
            campaign_id = %campaign_id,
            raised_delta = %delta.raised,
            donors_delta = delta.donors,
            error = %reason,
            "Campaign cannot take the delta, flagging for reconciliation"
        );
        next.needs_reconciliation = true;
        Ok(AggregateEffect::FlaggedForReconciliation)
    }

    /// Record that a receipt went out
    pub async fn record_receipt(
        &self,
        id: DonationId,
        receipt_number: impl Into<String>,
    ) -> Result<Donation> {
        let receipt_number = receipt_number.into();
        if receipt_number.trim().is_empty() {
            return Err(Error::Validation("Receipt number is required".to_string()));
        }
        self.annotate(id, |donation| {
            require_completed(donation, "receipts")?;
            donation.receipt = Some(ReceiptDetails {
                receipt_number: receipt_number.clone(),
                sent_at: Utc::now(),
            });
            Ok(())
        })
        .await
    }

    /// Record that the donor was thanked
    pub async fn record_thank_you(&self, id: DonationId) -> Result<Donation> {
        self.annotate(id, |donation| {
            require_completed(donation, "thank-you messages")?;
            donation.thank_you_sent = true;
            donation.thank_you_sent_at.get_or_insert_with(Utc::now);
            Ok(())
        })
        .await
    }

    /// Append an admin note
    pub async fn add_admin_note(
        &self,
        id: DonationId,
        author: impl Into<String>,
        note: impl Into<String>,
    ) -> Result<Donation> {
        let author = author.into();
        let note = note.into();
        validate_note(&note)?;
        if author.trim().is_empty() {
            return Err(Error::Validation("Note author is required".to_string()));
        }
        self.annotate(id, |donation| {
            donation.admin_notes.push(AdminNote {
                author: author.clone(),
                note: note.clone(),
                at: Utc::now(),
            });
            Ok(())
        })
        .await
    }

    /// Replace follow-up tracking
    pub async fn set_follow_up(&self, id: DonationId, follow_up: FollowUp) -> Result<Donation> {
        if let Some(notes) = &follow_up.notes {
            validate_note(notes)?;
        }
        self.annotate(id, |donation| {
            donation.follow_up = follow_up.clone();
            Ok(())
        })
        .await
    }

    /// Version-checked write that leaves status and money alone
    async fn annotate<F>(&self, id: DonationId, mut change: F) -> Result<Donation>
    where
        F: FnMut(&mut Donation) -> Result<()>,
    {
        let max_attempts = self.retry.max_attempts();

        for attempt in 1..=max_attempts {
            let current = self.donations.get(id)?;
            let mut next = current.clone();
            change(&mut next)?;
            next.updated_at = Utc::now();

            match self.donations.update_if_version(&next, current.version)? {
                ConditionalWrite::Written(stored) => return Ok(stored),
                ConditionalWrite::Stale => {
                    debug!(donation_id = %id, attempt, "Donation annotation raced, retrying");
                    self.metrics.record_retry();
                    if attempt < max_attempts {
                        tokio::time::sleep(self.retry.delay_for(attempt)).await;
                    }
                }
            }
        }

        Err(Error::Conflict(format!(
            "Donation {} stayed contended for {} attempts",
            id, max_attempts
        )))
    }
}

/// New record for `current -> to`; the caller has validated the edge
fn apply_status(current: &Donation, to: DonationStatus, actor: &Actor) -> Donation {
    let now = Utc::now();
    let mut next = current.clone();
    next.status = to;
    next.updated_at = now;
    next.stamp_entry(to, now);
    next.history.push(StatusChange {
        from: current.status,
        to,
        actor: actor.clone(),
        at: now,
    });

    match actor {
        Actor::PaymentGateway {
            transaction_id: Some(transaction_id),
        } => {
            next.transaction_id.get_or_insert_with(|| transaction_id.clone());
        }
        Actor::Admin {
            admin_id,
            reason,
            notes,
        } => {
            let note = match (reason, notes) {
                (Some(reason), Some(notes)) => Some(format!("{}: {}", reason, notes)),
                (Some(text), None) | (None, Some(text)) => Some(text.clone()),
                (None, None) => None,
            };
            if let Some(note) = note {
                next.admin_notes.push(AdminNote {
                    author: admin_id.clone(),
                    note: format!("[{} -> {}] {}", current.status, to, note),
                    at: now,
                });
            }
        }
        _ => {}
    }

    next
}

fn validate_actor(actor: &Actor) -> Result<()> {
    if let Actor::Admin {
        admin_id,
        reason,
        notes,
    } = actor
    {
        if admin_id.trim().is_empty() {
            return Err(Error::Validation("Admin id is required".to_string()));
        }
        for text in [reason, notes].into_iter().flatten() {
            validate_note(text)?;
        }
    }
    Ok(())
}

fn validate_note(note: &str) -> Result<()> {
    if note.trim().is_empty() {
        return Err(Error::Validation("Note cannot be empty".to_string()));
    }
    if note.chars().count() > MAX_NOTE_LEN {
        return Err(Error::Validation(format!(
            "Note exceeds {} characters",
            MAX_NOTE_LEN
        )));
    }
    Ok(())
}

fn require_completed(donation: &Donation, what: &str) -> Result<()> {
    if donation.status == DonationStatus::Completed {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "Only completed donations get {} (donation {} is {})",
            what, donation.id, donation.status
        )))
    }
}
