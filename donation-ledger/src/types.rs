//! Core types for the donation ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (Decimal for money)
//! - Explicit variants instead of optional-field conventions

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Maximum length of a donor message
pub const MAX_MESSAGE_LEN: usize = 1_000;

/// Maximum length of a single admin note
pub const MAX_NOTE_LEN: usize = 2_000;

/// Donation identifier (UUIDv7, time-ordered)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DonationId(Uuid);

impl DonationId {
    /// Generate a fresh identifier
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for DonationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DonationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Campaign identifier (UUIDv7, time-ordered)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CampaignId(Uuid);

impl CampaignId {
    /// Generate a fresh identifier
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CampaignId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CampaignId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Platform user identifier, issued by the external auth collaborator
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Create new user ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ISO 4217 currency code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Currency {
    /// US Dollar
    USD,
    /// Euro
    EUR,
    /// British Pound
    GBP,
    /// Canadian Dollar
    CAD,
    /// Australian Dollar
    AUD,
    /// UAE Dirham
    AED,
    /// Indian Rupee
    INR,
}

impl Currency {
    /// ISO 4217 code
    pub fn code(&self) -> &'static str {
        match self {
            Currency::USD => "USD",
            Currency::EUR => "EUR",
            Currency::GBP => "GBP",
            Currency::CAD => "CAD",
            Currency::AUD => "AUD",
            Currency::AED => "AED",
            Currency::INR => "INR",
        }
    }
}

impl FromStr for Currency {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "USD" => Ok(Currency::USD),
            "EUR" => Ok(Currency::EUR),
            "GBP" => Ok(Currency::GBP),
            "CAD" => Ok(Currency::CAD),
            "AUD" => Ok(Currency::AUD),
            "AED" => Ok(Currency::AED),
            "INR" => Ok(Currency::INR),
            other => Err(crate::Error::Validation(format!(
                "Unknown currency code: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Donation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum DonationStatus {
    /// Awaiting payment confirmation
    Pending = 1,
    /// Payment confirmed; counts toward the campaign aggregate
    Completed = 2,
    /// Payment failed
    Failed = 3,
    /// Refunded by an admin (terminal)
    Refunded = 4,
}

impl DonationStatus {
    /// All statuses, in index order
    pub const ALL: [DonationStatus; 4] = [
        DonationStatus::Pending,
        DonationStatus::Completed,
        DonationStatus::Failed,
        DonationStatus::Refunded,
    ];

    /// Whether a donation in this status contributes to `raised`/`donors_count`
    pub fn counts_toward_aggregate(&self) -> bool {
        matches!(self, DonationStatus::Completed)
    }

    /// No outgoing edges
    pub fn is_terminal(&self) -> bool {
        matches!(self, DonationStatus::Refunded)
    }

    /// Byte tag used in index keys
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Inverse of [`DonationStatus::as_u8`]
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(DonationStatus::Pending),
            2 => Some(DonationStatus::Completed),
            3 => Some(DonationStatus::Failed),
            4 => Some(DonationStatus::Refunded),
            _ => None,
        }
    }

    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            DonationStatus::Pending => "pending",
            DonationStatus::Completed => "completed",
            DonationStatus::Failed => "failed",
            DonationStatus::Refunded => "refunded",
        }
    }
}

impl fmt::Display for DonationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DonationStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(DonationStatus::Pending),
            "completed" => Ok(DonationStatus::Completed),
            "failed" => Ok(DonationStatus::Failed),
            "refunded" => Ok(DonationStatus::Refunded),
            other => Err(crate::Error::Validation(format!(
                "Unknown donation status: {}",
                other
            ))),
        }
    }
}

/// How the donor paid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PaymentMethod {
    /// Credit or debit card
    Card,
    /// Bank transfer
    BankTransfer,
    /// PayPal
    PayPal,
    /// Mobile money / wallet
    Mobile,
    /// Cash, recorded by staff
    Cash,
    /// Paper check
    Check,
    /// Anything else
    Other,
}

impl PaymentMethod {
    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Card => "card",
            PaymentMethod::BankTransfer => "bank_transfer",
            PaymentMethod::PayPal => "paypal",
            PaymentMethod::Mobile => "mobile",
            PaymentMethod::Cash => "cash",
            PaymentMethod::Check => "check",
            PaymentMethod::Other => "other",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contact details of a donor without a platform account
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestDonor {
    /// Display name; required unless the donation is anonymous
    pub name: Option<String>,
    /// Contact email
    pub email: Option<String>,
    /// Contact phone
    pub phone: Option<String>,
    /// Postal address
    pub address: Option<String>,
}

impl GuestDonor {
    /// Guest with a name and no contact details
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Add an email address
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Add a phone number
    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    /// Add a postal address
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }
}

/// Who gave the donation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Donor {
    /// Logged-in platform user
    Authenticated {
        /// Platform user ID
        user_id: UserId,
    },
    /// Donor without an account
    Guest(GuestDonor),
}

impl Donor {
    /// Authenticated donor
    pub fn user(user_id: impl Into<String>) -> Self {
        Donor::Authenticated {
            user_id: UserId::new(user_id),
        }
    }

    /// Validate the variant's required fields
    ///
    /// A guest must carry a non-empty name unless the donation is anonymous.
    pub fn validate(&self, anonymous: bool) -> crate::Result<()> {
        match self {
            Donor::Authenticated { user_id } => {
                if user_id.as_str().trim().is_empty() {
                    return Err(crate::Error::Validation(
                        "Authenticated donor requires a user id".to_string(),
                    ));
                }
            }
            Donor::Guest(guest) => {
                let has_name = guest
                    .name
                    .as_deref()
                    .map(|n| !n.trim().is_empty())
                    .unwrap_or(false);
                if !has_name && !anonymous {
                    return Err(crate::Error::Validation(
                        "Guest donor name is required unless the donation is anonymous"
                            .to_string(),
                    ));
                }
                if let Some(email) = guest.email.as_deref() {
                    if !is_plausible_email(email) {
                        return Err(crate::Error::Validation(format!(
                            "Invalid donor email: {}",
                            email
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Key used by the donor index, if the donor is identifiable
    pub fn lookup_key(&self) -> Option<DonorKey> {
        match self {
            Donor::Authenticated { user_id } => Some(DonorKey::User(user_id.clone())),
            Donor::Guest(guest) => guest.email.as_deref().map(DonorKey::email),
        }
    }

    /// Name shown in public listings
    pub fn display_name(&self, anonymous: bool) -> String {
        if anonymous {
            return "Anonymous".to_string();
        }
        match self {
            Donor::Authenticated { user_id } => user_id.to_string(),
            Donor::Guest(guest) => guest.name.clone().unwrap_or_else(|| "Guest".to_string()),
        }
    }
}

fn is_plausible_email(email: &str) -> bool {
    match email.trim().split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
        }
        None => false,
    }
}

/// Donor lookup key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DonorKey {
    /// Authenticated user
    User(UserId),
    /// Guest email (lowercased)
    Email(String),
}

impl DonorKey {
    /// Normalized email key
    pub fn email(email: &str) -> Self {
        DonorKey::Email(email.trim().to_ascii_lowercase())
    }
}

/// Party requesting a status transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Actor {
    /// External payment confirmation (webhook)
    PaymentGateway {
        /// Gateway transaction reference
        transaction_id: Option<String>,
    },
    /// Trusted, pre-authorized administrator
    Admin {
        /// Administrator identifier
        admin_id: String,
        /// Reason for the override
        reason: Option<String>,
        /// Notes appended to the donation
        notes: Option<String>,
    },
    /// Internal process (intake, sweeps)
    System,
}

impl Actor {
    /// Admin-only edges require this
    pub fn is_admin(&self) -> bool {
        matches!(self, Actor::Admin { .. })
    }

    /// Short label for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            Actor::PaymentGateway { .. } => "payment_gateway",
            Actor::Admin { .. } => "admin",
            Actor::System => "system",
        }
    }
}

/// One applied transition, kept on the donation for auditing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    /// Status before
    pub from: DonationStatus,
    /// Status after
    pub to: DonationStatus,
    /// Who requested it
    pub actor: Actor,
    /// When it was persisted
    pub at: DateTime<Utc>,
}

/// Receipt delivery record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptDetails {
    /// Receipt number issued by the delivery collaborator
    pub receipt_number: String,
    /// When it was sent
    pub sent_at: DateTime<Utc>,
}

/// Admin note attached to a donation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminNote {
    /// Author
    pub author: String,
    /// Note body
    pub note: String,
    /// Timestamp
    pub at: DateTime<Utc>,
}

/// Donor follow-up tracking
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowUp {
    /// Whether a follow-up is needed
    pub required: bool,
    /// Due date
    pub due: Option<DateTime<Utc>>,
    /// Free-form notes
    pub notes: Option<String>,
    /// Done
    pub completed: bool,
}

/// Stored donation record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Donation {
    /// Donation ID
    pub id: DonationId,
    /// Amount (exact decimal, positive)
    pub amount: Decimal,
    /// Currency
    pub currency: Currency,
    /// Donor
    pub donor: Donor,
    /// Hide donor identity in public views
    pub anonymous: bool,
    /// Campaign; `None` is the general fund
    pub campaign_id: Option<CampaignId>,
    /// Payment method
    pub payment_method: PaymentMethod,
    /// Current status
    pub status: DonationStatus,
    /// Donor message
    pub message: Option<String>,
    /// Gateway transaction reference
    pub transaction_id: Option<String>,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Last write timestamp
    pub updated_at: DateTime<Utc>,
    /// First entry into `completed`
    pub completed_at: Option<DateTime<Utc>>,
    /// First entry into `failed`
    pub failed_at: Option<DateTime<Utc>>,
    /// First entry into `refunded`
    pub refunded_at: Option<DateTime<Utc>>,
    /// Receipt delivery
    pub receipt: Option<ReceiptDetails>,
    /// Thank-you sent
    pub thank_you_sent: bool,
    /// When the thank-you was sent
    pub thank_you_sent_at: Option<DateTime<Utc>>,
    /// Admin notes
    pub admin_notes: Vec<AdminNote>,
    /// Follow-up
    pub follow_up: FollowUp,
    /// Applied transitions
    pub history: Vec<StatusChange>,
    /// Aggregate step failed after the status write
    pub needs_reconciliation: bool,
    /// Optimistic concurrency token
    pub version: u64,
}

impl Donation {
    /// Set the entry timestamp for `status` unless already set
    pub fn stamp_entry(&mut self, status: DonationStatus, at: DateTime<Utc>) {
        let slot = match status {
            DonationStatus::Completed => &mut self.completed_at,
            DonationStatus::Failed => &mut self.failed_at,
            DonationStatus::Refunded => &mut self.refunded_at,
            DonationStatus::Pending => return,
        };
        slot.get_or_insert(at);
    }

    /// Whether this record contributes to `campaign_id`'s aggregate
    pub fn counts_toward(&self, campaign_id: CampaignId) -> bool {
        self.campaign_id == Some(campaign_id) && self.status.counts_toward_aggregate()
    }
}

/// Intake payload for a new donation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDonation {
    /// Amount
    pub amount: Decimal,
    /// Currency
    pub currency: Currency,
    /// Donor
    pub donor: Donor,
    /// Anonymous flag
    pub anonymous: bool,
    /// Campaign; `None` is the general fund
    pub campaign_id: Option<CampaignId>,
    /// Payment method
    pub payment_method: PaymentMethod,
    /// Donor message
    pub message: Option<String>,
    /// Set when the gateway already confirmed payment; the donation is completed at intake
    pub confirmed_transaction_id: Option<String>,
}

impl NewDonation {
    /// Minimal pending donation
    pub fn new(
        amount: Decimal,
        currency: Currency,
        donor: Donor,
        campaign_id: Option<CampaignId>,
    ) -> Self {
        Self {
            amount,
            currency,
            donor,
            anonymous: false,
            campaign_id,
            payment_method: PaymentMethod::Card,
            message: None,
            confirmed_transaction_id: None,
        }
    }

    /// Field-level validation
    pub fn validate(&self) -> crate::Result<()> {
        if self.amount <= Decimal::ZERO {
            return Err(crate::Error::Validation(
                "Amount must be positive".to_string(),
            ));
        }
        self.donor.validate(self.anonymous)?;
        if let Some(message) = &self.message {
            if message.chars().count() > MAX_MESSAGE_LEN {
                return Err(crate::Error::Validation(format!(
                    "Message exceeds {} characters",
                    MAX_MESSAGE_LEN
                )));
            }
        }
        Ok(())
    }

    /// Build the stored record (status `pending`, version 1)
    pub fn into_donation(self, id: DonationId, now: DateTime<Utc>) -> Donation {
        Donation {
            id,
            amount: self.amount,
            currency: self.currency,
            donor: self.donor,
            anonymous: self.anonymous,
            campaign_id: self.campaign_id,
            payment_method: self.payment_method,
            status: DonationStatus::Pending,
            message: self.message,
            transaction_id: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            failed_at: None,
            refunded_at: None,
            receipt: None,
            thank_you_sent: false,
            thank_you_sent_at: None,
            admin_notes: Vec::new(),
            follow_up: FollowUp::default(),
            history: Vec::new(),
            needs_reconciliation: false,
            version: 1,
        }
    }
}

/// Campaign status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CampaignStatus {
    /// Not yet published
    Draft,
    /// Accepting donations
    Active,
    /// Closed after reaching its end
    Completed,
    /// Closed early
    Cancelled,
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Active => "active",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Stored campaign record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    /// Campaign ID
    pub id: CampaignId,
    /// Title
    pub title: String,
    /// Description
    pub description: Option<String>,
    /// Funding goal
    pub goal: Decimal,
    /// Currency of goal, minimum and aggregate
    pub currency: Currency,
    /// Σ amount of completed donations (owned by the transition engine)
    pub raised: Decimal,
    /// Count of completed donations (owned by the transition engine)
    pub donors_count: u64,
    /// Status
    pub status: CampaignStatus,
    /// Start of the donation window
    pub start_date: DateTime<Utc>,
    /// End of the donation window
    pub end_date: DateTime<Utc>,
    /// Keep accepting after `end_date`
    pub allow_donations_after_end: bool,
    /// Smallest accepted donation
    pub minimum_donation: Decimal,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Last write timestamp
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency token
    pub version: u64,
}

impl Campaign {
    /// raised / goal × 100, two decimal places; saturates at `Decimal::MAX`
    pub fn funding_percentage(&self) -> Decimal {
        if self.goal <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.raised
            .checked_div(self.goal)
            .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
            .map(|pct| pct.round_dp(2))
            .unwrap_or(Decimal::MAX)
    }

    /// Past `end_date`
    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        now > self.end_date
    }

    /// Goal minus raised, floored at zero
    pub fn remaining(&self) -> Decimal {
        (self.goal - self.raised).max(Decimal::ZERO)
    }
}

/// Payload for creating a campaign
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCampaign {
    /// Title
    pub title: String,
    /// Description
    pub description: Option<String>,
    /// Funding goal
    pub goal: Decimal,
    /// Currency
    pub currency: Currency,
    /// Initial status
    pub status: CampaignStatus,
    /// Start of the donation window
    pub start_date: DateTime<Utc>,
    /// End of the donation window
    pub end_date: DateTime<Utc>,
    /// Keep accepting after `end_date`
    pub allow_donations_after_end: bool,
    /// Smallest accepted donation
    pub minimum_donation: Decimal,
}

impl NewCampaign {
    /// Field-level validation
    pub fn validate(&self) -> crate::Result<()> {
        if self.title.trim().is_empty() {
            return Err(crate::Error::Validation(
                "Campaign title is required".to_string(),
            ));
        }
        if self.goal <= Decimal::ZERO {
            return Err(crate::Error::Validation(
                "Campaign goal must be positive".to_string(),
            ));
        }
        if self.minimum_donation < Decimal::ZERO {
            return Err(crate::Error::Validation(
                "Minimum donation cannot be negative".to_string(),
            ));
        }
        if self.end_date < self.start_date {
            return Err(crate::Error::Validation(
                "Campaign end date precedes its start date".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the stored record with zeroed aggregates
    pub fn into_campaign(self, id: CampaignId, now: DateTime<Utc>) -> Campaign {
        Campaign {
            id,
            title: self.title,
            description: self.description,
            goal: self.goal,
            currency: self.currency,
            raised: Decimal::ZERO,
            donors_count: 0,
            status: self.status,
            start_date: self.start_date,
            end_date: self.end_date,
            allow_donations_after_end: self.allow_donations_after_end,
            minimum_donation: self.minimum_donation,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }
}

/// Plain field update; aggregates are not reachable from here
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CampaignUpdate {
    /// New title
    pub title: Option<String>,
    /// New description
    pub description: Option<String>,
    /// New goal
    pub goal: Option<Decimal>,
    /// New status
    pub status: Option<CampaignStatus>,
    /// New start date
    pub start_date: Option<DateTime<Utc>>,
    /// New end date
    pub end_date: Option<DateTime<Utc>>,
    /// New late-donation policy
    pub allow_donations_after_end: Option<bool>,
    /// New minimum
    pub minimum_donation: Option<Decimal>,
}

impl CampaignUpdate {
    /// Apply to `campaign`, re-validating the result
    pub fn apply_to(&self, campaign: &mut Campaign) -> crate::Result<()> {
        if let Some(title) = &self.title {
            campaign.title = title.clone();
        }
        if let Some(description) = &self.description {
            campaign.description = Some(description.clone());
        }
        if let Some(goal) = self.goal {
            campaign.goal = goal;
        }
        if let Some(status) = self.status {
            campaign.status = status;
        }
        if let Some(start) = self.start_date {
            campaign.start_date = start;
        }
        if let Some(end) = self.end_date {
            campaign.end_date = end;
        }
        if let Some(allow) = self.allow_donations_after_end {
            campaign.allow_donations_after_end = allow;
        }
        if let Some(minimum) = self.minimum_donation {
            campaign.minimum_donation = minimum;
        }

        NewCampaign {
            title: campaign.title.clone(),
            description: campaign.description.clone(),
            goal: campaign.goal,
            currency: campaign.currency,
            status: campaign.status,
            start_date: campaign.start_date,
            end_date: campaign.end_date,
            allow_donations_after_end: campaign.allow_donations_after_end,
            minimum_donation: campaign.minimum_donation,
        }
        .validate()
    }
}

/// Change to a campaign's `raised` / `donors_count`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateDelta {
    /// Added to `raised`
    pub raised: Decimal,
    /// Added to `donors_count`
    pub donors: i64,
}

impl AggregateDelta {
    /// No change
    pub const ZERO: AggregateDelta = AggregateDelta {
        raised: Decimal::ZERO,
        donors: 0,
    };

    /// One donation starts counting
    pub fn credit(amount: Decimal) -> Self {
        Self {
            raised: amount,
            donors: 1,
        }
    }

    /// One donation stops counting
    pub fn debit(amount: Decimal) -> Self {
        Self {
            raised: -amount,
            donors: -1,
        }
    }

    /// Whether applying it is a no-op
    pub fn is_zero(&self) -> bool {
        self.raised.is_zero() && self.donors == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn campaign(goal: Decimal, raised: Decimal) -> Campaign {
        let now = Utc::now();
        let mut c = NewCampaign {
            title: "Clean water".to_string(),
            description: None,
            goal,
            currency: Currency::USD,
            status: CampaignStatus::Active,
            start_date: now,
            end_date: now + chrono::Duration::days(30),
            allow_donations_after_end: false,
            minimum_donation: dec!(5),
        }
        .into_campaign(CampaignId::new(), now);
        c.raised = raised;
        c
    }

    #[test]
    fn test_currency_from_str() {
        assert_eq!("USD".parse::<Currency>().unwrap(), Currency::USD);
        assert_eq!(" eur ".parse::<Currency>().unwrap(), Currency::EUR);
        assert!("XYZ".parse::<Currency>().is_err());
    }

    #[test]
    fn test_status_tags_round_trip() {
        for status in DonationStatus::ALL {
            assert_eq!(DonationStatus::from_u8(status.as_u8()), Some(status));
        }
        assert_eq!(DonationStatus::from_u8(0), None);
        assert!(DonationStatus::Completed.counts_toward_aggregate());
        assert!(!DonationStatus::Refunded.counts_toward_aggregate());
        assert!(DonationStatus::Refunded.is_terminal());
    }

    #[test]
    fn test_guest_requires_name_unless_anonymous() {
        let nameless = Donor::Guest(GuestDonor::default());
        assert!(nameless.validate(false).is_err());
        assert!(nameless.validate(true).is_ok());

        let blank = Donor::Guest(GuestDonor::named("   "));
        assert!(blank.validate(false).is_err());

        let named = Donor::Guest(GuestDonor::named("Ada"));
        assert!(named.validate(false).is_ok());
    }

    #[test]
    fn test_guest_email_shape() {
        let bad = Donor::Guest(GuestDonor::named("Ada").with_email("ada-at-example"));
        assert!(bad.validate(false).is_err());

        let good = Donor::Guest(GuestDonor::named("Ada").with_email("Ada@Example.org"));
        assert!(good.validate(false).is_ok());
        assert_eq!(good.lookup_key(), Some(DonorKey::Email("ada@example.org".into())));
    }

    #[test]
    fn test_display_name_respects_anonymous() {
        let donor = Donor::user("u-42");
        assert_eq!(donor.display_name(true), "Anonymous");
        assert_eq!(donor.display_name(false), "u-42");
    }

    #[test]
    fn test_stamp_entry_only_once() {
        let mut donation = NewDonation::new(dec!(10), Currency::USD, Donor::user("u-1"), None)
            .into_donation(DonationId::new(), Utc::now());
        let first = Utc::now();
        donation.stamp_entry(DonationStatus::Completed, first);
        donation.stamp_entry(DonationStatus::Completed, first + chrono::Duration::hours(1));
        assert_eq!(donation.completed_at, Some(first));
        assert_eq!(donation.failed_at, None);
    }

    #[test]
    fn test_new_donation_validation() {
        let mut donation = NewDonation::new(dec!(0), Currency::USD, Donor::user("u-1"), None);
        assert!(donation.validate().is_err());

        donation.amount = dec!(1);
        donation.message = Some("x".repeat(MAX_MESSAGE_LEN + 1));
        assert!(donation.validate().is_err());

        donation.message = Some("Good luck!".to_string());
        assert!(donation.validate().is_ok());
    }

    #[test]
    fn test_funding_percentage() {
        assert_eq!(campaign(dec!(200), dec!(50)).funding_percentage(), dec!(25));
        assert_eq!(campaign(dec!(3), dec!(1)).funding_percentage(), dec!(33.33));
        assert_eq!(campaign(dec!(100), dec!(150)).remaining(), dec!(0));

        // Ratio beyond the Decimal range
        let tiny_goal = campaign(Decimal::new(1, 28), dec!(1000000));
        assert_eq!(tiny_goal.funding_percentage(), Decimal::MAX);
    }

    #[test]
    fn test_campaign_update_revalidates() {
        let mut c = campaign(dec!(100), dec!(0));
        let update = CampaignUpdate {
            goal: Some(dec!(-1)),
            ..Default::default()
        };
        assert!(update.apply_to(&mut c).is_err());
    }

    #[test]
    fn test_aggregate_delta() {
        assert!(AggregateDelta::ZERO.is_zero());
        assert_eq!(AggregateDelta::debit(dec!(20)).raised, dec!(-20));
        assert_eq!(AggregateDelta::credit(dec!(20)).donors, 1);
    }
}
