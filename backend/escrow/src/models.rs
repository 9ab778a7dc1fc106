//! Persisted record types.
//!
//! Row structs map one-to-one onto the tables created by
//! `migrations/20260101000000_escrow_schema.sql`. Money columns decode into
//! [`Money`]; timestamps are unix milliseconds.

use serde::{Deserialize, Serialize};

use crate::money::Money;
use crate::state_machine::CampaignState;

// ─────────────────────────────────────────────────────────
// Campaigns
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Campaign {
    pub id: String,
    pub title: String,
    pub state: CampaignState,
    pub target_units: i64,
    pub min_threshold_units: Option<i64>,
    pub unit_price: Money,
    pub min_commitment: Money,
    pub max_commitment: Option<Money>,
    pub aggregation_deadline: i64,
    /// Lease marker: acquisition time of the current processing lease.
    pub processing_lock: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Campaign {
    /// Units that must be committed for the campaign to succeed.
    pub fn threshold(&self) -> i64 {
        self.min_threshold_units.unwrap_or(self.target_units)
    }
}

/// Input for campaign creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCampaign {
    pub title: String,
    pub target_units: i64,
    #[serde(default)]
    pub min_threshold_units: Option<i64>,
    pub unit_price: Money,
    #[serde(default)]
    pub min_commitment: Money,
    #[serde(default)]
    pub max_commitment: Option<Money>,
    pub aggregation_deadline: i64,
}

// ─────────────────────────────────────────────────────────
// Commitments
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommitmentStatus {
    Locked,
    Refunded,
    Released,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Commitment {
    pub id: String,
    pub campaign_id: String,
    pub participant: String,
    pub quantity: i64,
    /// `quantity × unit_price`, fixed at creation.
    pub amount: Money,
    pub status: CommitmentStatus,
    pub reference_number: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Participant request to join a campaign.
///
/// There is deliberately no amount field: the amount is always derived from
/// the campaign's unit price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub participant: String,
    pub quantity: i64,
}

// ─────────────────────────────────────────────────────────
// Ledger
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryType {
    Lock,
    Refund,
    Release,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lock => "LOCK",
            Self::Refund => "REFUND",
            Self::Release => "RELEASE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LedgerEntry {
    pub id: i64,
    pub commitment_id: String,
    pub campaign_id: String,
    pub entry_type: EntryType,
    pub amount: Money,
    pub actor: String,
    pub reason: String,
    pub created_at: i64,
}

// ─────────────────────────────────────────────────────────
// Audit
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    CampaignCreated,
    StateTransition,
    ProcessRefunds,
    ReleaseFunds,
    AutoRefunds,
    RefundInvariantError,
    ReleaseInvariantError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AdminActionLog {
    pub id: i64,
    pub campaign_id: Option<String>,
    pub commitment_id: Option<String>,
    pub actor: String,
    pub action: AuditAction,
    pub previous_state: Option<CampaignState>,
    pub new_state: Option<CampaignState>,
    pub reason: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RefundAlert {
    pub id: i64,
    pub campaign_id: String,
    pub commitment_id: String,
    pub error_message: String,
    pub requires_manual_intervention: bool,
    pub created_at: i64,
    pub resolved_at: Option<i64>,
    pub resolved_by: Option<String>,
}

// ─────────────────────────────────────────────────────────
// Query / response shapes
// ─────────────────────────────────────────────────────────

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 200;

/// Keyset page over an append-only table, newest first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub limit: Option<u32>,
    /// Only return rows with `id < before`.
    pub before: Option<i64>,
}

impl Page {
    pub fn limit(&self) -> i64 {
        i64::from(self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE))
    }
}

/// Result of a bulk refund or release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub processed: u32,
    /// Commitments already out of `LOCKED`.
    pub skipped: u32,
    /// Commitments whose derived balance could not cover the movement.
    pub invariant_violations: u32,
    pub final_balance: Money,
}

/// Per-type escrow position of a campaign, derived from the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EscrowSummary {
    pub locked: Money,
    pub refunded: Money,
    pub released: Money,
    pub balance: Money,
}
