//! Application-wide error types.

use thiserror::Error;

use crate::money::Money;
use crate::state_machine::CampaignState;

#[derive(Debug, Error)]
pub enum EscrowError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Campaign {campaign_id} is {actual}, operation requires {expected}")]
    WrongState {
        campaign_id: String,
        expected: CampaignState,
        actual: CampaignState,
    },

    #[error("Illegal transition {from} -> {to} (allowed: {})", format_states(.allowed))]
    IllegalTransition {
        from: CampaignState,
        to: CampaignState,
        allowed: Vec<CampaignState>,
    },

    #[error("Escrow invariant violated for commitment {commitment_id}: balance {balance} < amount {amount}")]
    InvariantViolation {
        commitment_id: String,
        balance: Money,
        amount: Money,
    },

    #[error("Idempotency key {key} reused in scope {scope} with a different payload")]
    DuplicateRequest { key: String, scope: String },

    #[error("Campaign {campaign_id} is leased by another worker")]
    LeaseContention { campaign_id: String },

    #[error("Campaign {campaign_id} changed state concurrently")]
    ConcurrentModification { campaign_id: String },
}

impl EscrowError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        EscrowError::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            EscrowError::Database(_) => "DATABASE_ERROR",
            EscrowError::Migrate(_) => "MIGRATION_ERROR",
            EscrowError::Json(_) => "JSON_ERROR",
            EscrowError::Config(_) => "CONFIG_ERROR",
            EscrowError::Validation(_) => "VALIDATION_ERROR",
            EscrowError::NotFound { .. } => "NOT_FOUND",
            EscrowError::WrongState { .. } => "WRONG_STATE",
            EscrowError::IllegalTransition { .. } => "ILLEGAL_TRANSITION",
            EscrowError::InvariantViolation { .. } => "INVARIANT_VIOLATION",
            EscrowError::DuplicateRequest { .. } => "DUPLICATE_REQUEST",
            EscrowError::LeaseContention { .. } => "LEASE_CONTENTION",
            EscrowError::ConcurrentModification { .. } => "CONCURRENT_MODIFICATION",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            EscrowError::Validation(_) | EscrowError::IllegalTransition { .. } => 400,
            EscrowError::NotFound { .. } => 404,
            EscrowError::WrongState { .. }
            | EscrowError::DuplicateRequest { .. }
            | EscrowError::LeaseContention { .. }
            | EscrowError::ConcurrentModification { .. } => 409,
            EscrowError::InvariantViolation { .. } => 422,
            EscrowError::Database(_)
            | EscrowError::Migrate(_)
            | EscrowError::Json(_)
            | EscrowError::Config(_) => 500,
        }
    }
}

fn format_states(states: &[CampaignState]) -> String {
    if states.is_empty() {
        return "none".to_string();
    }
    states
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, EscrowError>;
