//! # Campaign state machine
//!
//! The adjacency table below is the only place that decides which campaign
//! transitions are legal. Admin transitions, action codes and the lifecycle
//! worker all consult [`check`]; the API exports [`transition_table`] so
//! clients can render legal actions without re-implementing the rules.
//!
//! ```text
//! AGGREGATION ──► SUCCESS ──► PROCUREMENT ──► FULFILLMENT ──► RELEASED
//!      │             │  └──────────────────────►┘   │
//!      └──► FAILED ◄─┴───────────┴──────────────────┘
//! ```
//!
//! `RELEASED` and `FAILED` are terminal. Nothing in this module performs I/O.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{EscrowError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CampaignState {
    /// Accepting commitments until the aggregation deadline.
    Aggregation,
    /// Threshold met; funds stay locked.
    Success,
    /// Supplier order being placed.
    Procurement,
    /// Goods being delivered.
    Fulfillment,
    /// Escrow released to fulfillment. Terminal.
    Released,
    /// Campaign abandoned; commitments are refunded. Terminal.
    Failed,
}

/// Every state, in lifecycle order.
pub const ALL_STATES: [CampaignState; 6] = [
    CampaignState::Aggregation,
    CampaignState::Success,
    CampaignState::Procurement,
    CampaignState::Fulfillment,
    CampaignState::Released,
    CampaignState::Failed,
];

impl CampaignState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aggregation => "AGGREGATION",
            Self::Success => "SUCCESS",
            Self::Procurement => "PROCUREMENT",
            Self::Fulfillment => "FULFILLMENT",
            Self::Released => "RELEASED",
            Self::Failed => "FAILED",
        }
    }

    /// Legal successors of this state.
    pub fn successors(&self) -> &'static [CampaignState] {
        use CampaignState::*;
        match self {
            Aggregation => &[Success, Failed],
            Success => &[Procurement, Fulfillment, Failed],
            Procurement => &[Fulfillment, Failed],
            Fulfillment => &[Released, Failed],
            Released | Failed => &[],
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.successors().is_empty()
    }
}

impl fmt::Display for CampaignState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CampaignState {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self> {
        ALL_STATES
            .iter()
            .copied()
            .find(|state| state.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| EscrowError::Validation(format!("unknown campaign state {s:?}")))
    }
}

pub fn is_legal(from: CampaignState, to: CampaignState) -> bool {
    from.successors().contains(&to)
}

/// Fail with [`EscrowError::IllegalTransition`] unless `from -> to` is in the table.
pub fn check(from: CampaignState, to: CampaignState) -> Result<()> {
    if is_legal(from, to) {
        Ok(())
    } else {
        Err(EscrowError::IllegalTransition {
            from,
            to,
            allowed: from.successors().to_vec(),
        })
    }
}

/// One row of the exported adjacency table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionRow {
    pub from: CampaignState,
    pub to: Vec<CampaignState>,
    pub terminal: bool,
}

pub fn transition_table() -> Vec<TransitionRow> {
    ALL_STATES
        .iter()
        .map(|state| TransitionRow {
            from: *state,
            to: state.successors().to_vec(),
            terminal: state.is_terminal(),
        })
        .collect()
}

/// Admin shorthand codes. Each is an alias for a plain transition; legality
/// is still decided by [`check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionCode {
    MarkFunded,
    StartProcurement,
    StartFulfillment,
    ReleaseEscrow,
    FailCampaign,
}

impl ActionCode {
    pub fn target(&self) -> CampaignState {
        match self {
            Self::MarkFunded => CampaignState::Success,
            Self::StartProcurement => CampaignState::Procurement,
            Self::StartFulfillment => CampaignState::Fulfillment,
            Self::ReleaseEscrow => CampaignState::Released,
            Self::FailCampaign => CampaignState::Failed,
        }
    }

    pub fn default_reason(&self) -> &'static str {
        match self {
            Self::MarkFunded => "Target met, campaign marked as funded by admin",
            Self::StartProcurement => "Procurement started by admin",
            Self::StartFulfillment => "Fulfillment started by admin",
            Self::ReleaseEscrow => "Escrow released by admin after fulfillment",
            Self::FailCampaign => "Campaign failed by admin",
        }
    }
}
