//! Moving one commitment's escrow out of `LOCKED`.
//!
//! Shared by the admin refund/release handlers and the lifecycle worker so
//! the invariant check and write order cannot drift between them.

use sqlx::SqliteConnection;
use tracing::warn;

use crate::errors::{EscrowError, Result};
use crate::ledger::{self, NewLedgerEntry};
use crate::models::{AuditAction, Commitment, CommitmentStatus, EntryType, LedgerEntry};
use crate::money::Money;
use crate::repository;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Refund,
    Release,
}

impl Settlement {
    pub fn entry_type(&self) -> EntryType {
        match self {
            Self::Refund => EntryType::Refund,
            Self::Release => EntryType::Release,
        }
    }

    pub fn target_status(&self) -> CommitmentStatus {
        match self {
            Self::Refund => CommitmentStatus::Refunded,
            Self::Release => CommitmentStatus::Released,
        }
    }

    /// Audit action recorded when the balance cannot cover the movement.
    pub fn invariant_action(&self) -> AuditAction {
        match self {
            Self::Refund => AuditAction::RefundInvariantError,
            Self::Release => AuditAction::ReleaseInvariantError,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettleOutcome {
    Settled(LedgerEntry),
    /// Status had already left `LOCKED`; nothing written.
    AlreadySettled,
    /// Derived balance is below the commitment amount; nothing written.
    InvariantViolation { balance: Money, amount: Money },
}

/// Re-read the status, re-derive the balance, flip the status, append the
/// ledger entry.
///
/// `commitment` may be a stale snapshot; only its id, amount and campaign are
/// trusted. Must run inside the caller's write transaction: the status flip
/// and the entry only make sense together.
pub async fn settle_one(
    conn: &mut SqliteConnection,
    commitment: &Commitment,
    kind: Settlement,
    actor: &str,
    reason: &str,
    now: i64,
) -> Result<SettleOutcome> {
    let current = repository::get_commitment(&mut *conn, &commitment.id)
        .await?
        .ok_or_else(|| EscrowError::not_found("commitment", &commitment.id))?;
    if current.status != CommitmentStatus::Locked {
        return Ok(SettleOutcome::AlreadySettled);
    }

    let balance = ledger::commitment_balance(&mut *conn, &commitment.id).await?;
    if balance < commitment.amount {
        warn!(
            commitment_id = %commitment.id,
            campaign_id = %commitment.campaign_id,
            %balance,
            amount = %commitment.amount,
            "Escrow balance cannot cover {:?}; skipping",
            kind
        );
        return Ok(SettleOutcome::InvariantViolation {
            balance,
            amount: commitment.amount,
        });
    }

    if !repository::settle_commitment(&mut *conn, &commitment.id, kind.target_status(), now).await? {
        return Ok(SettleOutcome::AlreadySettled);
    }

    let entry = ledger::append(
        conn,
        &NewLedgerEntry {
            commitment_id: &commitment.id,
            campaign_id: &commitment.campaign_id,
            entry_type: kind.entry_type(),
            amount: commitment.amount,
            actor,
            reason,
        },
        now,
    )
    .await?;
    Ok(SettleOutcome::Settled(entry))
}
