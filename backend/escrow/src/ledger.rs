//! # Ledger store
//!
//! Append-only record of every escrow movement. The module exposes no update
//! or delete path; the schema's triggers reject any that bypass it.
//!
//! Balances are always aggregated from entries:
//!
//! ```text
//! net = SUM(LOCK) − SUM(REFUND) − SUM(RELEASE)
//! ```
//!
//! scoped either to one commitment or to a whole campaign. Nothing stores a
//! running total.

use serde::Serialize;
use sqlx::SqliteConnection;

use crate::errors::{EscrowError, Result};
use crate::models::{EntryType, EscrowSummary, LedgerEntry, Page};
use crate::money::Money;

/// An entry about to be appended.
#[derive(Debug, Clone)]
pub struct NewLedgerEntry<'a> {
    pub commitment_id: &'a str,
    pub campaign_id: &'a str,
    pub entry_type: EntryType,
    pub amount: Money,
    pub actor: &'a str,
    pub reason: &'a str,
}

/// Per-type sums for a commitment or campaign.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerTotals {
    pub locked: Money,
    pub refunded: Money,
    pub released: Money,
}

impl LedgerTotals {
    fn accumulate(&mut self, entry_type: EntryType, sum: Money) {
        let slot = match entry_type {
            EntryType::Lock => &mut self.locked,
            EntryType::Refund => &mut self.refunded,
            EntryType::Release => &mut self.released,
        };
        *slot = Money::from_minor(slot.minor() + sum.minor());
    }

    /// Escrow still held: locks minus everything that left.
    pub fn balance(&self) -> Money {
        Money::from_minor(self.locked.minor() - self.refunded.minor() - self.released.minor())
    }

    pub fn summary(&self) -> EscrowSummary {
        EscrowSummary {
            locked: self.locked,
            refunded: self.refunded,
            released: self.released,
            balance: self.balance(),
        }
    }
}

/// Append one immutable entry.
///
/// Runs on the caller's connection so it commits or rolls back together with
/// the rest of the mutation.
pub async fn append(
    conn: &mut SqliteConnection,
    entry: &NewLedgerEntry<'_>,
    now: i64,
) -> Result<LedgerEntry> {
    if !entry.amount.is_positive() {
        return Err(EscrowError::Validation(format!(
            "ledger amount must be positive, got {}",
            entry.amount
        )));
    }
    if entry.actor.trim().is_empty() {
        return Err(EscrowError::Validation("ledger actor is required".into()));
    }
    if entry.reason.trim().is_empty() {
        return Err(EscrowError::Validation("ledger reason is required".into()));
    }

    let row = sqlx::query_as::<_, LedgerEntry>(
        r#"
        INSERT INTO ledger_entries
            (commitment_id, campaign_id, entry_type, amount, actor, reason, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        RETURNING id, commitment_id, campaign_id, entry_type, amount, actor, reason, created_at
        "#,
    )
    .bind(entry.commitment_id)
    .bind(entry.campaign_id)
    .bind(entry.entry_type)
    .bind(entry.amount)
    .bind(entry.actor)
    .bind(entry.reason)
    .bind(now)
    .fetch_one(conn)
    .await?;
    Ok(row)
}

// ─────────────────────────────────────────────────────────
// Balances
// ─────────────────────────────────────────────────────────

pub async fn commitment_totals(
    conn: &mut SqliteConnection,
    commitment_id: &str,
) -> Result<LedgerTotals> {
    let rows: Vec<(EntryType, i64)> = sqlx::query_as(
        r#"
        SELECT entry_type, SUM(amount)
        FROM   ledger_entries
        WHERE  commitment_id = ?1
        GROUP  BY entry_type
        "#,
    )
    .bind(commitment_id)
    .fetch_all(conn)
    .await?;
    Ok(fold(rows))
}

pub async fn campaign_totals(conn: &mut SqliteConnection, campaign_id: &str) -> Result<LedgerTotals> {
    let rows: Vec<(EntryType, i64)> = sqlx::query_as(
        r#"
        SELECT entry_type, SUM(amount)
        FROM   ledger_entries
        WHERE  campaign_id = ?1
        GROUP  BY entry_type
        "#,
    )
    .bind(campaign_id)
    .fetch_all(conn)
    .await?;
    Ok(fold(rows))
}

/// Net escrow position of one commitment.
pub async fn commitment_balance(conn: &mut SqliteConnection, commitment_id: &str) -> Result<Money> {
    Ok(commitment_totals(conn, commitment_id).await?.balance())
}

/// Net escrow position of a whole campaign.
pub async fn campaign_balance(conn: &mut SqliteConnection, campaign_id: &str) -> Result<Money> {
    Ok(campaign_totals(conn, campaign_id).await?.balance())
}

fn fold(rows: Vec<(EntryType, i64)>) -> LedgerTotals {
    let mut totals = LedgerTotals::default();
    for (entry_type, sum) in rows {
        totals.accumulate(entry_type, Money::from_minor(sum));
    }
    totals
}

// ─────────────────────────────────────────────────────────
// Reads
// ─────────────────────────────────────────────────────────

/// Entries for one campaign, newest first.
pub async fn entries_for_campaign(
    conn: &mut SqliteConnection,
    campaign_id: &str,
    page: Page,
) -> Result<Vec<LedgerEntry>> {
    let rows = sqlx::query_as::<_, LedgerEntry>(
        r#"
        SELECT id, commitment_id, campaign_id, entry_type, amount, actor, reason, created_at
        FROM   ledger_entries
        WHERE  campaign_id = ?1
          AND  (?2 IS NULL OR id < ?2)
        ORDER  BY id DESC
        LIMIT  ?3
        "#,
    )
    .bind(campaign_id)
    .bind(page.before)
    .bind(page.limit())
    .fetch_all(conn)
    .await?;
    Ok(rows)
}

/// Entries across all campaigns, newest first.
pub async fn recent_entries(conn: &mut SqliteConnection, page: Page) -> Result<Vec<LedgerEntry>> {
    let rows = sqlx::query_as::<_, LedgerEntry>(
        r#"
        SELECT id, commitment_id, campaign_id, entry_type, amount, actor, reason, created_at
        FROM   ledger_entries
        WHERE  (?1 IS NULL OR id < ?1)
        ORDER  BY id DESC
        LIMIT  ?2
        "#,
    )
    .bind(page.before)
    .bind(page.limit())
    .fetch_all(conn)
    .await?;
    Ok(rows)
}

/// Number of entries of one type recorded against a campaign.
pub async fn count_entries(
    conn: &mut SqliteConnection,
    campaign_id: &str,
    entry_type: EntryType,
) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM ledger_entries WHERE campaign_id = ?1 AND entry_type = ?2",
    )
    .bind(campaign_id)
    .bind(entry_type)
    .fetch_one(conn)
    .await?;
    Ok(count)
}
