//! Mutation handlers and read views over the escrow stores.
//!
//! Every money-moving mutation (`commit`, `refund_campaign`,
//! `release_campaign`) runs under the idempotency protocol; state changes go
//! through [`apply_transition`], which is also what the lifecycle worker uses.

use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{info, warn};

use crate::audit::{self, AuditRecord};
use crate::db::{begin_write, now_millis};
use crate::errors::{EscrowError, Result};
use crate::idempotency::{self, Admission, Executed, IdempotencyKey, Operation, Scope};
use crate::ledger::{self, NewLedgerEntry};
use crate::models::{
    AdminActionLog, AuditAction, BatchSummary, Campaign, CommitRequest, Commitment, EntryType,
    EscrowSummary, LedgerEntry, NewCampaign, Page, RefundAlert,
};
use crate::money::Money;
use crate::repository::{self, NewCommitment};
use crate::settlement::{self, SettleOutcome, Settlement};
use crate::state_machine::{self, ActionCode, CampaignState};

/// Body hashed for refund/release keys.
#[derive(Serialize)]
struct BatchRequest<'a> {
    actor: &'a str,
}

#[derive(Clone)]
pub struct EscrowService {
    pool: SqlitePool,
}

impl EscrowService {
    pub fn new(pool: SqlitePool) -> Self {
        EscrowService { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ─────────────────────────────────────────────────────
    // Campaigns
    // ─────────────────────────────────────────────────────

    pub async fn create_campaign(&self, input: NewCampaign, actor: &str) -> Result<Campaign> {
        validate_new_campaign(&input)?;
        require_actor(actor)?;

        let now = now_millis();
        let mut tx = begin_write(&self.pool).await?;
        let campaign = repository::insert_campaign(&mut tx, &input, now).await?;
        audit::record(
            &mut tx,
            &AuditRecord {
                new_state: Some(CampaignState::Aggregation),
                ..AuditRecord::campaign(&campaign.id, actor, AuditAction::CampaignCreated, "Campaign created")
            },
            now,
        )
        .await?;
        tx.commit().await?;

        info!(campaign_id = %campaign.id, target_units = campaign.target_units, "Campaign created");
        Ok(campaign)
    }

    pub async fn campaign(&self, campaign_id: &str) -> Result<Campaign> {
        let mut conn = self.pool.acquire().await?;
        fetch_campaign(&mut conn, campaign_id).await
    }

    pub async fn campaigns(&self, state: Option<CampaignState>) -> Result<Vec<Campaign>> {
        let mut conn = self.pool.acquire().await?;
        repository::list_campaigns(&mut conn, state).await
    }

    // ─────────────────────────────────────────────────────
    // Commit
    // ─────────────────────────────────────────────────────

    /// Lock a participant's funds against an `AGGREGATION` campaign.
    ///
    /// The amount is always `quantity × unit_price`.
    pub async fn commit(
        &self,
        campaign_id: &str,
        request: CommitRequest,
        idempotency_key: &str,
    ) -> Result<Executed<Commitment>> {
        let key = IdempotencyKey::parse(idempotency_key)?;
        if request.participant.trim().is_empty() {
            return Err(EscrowError::Validation("participant is required".into()));
        }
        if request.quantity <= 0 {
            return Err(EscrowError::Validation("quantity must be positive".into()));
        }

        let scope = Scope::new(Operation::Commit, campaign_id);
        let hash = idempotency::request_hash(&request)?;
        let now = now_millis();

        let (mut tx, claim) = match idempotency::admit(&self.pool, &key, &scope, &hash, now).await? {
            Admission::Proceed(tx, claim) => (tx, claim),
            Admission::Settled(answer) => return Ok(answer),
        };

        let campaign = fetch_campaign(&mut tx, campaign_id).await?;
        require_state(&campaign, CampaignState::Aggregation)?;

        let amount = campaign
            .unit_price
            .checked_mul(request.quantity)
            .ok_or_else(|| EscrowError::Validation("commitment amount overflows".into()))?;
        if amount < campaign.min_commitment {
            return Err(EscrowError::Validation(format!(
                "amount {amount} is below the minimum commitment {}",
                campaign.min_commitment
            )));
        }
        if let Some(max) = campaign.max_commitment {
            if amount > max {
                return Err(EscrowError::Validation(format!(
                    "amount {amount} exceeds the maximum commitment {max}"
                )));
            }
        }

        let commitment = repository::insert_commitment(
            &mut tx,
            &NewCommitment {
                campaign_id,
                participant: &request.participant,
                quantity: request.quantity,
                amount,
            },
            now,
        )
        .await?;
        ledger::append(
            &mut tx,
            &NewLedgerEntry {
                commitment_id: &commitment.id,
                campaign_id,
                entry_type: EntryType::Lock,
                amount,
                actor: commitment.participant.as_str(),
                reason: "Funds locked for commitment",
            },
            now,
        )
        .await?;
        idempotency::settle(tx, claim, &commitment, now).await?;

        info!(
            campaign_id,
            commitment_id = %commitment.id,
            reference = %commitment.reference_number,
            %amount,
            "Commitment locked"
        );
        Ok(Executed::Fresh(commitment))
    }

    // ─────────────────────────────────────────────────────
    // Bulk refund / release
    // ─────────────────────────────────────────────────────

    /// Refund every `LOCKED` commitment of a `FAILED` campaign.
    pub async fn refund_campaign(
        &self,
        campaign_id: &str,
        actor: &str,
        idempotency_key: &str,
    ) -> Result<Executed<BatchSummary>> {
        self.settle_campaign(campaign_id, actor, idempotency_key, Settlement::Refund)
            .await
    }

    /// Release every `LOCKED` commitment of a `RELEASED` campaign.
    pub async fn release_campaign(
        &self,
        campaign_id: &str,
        actor: &str,
        idempotency_key: &str,
    ) -> Result<Executed<BatchSummary>> {
        self.settle_campaign(campaign_id, actor, idempotency_key, Settlement::Release)
            .await
    }

    async fn settle_campaign(
        &self,
        campaign_id: &str,
        actor: &str,
        idempotency_key: &str,
        kind: Settlement,
    ) -> Result<Executed<BatchSummary>> {
        let key = IdempotencyKey::parse(idempotency_key)?;
        require_actor(actor)?;

        let (operation, required, batch_action, reason) = match kind {
            Settlement::Refund => (
                Operation::Refund,
                CampaignState::Failed,
                AuditAction::ProcessRefunds,
                "Refund issued for failed campaign",
            ),
            Settlement::Release => (
                Operation::Release,
                CampaignState::Released,
                AuditAction::ReleaseFunds,
                "Escrow released after fulfillment",
            ),
        };
        let scope = Scope::new(operation, campaign_id);
        let hash = idempotency::request_hash(&BatchRequest { actor })?;
        let now = now_millis();

        let (mut tx, claim) = match idempotency::admit(&self.pool, &key, &scope, &hash, now).await? {
            Admission::Proceed(tx, claim) => (tx, claim),
            Admission::Settled(answer) => return Ok(answer),
        };

        let campaign = fetch_campaign(&mut tx, campaign_id).await?;
        require_state(&campaign, required)?;

        let mut summary = BatchSummary {
            processed: 0,
            skipped: 0,
            invariant_violations: 0,
            final_balance: Money::ZERO,
        };
        for commitment in repository::commitments_for_campaign(&mut tx, campaign_id).await? {
            match settlement::settle_one(&mut tx, &commitment, kind, actor, reason, now).await? {
                SettleOutcome::Settled(_) => summary.processed += 1,
                SettleOutcome::AlreadySettled => summary.skipped += 1,
                SettleOutcome::InvariantViolation { balance, amount } => {
                    summary.invariant_violations += 1;
                    let detail = EscrowError::InvariantViolation {
                        commitment_id: commitment.id.clone(),
                        balance,
                        amount,
                    }
                    .to_string();
                    audit::record(
                        &mut tx,
                        &AuditRecord {
                            commitment_id: Some(&commitment.id),
                            ..AuditRecord::campaign(campaign_id, actor, kind.invariant_action(), &detail)
                        },
                        now,
                    )
                    .await?;
                }
            }
        }
        summary.final_balance = ledger::campaign_balance(&mut tx, campaign_id).await?;

        let narration = format!(
            "processed {}, skipped {}, invariant violations {}",
            summary.processed, summary.skipped, summary.invariant_violations
        );
        audit::record(
            &mut tx,
            &AuditRecord::campaign(campaign_id, actor, batch_action, &narration),
            now,
        )
        .await?;
        idempotency::settle(tx, claim, &summary, now).await?;

        if summary.invariant_violations > 0 {
            warn!(campaign_id, violations = summary.invariant_violations, "Batch skipped commitments with insufficient escrow");
        }
        info!(
            campaign_id,
            processed = summary.processed,
            skipped = summary.skipped,
            final_balance = %summary.final_balance,
            "{:?} batch complete",
            kind
        );
        Ok(Executed::Fresh(summary))
    }

    // ─────────────────────────────────────────────────────
    // Admin transitions
    // ─────────────────────────────────────────────────────

    /// Move a campaign to `to`. A non-empty reason is mandatory.
    pub async fn transition(
        &self,
        campaign_id: &str,
        to: CampaignState,
        actor: &str,
        reason: &str,
    ) -> Result<Campaign> {
        require_actor(actor)?;
        if reason.trim().is_empty() {
            return Err(EscrowError::Validation("a reason is required for every transition".into()));
        }

        let now = now_millis();
        let mut tx = begin_write(&self.pool).await?;
        let campaign = fetch_campaign(&mut tx, campaign_id).await?;
        apply_transition(&mut tx, campaign_id, campaign.state, to, actor, reason.trim(), now).await?;
        let updated = fetch_campaign(&mut tx, campaign_id).await?;
        tx.commit().await?;
        Ok(updated)
    }

    /// Shorthand for [`transition`](Self::transition) to the code's target.
    pub async fn perform_action(
        &self,
        campaign_id: &str,
        code: ActionCode,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<Campaign> {
        let reason = reason
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| code.default_reason());
        self.transition(campaign_id, code.target(), actor, reason).await
    }

    // ─────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────

    pub async fn commitment(&self, commitment_id: &str) -> Result<Commitment> {
        let mut conn = self.pool.acquire().await?;
        repository::get_commitment(&mut conn, commitment_id)
            .await?
            .ok_or_else(|| EscrowError::not_found("commitment", commitment_id))
    }

    pub async fn commitment_by_reference(&self, reference: &str) -> Result<Commitment> {
        let mut conn = self.pool.acquire().await?;
        repository::get_commitment_by_reference(&mut conn, reference)
            .await?
            .ok_or_else(|| EscrowError::not_found("commitment", reference))
    }

    pub async fn commitments(&self, campaign_id: &str) -> Result<Vec<Commitment>> {
        let mut conn = self.pool.acquire().await?;
        fetch_campaign(&mut conn, campaign_id).await?;
        repository::commitments_for_campaign(&mut conn, campaign_id).await
    }

    pub async fn escrow_summary(&self, campaign_id: &str) -> Result<EscrowSummary> {
        let mut conn = self.pool.acquire().await?;
        fetch_campaign(&mut conn, campaign_id).await?;
        Ok(ledger::campaign_totals(&mut conn, campaign_id).await?.summary())
    }

    pub async fn commitment_balance(&self, commitment_id: &str) -> Result<Money> {
        let mut conn = self.pool.acquire().await?;
        if repository::get_commitment(&mut conn, commitment_id).await?.is_none() {
            return Err(EscrowError::not_found("commitment", commitment_id));
        }
        ledger::commitment_balance(&mut conn, commitment_id).await
    }

    pub async fn ledger_page(&self, campaign_id: Option<&str>, page: Page) -> Result<Vec<LedgerEntry>> {
        let mut conn = self.pool.acquire().await?;
        match campaign_id {
            Some(id) => ledger::entries_for_campaign(&mut conn, id, page).await,
            None => ledger::recent_entries(&mut conn, page).await,
        }
    }

    pub async fn audit_page(&self, campaign_id: Option<&str>, page: Page) -> Result<Vec<AdminActionLog>> {
        let mut conn = self.pool.acquire().await?;
        audit::list(&mut conn, campaign_id, page).await
    }

    pub async fn open_alerts(&self, campaign_id: Option<&str>, page: Page) -> Result<Vec<RefundAlert>> {
        let mut conn = self.pool.acquire().await?;
        audit::open_alerts(&mut conn, campaign_id, page).await
    }

    pub async fn resolve_alert(&self, alert_id: i64, actor: &str) -> Result<RefundAlert> {
        let mut conn = self.pool.acquire().await?;
        let alert = audit::resolve_alert(&mut conn, alert_id, actor, now_millis()).await?;
        info!(alert_id, campaign_id = %alert.campaign_id, actor, "Refund alert resolved");
        Ok(alert)
    }
}

// ─────────────────────────────────────────────────────────
// Shared helpers
// ─────────────────────────────────────────────────────────

/// Check legality, compare-and-swap the state, narrate it.
///
/// Every state change in the crate goes through here.
pub async fn apply_transition(
    conn: &mut SqliteConnection,
    campaign_id: &str,
    from: CampaignState,
    to: CampaignState,
    actor: &str,
    reason: &str,
    now: i64,
) -> Result<()> {
    state_machine::check(from, to)?;
    if !repository::update_campaign_state(conn, campaign_id, from, to, now).await? {
        return Err(EscrowError::ConcurrentModification {
            campaign_id: campaign_id.to_string(),
        });
    }
    audit::record(conn, &AuditRecord::transition(campaign_id, actor, from, to, reason), now).await?;
    info!(campaign_id, %from, %to, actor, "Campaign state changed");
    Ok(())
}

pub(crate) async fn fetch_campaign(conn: &mut SqliteConnection, campaign_id: &str) -> Result<Campaign> {
    repository::get_campaign(conn, campaign_id)
        .await?
        .ok_or_else(|| EscrowError::not_found("campaign", campaign_id))
}

fn require_state(campaign: &Campaign, expected: CampaignState) -> Result<()> {
    if campaign.state == expected {
        Ok(())
    } else {
        Err(EscrowError::WrongState {
            campaign_id: campaign.id.clone(),
            expected,
            actual: campaign.state,
        })
    }
}

fn require_actor(actor: &str) -> Result<()> {
    if actor.trim().is_empty() {
        return Err(EscrowError::Validation("actor is required".into()));
    }
    Ok(())
}

fn validate_new_campaign(input: &NewCampaign) -> Result<()> {
    if input.title.trim().is_empty() {
        return Err(EscrowError::Validation("title is required".into()));
    }
    if input.target_units <= 0 {
        return Err(EscrowError::Validation("target_units must be positive".into()));
    }
    if let Some(threshold) = input.min_threshold_units {
        if threshold <= 0 || threshold > input.target_units {
            return Err(EscrowError::Validation(format!(
                "min_threshold_units must be between 1 and target_units ({}), got {threshold}",
                input.target_units
            )));
        }
    }
    if !input.unit_price.is_positive() {
        return Err(EscrowError::Validation("unit_price must be positive".into()));
    }
    if input.min_commitment.is_negative() {
        return Err(EscrowError::Validation("min_commitment cannot be negative".into()));
    }
    if let Some(max) = input.max_commitment {
        if max < input.min_commitment {
            return Err(EscrowError::Validation(
                "max_commitment must not be below min_commitment".into(),
            ));
        }
    }
    Ok(())
}
