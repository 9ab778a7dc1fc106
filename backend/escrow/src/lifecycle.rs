//! Long-running background task that settles campaigns whose aggregation
//! deadline has passed.
//!
//! Each cycle scans for due `AGGREGATION` campaigns, takes the processing
//! lease on each one, re-reads it, and then either promotes it
//! (`SUCCESS` → configured successor) or fails it and refunds every locked
//! commitment. The lease is released whatever the outcome.

use std::time::Duration;

use serde::Serialize;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audit::{self, AuditRecord};
use crate::db::{begin_write, now_millis};
use crate::errors::{EscrowError, Result};
use crate::models::{AuditAction, Commitment};
use crate::repository;
use crate::service::{apply_transition, fetch_campaign};
use crate::settlement::{self, SettleOutcome, Settlement};
use crate::state_machine::CampaignState;

pub const DEFAULT_AUTOMATION_ACTOR: &str = "SYSTEM_DEADLINE_AUTOMATION";

const REFUND_REASON: &str = "Automatic refund: campaign failed to reach its threshold";

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub interval: Duration,
    pub lease_timeout: Duration,
    /// Maximum campaigns picked up per cycle.
    pub batch_size: i64,
    /// Synthetic identity written to the audit log.
    pub actor: String,
    pub success_successor: CampaignState,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        LifecycleSettings {
            interval: Duration::from_secs(120),
            lease_timeout: Duration::from_secs(300),
            batch_size: 100,
            actor: DEFAULT_AUTOMATION_ACTOR.to_string(),
            success_successor: CampaignState::Procurement,
        }
    }
}

impl LifecycleSettings {
    fn lease_timeout_ms(&self) -> i64 {
        i64::try_from(self.lease_timeout.as_millis()).unwrap_or(i64::MAX)
    }
}

/// What happened to one leased campaign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CampaignOutcome {
    Succeeded { successor: CampaignState },
    Failed { refunded: u32, alerts: u32 },
    /// No longer `AGGREGATION` after the lease was taken.
    Skipped { state: CampaignState },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub scanned: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub contended: u32,
    pub skipped: u32,
    pub errored: u32,
    pub refunds_issued: u32,
    pub alerts_raised: u32,
}

pub struct LifecycleWorker {
    pool: SqlitePool,
    settings: LifecycleSettings,
}

impl LifecycleWorker {
    pub fn new(pool: SqlitePool, settings: LifecycleSettings) -> Self {
        LifecycleWorker { pool, settings }
    }

    /// Run one cycle immediately, then one per interval until `shutdown`.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.settings.interval.as_secs(),
            lease_timeout_secs = self.settings.lease_timeout.as_secs(),
            actor = %self.settings.actor,
            "Lifecycle worker starting"
        );

        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        error!("Lifecycle cycle error: {e}");
                    }
                }
            }
        }

        info!("Lifecycle worker stopped");
    }

    pub async fn run_cycle(&self) -> Result<CycleReport> {
        self.run_cycle_at(now_millis()).await
    }

    /// One scan over due campaigns as of `now`.
    pub async fn run_cycle_at(&self, now: i64) -> Result<CycleReport> {
        let due = {
            let mut conn = self.pool.acquire().await?;
            repository::due_campaigns(
                &mut conn,
                now,
                self.settings.lease_timeout_ms(),
                self.settings.batch_size,
            )
            .await?
        };

        let mut report = CycleReport {
            scanned: u32::try_from(due.len()).unwrap_or(u32::MAX),
            ..CycleReport::default()
        };

        for campaign_id in due {
            match self.process_campaign(&campaign_id).await {
                Ok(CampaignOutcome::Succeeded { .. }) => report.succeeded += 1,
                Ok(CampaignOutcome::Failed { refunded, alerts }) => {
                    report.failed += 1;
                    report.refunds_issued += refunded;
                    report.alerts_raised += alerts;
                }
                Ok(CampaignOutcome::Skipped { .. }) => report.skipped += 1,
                Err(EscrowError::LeaseContention { .. }) => {
                    debug!(campaign_id = %campaign_id, "Campaign leased elsewhere; skipping");
                    report.contended += 1;
                }
                Err(e) => {
                    error!(campaign_id = %campaign_id, code = e.code(), "Lifecycle processing failed: {e}");
                    report.errored += 1;
                }
            }
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                succeeded = report.succeeded,
                failed = report.failed,
                contended = report.contended,
                skipped = report.skipped,
                errored = report.errored,
                refunds = report.refunds_issued,
                alerts = report.alerts_raised,
                "Lifecycle cycle complete"
            );
        }
        Ok(report)
    }

    /// Lease, evaluate and release one campaign.
    ///
    /// The lease is stamped with the clock at acquisition; that stamp is the
    /// release token. Fails with [`EscrowError::LeaseContention`] if another
    /// holder owns a fresh lease.
    pub async fn process_campaign(&self, campaign_id: &str) -> Result<CampaignOutcome> {
        let now = now_millis();
        let leased = {
            let mut conn = self.pool.acquire().await?;
            repository::acquire_lease(&mut conn, campaign_id, now, self.settings.lease_timeout_ms())
                .await?
        };
        if !leased {
            return Err(EscrowError::LeaseContention {
                campaign_id: campaign_id.to_string(),
            });
        }

        let outcome = self.evaluate(campaign_id, now).await;

        if let Err(e) = self.release_lease(campaign_id, now).await {
            error!(campaign_id, "Failed to release processing lease: {e}");
        }
        outcome
    }

    async fn release_lease(&self, campaign_id: &str, token: i64) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        if !repository::release_lease(&mut conn, campaign_id, token).await? {
            warn!(campaign_id, "Lease was reclaimed before release");
        }
        Ok(())
    }

    async fn evaluate(&self, campaign_id: &str, now: i64) -> Result<CampaignOutcome> {
        let (campaign, units) = {
            let mut conn = self.pool.acquire().await?;
            let campaign = fetch_campaign(&mut conn, campaign_id).await?;
            let units = repository::locked_units(&mut conn, campaign_id).await?;
            (campaign, units)
        };

        if campaign.state != CampaignState::Aggregation {
            info!(campaign_id, state = %campaign.state, "Campaign changed before lease; skipping");
            return Ok(CampaignOutcome::Skipped {
                state: campaign.state,
            });
        }

        let threshold = campaign.threshold();
        if units >= threshold {
            self.promote(campaign_id, units, threshold, now).await
        } else {
            self.fail_and_refund(campaign_id, units, threshold, now).await
        }
    }

    async fn promote(
        &self,
        campaign_id: &str,
        units: i64,
        threshold: i64,
        now: i64,
    ) -> Result<CampaignOutcome> {
        let actor = self.settings.actor.as_str();
        let successor = self.settings.success_successor;
        let funded = format!("Deadline reached with {units}/{threshold} units committed");

        let mut tx = begin_write(&self.pool).await?;
        apply_transition(
            &mut tx,
            campaign_id,
            CampaignState::Aggregation,
            CampaignState::Success,
            actor,
            &funded,
            now,
        )
        .await?;
        apply_transition(
            &mut tx,
            campaign_id,
            CampaignState::Success,
            successor,
            actor,
            "Automatic progression after funding",
            now,
        )
        .await?;
        tx.commit().await?;

        Ok(CampaignOutcome::Succeeded { successor })
    }

    async fn fail_and_refund(
        &self,
        campaign_id: &str,
        units: i64,
        threshold: i64,
        now: i64,
    ) -> Result<CampaignOutcome> {
        let actor = self.settings.actor.as_str();
        let reason = format!("Deadline reached with {units}/{threshold} units committed");

        let locked = {
            let mut tx = begin_write(&self.pool).await?;
            apply_transition(
                &mut tx,
                campaign_id,
                CampaignState::Aggregation,
                CampaignState::Failed,
                actor,
                &reason,
                now,
            )
            .await?;
            let locked = repository::locked_commitments(&mut tx, campaign_id).await?;
            tx.commit().await?;
            locked
        };

        let mut refunded = 0u32;
        let mut alerts = 0u32;
        for commitment in &locked {
            let failure = match self.refund_one(commitment, now).await {
                Ok(SettleOutcome::Settled(_)) => {
                    refunded += 1;
                    continue;
                }
                Ok(SettleOutcome::AlreadySettled) => continue,
                Ok(SettleOutcome::InvariantViolation { balance, amount }) => {
                    EscrowError::InvariantViolation {
                        commitment_id: commitment.id.clone(),
                        balance,
                        amount,
                    }
                }
                Err(e) => e,
            };

            error!(
                campaign_id,
                commitment_id = %commitment.id,
                code = failure.code(),
                "Automatic refund failed: {failure}"
            );
            match self.escalate(commitment, &failure, now).await {
                Ok(()) => alerts += 1,
                Err(e) => error!(commitment_id = %commitment.id, "Failed to record refund alert: {e}"),
            }
        }

        let narration = format!(
            "Automatic refunds: {refunded} of {} commitments refunded, {alerts} alerts raised",
            locked.len()
        );
        let mut conn = self.pool.acquire().await?;
        audit::record(
            &mut conn,
            &AuditRecord::campaign(campaign_id, actor, AuditAction::AutoRefunds, &narration),
            now,
        )
        .await?;

        Ok(CampaignOutcome::Failed { refunded, alerts })
    }

    /// One commitment per transaction, so a failure rolls back only itself.
    async fn refund_one(&self, commitment: &Commitment, now: i64) -> Result<SettleOutcome> {
        let mut tx = begin_write(&self.pool).await?;
        let outcome = settlement::settle_one(
            &mut tx,
            commitment,
            Settlement::Refund,
            &self.settings.actor,
            REFUND_REASON,
            now,
        )
        .await?;
        match outcome {
            SettleOutcome::Settled(_) => tx.commit().await?,
            _ => tx.rollback().await?,
        }
        Ok(outcome)
    }

    async fn escalate(&self, commitment: &Commitment, failure: &EscrowError, now: i64) -> Result<()> {
        let mut tx = begin_write(&self.pool).await?;
        let message = failure.to_string();
        if let EscrowError::InvariantViolation { .. } = failure {
            audit::record(
                &mut tx,
                &AuditRecord {
                    commitment_id: Some(&commitment.id),
                    ..AuditRecord::campaign(
                        &commitment.campaign_id,
                        &self.settings.actor,
                        AuditAction::RefundInvariantError,
                        &message,
                    )
                },
                now,
            )
            .await?;
        }
        audit::raise_alert(&mut tx, &commitment.campaign_id, &commitment.id, &message, now).await?;
        tx.commit().await?;
        Ok(())
    }
}
