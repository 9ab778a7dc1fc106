//! Append-only audit narration and refund alerts.

use sqlx::SqliteConnection;

use crate::errors::{EscrowError, Result};
use crate::models::{AdminActionLog, AuditAction, Page, RefundAlert};
use crate::state_machine::CampaignState;

const LOG_COLUMNS: &str =
    "id, campaign_id, commitment_id, actor, action, previous_state, new_state, reason, created_at";

const ALERT_COLUMNS: &str = "id, campaign_id, commitment_id, error_message, \
     requires_manual_intervention, created_at, resolved_at, resolved_by";

/// One audit row about to be written.
#[derive(Debug, Clone)]
pub struct AuditRecord<'a> {
    pub campaign_id: Option<&'a str>,
    pub commitment_id: Option<&'a str>,
    pub actor: &'a str,
    pub action: AuditAction,
    pub previous_state: Option<CampaignState>,
    pub new_state: Option<CampaignState>,
    pub reason: &'a str,
}

impl<'a> AuditRecord<'a> {
    /// A campaign-level row without a state change.
    pub fn campaign(campaign_id: &'a str, actor: &'a str, action: AuditAction, reason: &'a str) -> Self {
        AuditRecord {
            campaign_id: Some(campaign_id),
            commitment_id: None,
            actor,
            action,
            previous_state: None,
            new_state: None,
            reason,
        }
    }

    pub fn transition(
        campaign_id: &'a str,
        actor: &'a str,
        from: CampaignState,
        to: CampaignState,
        reason: &'a str,
    ) -> Self {
        AuditRecord {
            previous_state: Some(from),
            new_state: Some(to),
            ..Self::campaign(campaign_id, actor, AuditAction::StateTransition, reason)
        }
    }
}

// ─────────────────────────────────────────────────────────
// Admin action log
// ─────────────────────────────────────────────────────────

pub async fn record(
    conn: &mut SqliteConnection,
    entry: &AuditRecord<'_>,
    now: i64,
) -> Result<AdminActionLog> {
    if entry.reason.trim().is_empty() {
        return Err(EscrowError::Validation("audit reason is required".into()));
    }
    let sql = format!(
        r#"
        INSERT INTO admin_action_logs
            (campaign_id, commitment_id, actor, action, previous_state, new_state, reason, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        RETURNING {LOG_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, AdminActionLog>(&sql)
        .bind(entry.campaign_id)
        .bind(entry.commitment_id)
        .bind(entry.actor)
        .bind(entry.action)
        .bind(entry.previous_state)
        .bind(entry.new_state)
        .bind(entry.reason)
        .bind(now)
        .fetch_one(conn)
        .await?;
    Ok(row)
}

/// Audit rows, newest first, optionally scoped to one campaign.
pub async fn list(
    conn: &mut SqliteConnection,
    campaign_id: Option<&str>,
    page: Page,
) -> Result<Vec<AdminActionLog>> {
    let sql = format!(
        r#"
        SELECT {LOG_COLUMNS}
        FROM   admin_action_logs
        WHERE  (?1 IS NULL OR campaign_id = ?1)
          AND  (?2 IS NULL OR id < ?2)
        ORDER  BY id DESC
        LIMIT  ?3
        "#
    );
    let rows = sqlx::query_as::<_, AdminActionLog>(&sql)
        .bind(campaign_id)
        .bind(page.before)
        .bind(page.limit())
        .fetch_all(conn)
        .await?;
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Refund alerts
// ─────────────────────────────────────────────────────────

pub async fn raise_alert(
    conn: &mut SqliteConnection,
    campaign_id: &str,
    commitment_id: &str,
    error_message: &str,
    now: i64,
) -> Result<RefundAlert> {
    let sql = format!(
        r#"
        INSERT INTO refund_alerts
            (campaign_id, commitment_id, error_message, requires_manual_intervention, created_at)
        VALUES (?1, ?2, ?3, 1, ?4)
        RETURNING {ALERT_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, RefundAlert>(&sql)
        .bind(campaign_id)
        .bind(commitment_id)
        .bind(error_message)
        .bind(now)
        .fetch_one(conn)
        .await?;
    Ok(row)
}

/// Unresolved alerts, newest first.
pub async fn open_alerts(
    conn: &mut SqliteConnection,
    campaign_id: Option<&str>,
    page: Page,
) -> Result<Vec<RefundAlert>> {
    let sql = format!(
        r#"
        SELECT {ALERT_COLUMNS}
        FROM   refund_alerts
        WHERE  resolved_at IS NULL
          AND  (?1 IS NULL OR campaign_id = ?1)
          AND  (?2 IS NULL OR id < ?2)
        ORDER  BY id DESC
        LIMIT  ?3
        "#
    );
    let rows = sqlx::query_as::<_, RefundAlert>(&sql)
        .bind(campaign_id)
        .bind(page.before)
        .bind(page.limit())
        .fetch_all(conn)
        .await?;
    Ok(rows)
}

/// Mark an alert as handled by a human.
pub async fn resolve_alert(
    conn: &mut SqliteConnection,
    alert_id: i64,
    actor: &str,
    now: i64,
) -> Result<RefundAlert> {
    if actor.trim().is_empty() {
        return Err(EscrowError::Validation("actor is required".into()));
    }
    let sql = format!(
        r#"
        UPDATE refund_alerts
        SET    resolved_at = ?1, resolved_by = ?2, requires_manual_intervention = 0
        WHERE  id = ?3 AND resolved_at IS NULL
        RETURNING {ALERT_COLUMNS}
        "#
    );
    let resolved = sqlx::query_as::<_, RefundAlert>(&sql)
        .bind(now)
        .bind(actor)
        .bind(alert_id)
        .fetch_optional(&mut *conn)
        .await?;
    if let Some(alert) = resolved {
        return Ok(alert);
    }

    let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM refund_alerts WHERE id = ?1")
        .bind(alert_id)
        .fetch_optional(conn)
        .await?;
    match exists {
        Some(_) => Err(EscrowError::Validation(format!(
            "refund alert {alert_id} is already resolved"
        ))),
        None => Err(EscrowError::not_found("refund alert", alert_id.to_string())),
    }
}
