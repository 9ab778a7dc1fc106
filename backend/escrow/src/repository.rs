//! Campaign and commitment persistence, including the processing lease.
//!
//! Every function runs on a caller-supplied connection so handlers can
//! compose them inside one transaction.

use rand::Rng;
use sqlx::SqliteConnection;

use crate::errors::Result;
use crate::models::{Campaign, Commitment, CommitmentStatus, NewCampaign};
use crate::money::Money;
use crate::state_machine::CampaignState;

const CAMPAIGN_COLUMNS: &str = "id, title, state, target_units, min_threshold_units, unit_price, \
     min_commitment, max_commitment, aggregation_deadline, processing_lock, created_at, updated_at";

const COMMITMENT_COLUMNS: &str =
    "id, campaign_id, participant, quantity, amount, status, reference_number, created_at, updated_at";

/// Alphabet without look-alikes (no 0/O, 1/I).
const REFERENCE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

// ─────────────────────────────────────────────────────────
// Campaigns
// ─────────────────────────────────────────────────────────

pub async fn insert_campaign(
    conn: &mut SqliteConnection,
    campaign: &NewCampaign,
    now: i64,
) -> Result<Campaign> {
    let id = uuid::Uuid::new_v4().to_string();
    let sql = format!(
        r#"
        INSERT INTO campaigns
            (id, title, state, target_units, min_threshold_units, unit_price,
             min_commitment, max_commitment, aggregation_deadline, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
        RETURNING {CAMPAIGN_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, Campaign>(&sql)
        .bind(id)
        .bind(campaign.title.trim())
        .bind(CampaignState::Aggregation)
        .bind(campaign.target_units)
        .bind(campaign.min_threshold_units)
        .bind(campaign.unit_price)
        .bind(campaign.min_commitment)
        .bind(campaign.max_commitment)
        .bind(campaign.aggregation_deadline)
        .bind(now)
        .fetch_one(conn)
        .await?;
    Ok(row)
}

pub async fn get_campaign(conn: &mut SqliteConnection, id: &str) -> Result<Option<Campaign>> {
    let sql = format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = ?1");
    let row = sqlx::query_as::<_, Campaign>(&sql)
        .bind(id)
        .fetch_optional(conn)
        .await?;
    Ok(row)
}

/// Campaigns, optionally filtered by state, newest first.
pub async fn list_campaigns(
    conn: &mut SqliteConnection,
    state: Option<CampaignState>,
) -> Result<Vec<Campaign>> {
    let sql = format!(
        "SELECT {CAMPAIGN_COLUMNS} FROM campaigns \
         WHERE (?1 IS NULL OR state = ?1) ORDER BY created_at DESC, id"
    );
    let rows = sqlx::query_as::<_, Campaign>(&sql)
        .bind(state)
        .fetch_all(conn)
        .await?;
    Ok(rows)
}

/// Compare-and-swap the campaign state. Returns `false` when the stored state
/// is no longer `from`.
pub async fn update_campaign_state(
    conn: &mut SqliteConnection,
    id: &str,
    from: CampaignState,
    to: CampaignState,
    now: i64,
) -> Result<bool> {
    let affected = sqlx::query(
        "UPDATE campaigns SET state = ?1, updated_at = ?2 WHERE id = ?3 AND state = ?4",
    )
    .bind(to)
    .bind(now)
    .bind(id)
    .bind(from)
    .execute(conn)
    .await?
    .rows_affected();
    Ok(affected == 1)
}

// ─────────────────────────────────────────────────────────
// Processing lease
// ─────────────────────────────────────────────────────────

/// Ids of `AGGREGATION` campaigns past their deadline whose lease is free or
/// stale.
pub async fn due_campaigns(
    conn: &mut SqliteConnection,
    now: i64,
    lease_timeout_ms: i64,
    limit: i64,
) -> Result<Vec<String>> {
    let ids: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT id
        FROM   campaigns
        WHERE  state = ?1
          AND  aggregation_deadline <= ?2
          AND  (processing_lock IS NULL OR processing_lock < ?3)
        ORDER  BY aggregation_deadline ASC, id
        LIMIT  ?4
        "#,
    )
    .bind(CampaignState::Aggregation)
    .bind(now)
    .bind(now - lease_timeout_ms)
    .bind(limit)
    .fetch_all(conn)
    .await?;
    Ok(ids)
}

/// Conditionally stamp the lease. `true` only for the caller that won it;
/// the stamp (`now`) doubles as the lease token.
pub async fn acquire_lease(
    conn: &mut SqliteConnection,
    id: &str,
    now: i64,
    lease_timeout_ms: i64,
) -> Result<bool> {
    let won: Option<String> = sqlx::query_scalar(
        r#"
        UPDATE campaigns
        SET    processing_lock = ?1
        WHERE  id = ?2
          AND  (processing_lock IS NULL OR processing_lock < ?3)
        RETURNING id
        "#,
    )
    .bind(now)
    .bind(id)
    .bind(now - lease_timeout_ms)
    .fetch_optional(conn)
    .await?;
    Ok(won.is_some())
}

/// Clear the lease if it still carries our token.
pub async fn release_lease(conn: &mut SqliteConnection, id: &str, token: i64) -> Result<bool> {
    let affected = sqlx::query(
        "UPDATE campaigns SET processing_lock = NULL WHERE id = ?1 AND processing_lock = ?2",
    )
    .bind(id)
    .bind(token)
    .execute(conn)
    .await?
    .rows_affected();
    Ok(affected == 1)
}

// ─────────────────────────────────────────────────────────
// Commitments
// ─────────────────────────────────────────────────────────

pub struct NewCommitment<'a> {
    pub campaign_id: &'a str,
    pub participant: &'a str,
    pub quantity: i64,
    pub amount: Money,
}

pub async fn insert_commitment(
    conn: &mut SqliteConnection,
    commitment: &NewCommitment<'_>,
    now: i64,
) -> Result<Commitment> {
    let id = uuid::Uuid::new_v4().to_string();
    let reference = generate_reference_number();
    let sql = format!(
        r#"
        INSERT INTO commitments
            (id, campaign_id, participant, quantity, amount, status, reference_number,
             created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
        RETURNING {COMMITMENT_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, Commitment>(&sql)
        .bind(id)
        .bind(commitment.campaign_id)
        .bind(commitment.participant.trim())
        .bind(commitment.quantity)
        .bind(commitment.amount)
        .bind(CommitmentStatus::Locked)
        .bind(reference)
        .bind(now)
        .fetch_one(conn)
        .await?;
    Ok(row)
}

pub async fn get_commitment(conn: &mut SqliteConnection, id: &str) -> Result<Option<Commitment>> {
    let sql = format!("SELECT {COMMITMENT_COLUMNS} FROM commitments WHERE id = ?1");
    let row = sqlx::query_as::<_, Commitment>(&sql)
        .bind(id)
        .fetch_optional(conn)
        .await?;
    Ok(row)
}

pub async fn get_commitment_by_reference(
    conn: &mut SqliteConnection,
    reference: &str,
) -> Result<Option<Commitment>> {
    let sql = format!("SELECT {COMMITMENT_COLUMNS} FROM commitments WHERE reference_number = ?1");
    let row = sqlx::query_as::<_, Commitment>(&sql)
        .bind(reference.trim().to_ascii_uppercase())
        .fetch_optional(conn)
        .await?;
    Ok(row)
}

/// All commitments of a campaign in creation order.
pub async fn commitments_for_campaign(
    conn: &mut SqliteConnection,
    campaign_id: &str,
) -> Result<Vec<Commitment>> {
    let sql = format!(
        "SELECT {COMMITMENT_COLUMNS} FROM commitments WHERE campaign_id = ?1 \
         ORDER BY created_at ASC, rowid ASC"
    );
    let rows = sqlx::query_as::<_, Commitment>(&sql)
        .bind(campaign_id)
        .fetch_all(conn)
        .await?;
    Ok(rows)
}

pub async fn locked_commitments(
    conn: &mut SqliteConnection,
    campaign_id: &str,
) -> Result<Vec<Commitment>> {
    let sql = format!(
        "SELECT {COMMITMENT_COLUMNS} FROM commitments WHERE campaign_id = ?1 AND status = ?2 \
         ORDER BY created_at ASC, rowid ASC"
    );
    let rows = sqlx::query_as::<_, Commitment>(&sql)
        .bind(campaign_id)
        .bind(CommitmentStatus::Locked)
        .fetch_all(conn)
        .await?;
    Ok(rows)
}

/// Units held by `LOCKED` commitments.
pub async fn locked_units(conn: &mut SqliteConnection, campaign_id: &str) -> Result<i64> {
    let units: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(quantity), 0) FROM commitments WHERE campaign_id = ?1 AND status = ?2",
    )
    .bind(campaign_id)
    .bind(CommitmentStatus::Locked)
    .fetch_one(conn)
    .await?;
    Ok(units)
}

/// Move a commitment out of `LOCKED`. Returns `false` if it had already left.
pub async fn settle_commitment(
    conn: &mut SqliteConnection,
    id: &str,
    to: CommitmentStatus,
    now: i64,
) -> Result<bool> {
    let affected = sqlx::query(
        "UPDATE commitments SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
    )
    .bind(to)
    .bind(now)
    .bind(id)
    .bind(CommitmentStatus::Locked)
    .execute(conn)
    .await?
    .rows_affected();
    Ok(affected == 1)
}

/// `ESC-XXXX-XXXX`
pub fn generate_reference_number() -> String {
    let mut rng = rand::thread_rng();
    let mut part = || -> String {
        (0..4)
            .map(|_| REFERENCE_ALPHABET[rng.gen_range(0..REFERENCE_ALPHABET.len())] as char)
            .collect()
    };
    let first = part();
    let second = part();
    format!("ESC-{first}-{second}")
}
