#![allow(dead_code)]

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tempfile::TempDir;

use crate::db;
use crate::models::{Campaign, CommitRequest, Commitment, EntryType, NewCampaign};
use crate::money::Money;
use crate::service::EscrowService;

pub const ADMIN: &str = "admin@example.com";
pub const UNIT_PRICE: Money = Money::from_minor(2_500);

/// Fresh in-memory database with the schema applied.
///
/// One connection only: `sqlite::memory:` gives every connection its own
/// database.
pub async fn test_pool() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .unwrap()
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .unwrap();
    db::migrate(&pool).await.unwrap();
    pool
}

pub async fn setup() -> (SqlitePool, EscrowService) {
    let pool = test_pool().await;
    let service = EscrowService::new(pool.clone());
    (pool, service)
}

/// File-backed database behind several connections, so writers really
/// contend for SQLite's lock. The database lives as long as the `TempDir`.
pub async fn setup_shared() -> (TempDir, SqlitePool, EscrowService) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("escrow.db");
    let pool = db::init_pool(path.to_str().unwrap(), 8).await.unwrap();
    let service = EscrowService::new(pool.clone());
    (dir, pool, service)
}

pub fn campaign_input(target_units: i64, min_threshold_units: Option<i64>, deadline: i64) -> NewCampaign {
    NewCampaign {
        title: "Espresso grinder batch".into(),
        target_units,
        min_threshold_units,
        unit_price: UNIT_PRICE,
        min_commitment: Money::ZERO,
        max_commitment: None,
        aggregation_deadline: deadline,
    }
}

pub async fn create_campaign(
    service: &EscrowService,
    target_units: i64,
    min_threshold_units: Option<i64>,
    deadline: i64,
) -> Campaign {
    service
        .create_campaign(campaign_input(target_units, min_threshold_units, deadline), ADMIN)
        .await
        .unwrap()
}

/// Commit under a fresh key and return the new commitment.
pub async fn commit_units(
    service: &EscrowService,
    campaign_id: &str,
    participant: &str,
    quantity: i64,
) -> Commitment {
    let key = uuid::Uuid::new_v4().to_string();
    let request = CommitRequest {
        participant: participant.to_string(),
        quantity,
    };
    service
        .commit(campaign_id, request, &key)
        .await
        .unwrap()
        .into_result()
        .unwrap()
}

pub async fn count_entries(pool: &SqlitePool, campaign_id: &str, entry_type: EntryType) -> i64 {
    let mut conn = pool.acquire().await.unwrap();
    crate::ledger::count_entries(&mut conn, campaign_id, entry_type)
        .await
        .unwrap()
}

/// Make every REFUND append for `commitment_id` fail at the storage layer.
pub async fn break_refunds_for(pool: &SqlitePool, commitment_id: &str) {
    let sql = format!(
        r#"
        CREATE TRIGGER fail_refund_{name}
        BEFORE INSERT ON ledger_entries
        WHEN NEW.entry_type = 'REFUND' AND NEW.commitment_id = '{commitment_id}'
        BEGIN
            SELECT RAISE(ABORT, 'payment provider unavailable');
        END
        "#,
        name = commitment_id.replace('-', "_"),
    );
    sqlx::query(&sql).execute(pool).await.unwrap();
}
