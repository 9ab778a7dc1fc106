//! # Idempotency protocol
//!
//! Every money-moving mutation carries a caller-supplied key. Together with a
//! [`Scope`] (operation + campaign) it identifies one logical request:
//!
//! 1. A stored response for `(key, scope)` is replayed verbatim.
//! 2. Otherwise a placeholder row is inserted as the first write of the
//!    business transaction. The `UNIQUE (key, scope)` constraint is what
//!    catches a concurrent duplicate: the loser rolls back and replays the
//!    winner's response.
//! 3. The owner runs the business logic on that same transaction.
//! 4. [`settle`] writes the response and commits.
//!
//! If the business logic fails the placeholder rolls back with it, so a
//! corrected retry may reuse the key.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use tracing::{debug, warn};

use crate::db::begin_write;
use crate::errors::{EscrowError, Result};

const MAX_KEY_LEN: usize = 255;

/// Money-moving operations guarded by a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Commit,
    Refund,
    Release,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Refund => "refund",
            Self::Release => "release",
        }
    }
}

/// `<operation>:<campaign id>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope(String);

impl Scope {
    pub fn new(operation: Operation, campaign_id: &str) -> Self {
        Scope(format!("{}:{campaign_id}", operation.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated caller-supplied key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn parse(raw: &str) -> Result<Self> {
        let key = raw.trim();
        if key.is_empty() {
            return Err(EscrowError::Validation("idempotency key is required".into()));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(EscrowError::Validation(format!(
                "idempotency key exceeds {MAX_KEY_LEN} characters"
            )));
        }
        Ok(IdempotencyKey(key.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Hex SHA-256 of the request's canonical JSON.
pub fn request_hash<T: Serialize>(request: &T) -> Result<String> {
    let body = serde_json::to_vec(request)?;
    Ok(hex::encode(Sha256::digest(&body)))
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct IdempotencyRecord {
    pub id: i64,
    pub key: String,
    pub scope: String,
    pub request_hash: String,
    pub response: Option<String>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

/// How a keyed request was answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "result", rename_all = "snake_case")]
pub enum Executed<T> {
    /// First execution under this key.
    Fresh(T),
    /// Same key, same payload: stored response replayed.
    Replayed(T),
    /// Same key, different payload. The original response is returned and
    /// nothing is re-executed.
    Mismatched(T),
    /// The key is claimed but the owner has not written a response yet.
    Processing,
}

impl<T> Executed<T> {
    pub fn result(&self) -> Option<&T> {
        match self {
            Executed::Fresh(v) | Executed::Replayed(v) | Executed::Mismatched(v) => Some(v),
            Executed::Processing => None,
        }
    }

    pub fn into_result(self) -> Option<T> {
        match self {
            Executed::Fresh(v) | Executed::Replayed(v) | Executed::Mismatched(v) => Some(v),
            Executed::Processing => None,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, Executed::Fresh(_))
    }
}

/// Proof that the caller owns `(key, scope)` within its transaction.
#[derive(Debug)]
pub struct Claim {
    id: i64,
}

pub enum Admission<T> {
    /// Caller owns the key; run the work on this transaction, then [`settle`].
    Proceed(Transaction<'static, Sqlite>, Claim),
    /// Already answered (or in flight); return this to the caller as is.
    Settled(Executed<T>),
}

// ─────────────────────────────────────────────────────────
// Storage helpers
// ─────────────────────────────────────────────────────────

pub async fn find(
    conn: &mut SqliteConnection,
    key: &IdempotencyKey,
    scope: &Scope,
) -> Result<Option<IdempotencyRecord>> {
    let row = sqlx::query_as::<_, IdempotencyRecord>(
        r#"
        SELECT id, key, scope, request_hash, response, created_at, completed_at
        FROM   idempotency_keys
        WHERE  key = ?1 AND scope = ?2
        "#,
    )
    .bind(key.as_str())
    .bind(scope.as_str())
    .fetch_optional(conn)
    .await?;
    Ok(row)
}

/// Insert the placeholder row. `None` means another request holds the key.
pub async fn claim(
    conn: &mut SqliteConnection,
    key: &IdempotencyKey,
    scope: &Scope,
    request_hash: &str,
    now: i64,
) -> Result<Option<Claim>> {
    let inserted = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO idempotency_keys (key, scope, request_hash, created_at)
        VALUES (?1, ?2, ?3, ?4)
        RETURNING id
        "#,
    )
    .bind(key.as_str())
    .bind(scope.as_str())
    .bind(request_hash)
    .bind(now)
    .fetch_one(conn)
    .await;

    match inserted {
        Ok(id) => Ok(Some(Claim { id })),
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Record the final response for future replays.
pub async fn complete<T: Serialize>(
    conn: &mut SqliteConnection,
    claim: &Claim,
    response: &T,
    now: i64,
) -> Result<()> {
    let body = serde_json::to_string(response)?;
    sqlx::query("UPDATE idempotency_keys SET response = ?1, completed_at = ?2 WHERE id = ?3")
        .bind(body)
        .bind(now)
        .bind(claim.id)
        .execute(conn)
        .await?;
    Ok(())
}

impl IdempotencyRecord {
    /// Turn a stored record into the answer for a repeated request.
    pub fn replay<T: DeserializeOwned>(&self, request_hash: &str) -> Result<Executed<T>> {
        let Some(body) = self.response.as_deref() else {
            return Ok(Executed::Processing);
        };
        let value: T = serde_json::from_str(body)?;

        if self.request_hash != request_hash {
            let anomaly = EscrowError::DuplicateRequest {
                key: self.key.clone(),
                scope: self.scope.clone(),
            };
            warn!(code = anomaly.code(), "{anomaly}; returning original response");
            return Ok(Executed::Mismatched(value));
        }
        Ok(Executed::Replayed(value))
    }
}

// ─────────────────────────────────────────────────────────
// Protocol
// ─────────────────────────────────────────────────────────

/// Steps 1 and 2: replay a stored answer or claim the key.
pub async fn admit<T: DeserializeOwned>(
    pool: &SqlitePool,
    key: &IdempotencyKey,
    scope: &Scope,
    request_hash: &str,
    now: i64,
) -> Result<Admission<T>> {
    {
        let mut conn = pool.acquire().await?;
        if let Some(record) = find(&mut conn, key, scope).await? {
            debug!(scope = %scope, "Idempotency key already seen");
            return Ok(Admission::Settled(record.replay(request_hash)?));
        }
    }

    let mut tx = begin_write(pool).await?;
    if let Some(claim) = claim(&mut tx, key, scope, request_hash, now).await? {
        return Ok(Admission::Proceed(tx, claim));
    }
    tx.rollback().await?;

    debug!(scope = %scope, "Lost idempotency race; replaying winner");
    let mut conn = pool.acquire().await?;
    match find(&mut conn, key, scope).await? {
        Some(record) => Ok(Admission::Settled(record.replay(request_hash)?)),
        // The winner rolled back between our insert and this read.
        None => Ok(Admission::Settled(Executed::Processing)),
    }
}

/// Step 4: store the response and commit the whole unit of work.
pub async fn settle<T: Serialize>(
    mut tx: Transaction<'static, Sqlite>,
    claim: Claim,
    response: &T,
    now: i64,
) -> Result<()> {
    complete(&mut tx, &claim, response, now).await?;
    tx.commit().await?;
    Ok(())
}
