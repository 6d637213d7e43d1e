//! Premium-key storage and the redemption transaction.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

use crate::api::handlers::auth::TokenHasher;
use crate::api::handlers::auth::token::{TOKEN_BYTES, generate_token, sha256_digest};

use super::types::KeySummary;

/// Result of a redemption attempt. Exactly one caller per key ever sees
/// `Redeemed`; everyone else gets `InvalidKey` or `AlreadyUsed`.
#[derive(Debug, PartialEq, Eq)]
pub enum RedeemOutcome {
    Redeemed { key_id: Uuid },
    InvalidKey,
    AlreadyUsed,
}

/// Mint a key and return its id plus the raw secret (shown exactly once).
pub(crate) async fn mint_key(
    pool: &PgPool,
    hasher: &TokenHasher,
    issued_by_admin: Uuid,
    expires_at: Option<DateTime<Utc>>,
) -> Result<(Uuid, String)> {
    let id = Uuid::new_v4();
    let key = generate_token(TOKEN_BYTES)?;
    let query = r"
        INSERT INTO premium_keys
            (id, secret_hash, lookup_hash, issued_by_admin, status, redeemed_by_user, expires_at)
        VALUES ($1, $2, $3, $4, 'minted', NULL, $5)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(id)
        .bind(sha256_digest(&key))
        .bind(hasher.hash(&key))
        .bind(issued_by_admin)
        .bind(expires_at)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to mint premium key")?;
    Ok((id, key))
}

fn summary_from_row(row: &sqlx::postgres::PgRow) -> KeySummary {
    KeySummary {
        id: row.get::<Uuid, _>("id").to_string(),
        issued_by_admin: row.get::<Uuid, _>("issued_by_admin").to_string(),
        status: row.get("status"),
        redeemed_by_user: row
            .get::<Option<Uuid>, _>("redeemed_by_user")
            .map(|id| id.to_string()),
        expires_at: row.get("expires_at"),
        created_at: row.get("created_at"),
    }
}

pub(crate) async fn find_key_by_id(pool: &PgPool, id: Uuid) -> Result<Option<KeySummary>> {
    let query = r"
        SELECT id, issued_by_admin, status, redeemed_by_user, expires_at, created_at
        FROM premium_keys
        WHERE id = $1
        LIMIT 1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup premium key")?;
    Ok(row.as_ref().map(summary_from_row))
}

pub(crate) async fn list_keys(
    pool: &PgPool,
    status: Option<&str>,
    limit: i64,
) -> Result<Vec<KeySummary>> {
    let query = r"
        SELECT id, issued_by_admin, status, redeemed_by_user, expires_at, created_at
        FROM premium_keys
        WHERE ($1::text IS NULL OR status = $1)
        ORDER BY created_at DESC
        LIMIT $2
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(status)
        .bind(limit.clamp(1, 200))
        .fetch_all(pool)
        .instrument(span)
        .await
        .context("failed to list premium keys")?;
    Ok(rows.iter().map(summary_from_row).collect())
}

/// Operator-initiated state change; not contested, no locking needed.
pub(crate) async fn set_key_status(pool: &PgPool, id: Uuid, status: &str) -> Result<bool> {
    let query = "UPDATE premium_keys SET status = $2 WHERE id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(id)
        .bind(status)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to update premium key status")?;
    Ok(result.rows_affected() > 0)
}

/// Redeem a key and grant pro access, all inside one transaction.
///
/// The `FOR UPDATE` lock serializes concurrent attempts on the same key;
/// the status guard then lets exactly one of them through. Any failure
/// rolls the whole grant back.
pub(crate) async fn redeem_key_and_grant_pro(
    pool: &PgPool,
    lookup_hash: &[u8],
    user_id: Uuid,
) -> Result<RedeemOutcome> {
    let mut tx = pool.begin().await.context("begin redemption transaction")?;

    let query = r"
        SELECT id, status, expires_at
        FROM premium_keys
        WHERE lookup_hash = $1
        LIMIT 1
        FOR UPDATE
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(lookup_hash)
        .fetch_optional(&mut *tx)
        .instrument(span)
        .await
        .context("failed to lock premium key")?;

    let Some(row) = row else {
        let _ = tx.rollback().await;
        return Ok(RedeemOutcome::InvalidKey);
    };

    // Expired keys are invalid regardless of their status.
    if let Some(expires_at) = row.get::<Option<DateTime<Utc>>, _>("expires_at") {
        if expires_at < Utc::now() {
            let _ = tx.rollback().await;
            return Ok(RedeemOutcome::InvalidKey);
        }
    }

    let status: String = row.get("status");
    if status != "minted" {
        let _ = tx.rollback().await;
        return Ok(RedeemOutcome::AlreadyUsed);
    }
    let key_id: Uuid = row.get("id");

    let query = r"
        UPDATE premium_keys
        SET status = 'redeemed', redeemed_by_user = $2
        WHERE id = $1 AND status = 'minted'
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(key_id)
        .bind(user_id)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to mark key redeemed")?;

    // Admins keep their role; everyone else moves up to pro.
    let query = r"
        UPDATE users
        SET role = CASE WHEN role = 'admin' THEN role ELSE 'pro' END,
            updated_at = now()
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to upgrade user role")?;

    let query = r"
        INSERT INTO entitlements (user_id)
        VALUES ($1)
        ON CONFLICT (user_id) DO NOTHING
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to ensure entitlement row")?;

    let query = "UPDATE entitlements SET pro_enabled = true WHERE user_id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to enable pro entitlement")?;

    tx.commit().await.context("commit redemption transaction")?;
    Ok(RedeemOutcome::Redeemed { key_id })
}

#[cfg(test)]
mod tests {
    use super::RedeemOutcome;
    use uuid::Uuid;

    #[test]
    fn redeem_outcome_variants_compare() {
        let key_id = Uuid::nil();
        assert_eq!(
            RedeemOutcome::Redeemed { key_id },
            RedeemOutcome::Redeemed { key_id }
        );
        assert_ne!(RedeemOutcome::InvalidKey, RedeemOutcome::AlreadyUsed);
    }
}
