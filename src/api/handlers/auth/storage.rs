//! Database helpers for users, sessions, and entitlement reads.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::{PgPool, Row};
use std::future::Future;
use std::time::Duration;
use tracing::{Instrument, warn};
use uuid::Uuid;

use super::token::{TOKEN_BYTES, CSRF_TOKEN_BYTES, TokenHasher, generate_token};
use super::types::EntitlementFlags;

const MAX_STORE_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Minimal user row used by auth and the gate.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: Uuid,
    pub email: String,
    pub role: String,
    pub display_name: Option<String>,
}

/// Minimal data for a valid session lookup.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Raw token triple returned to the client exactly once.
#[derive(Debug)]
pub struct SessionTokens {
    pub access: String,
    pub refresh: String,
    pub csrf: String,
}

pub(super) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

fn is_transient_store_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
    )
}

/// Retry a store operation on transient failures with bounded exponential
/// backoff. Validation-style failures pass straight through.
async fn with_retry<T, F, Fut>(mut operation: F) -> Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut delay = RETRY_BASE_DELAY;
    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt + 1 < MAX_STORE_ATTEMPTS && is_transient_store_error(&err) => {
                warn!(attempt, "transient store error, retrying: {err}");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

pub(crate) async fn upsert_user_by_email(pool: &PgPool, email: &str) -> Result<UserRecord> {
    let query = r"
        INSERT INTO users (id, email)
        VALUES ($1, $2)
        ON CONFLICT (email) DO UPDATE SET updated_at = now()
        RETURNING id, email, role, display_name
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(Uuid::new_v4())
        .bind(email)
        .fetch_one(pool)
        .instrument(span)
        .await
        .context("failed to upsert user")?;

    Ok(UserRecord {
        id: row.get("id"),
        email: row.get("email"),
        role: row.get("role"),
        display_name: row.get("display_name"),
    })
}

pub(crate) async fn get_user_by_id(pool: &PgPool, user_id: Uuid) -> Result<Option<UserRecord>> {
    let query = "SELECT id, email, role, display_name FROM users WHERE id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(user_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup user")?;

    Ok(row.map(|row| UserRecord {
        id: row.get("id"),
        email: row.get("email"),
        role: row.get("role"),
        display_name: row.get("display_name"),
    }))
}

pub(crate) async fn get_user_by_email(pool: &PgPool, email: &str) -> Result<Option<UserRecord>> {
    let query = "SELECT id, email, role, display_name FROM users WHERE email = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = with_retry(|| {
        sqlx::query(query)
            .bind(email)
            .fetch_optional(pool)
            .instrument(span.clone())
    })
    .await
    .context("failed to lookup user by email")?;

    Ok(row.map(|row| UserRecord {
        id: row.get("id"),
        email: row.get("email"),
        role: row.get("role"),
        display_name: row.get("display_name"),
    }))
}

pub(crate) async fn update_display_name(
    pool: &PgPool,
    user_id: Uuid,
    display_name: &str,
) -> Result<()> {
    let query = "UPDATE users SET display_name = $2, updated_at = now() WHERE id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(display_name)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to update display name")?;
    Ok(())
}

/// Entitlement rows are created lazily on first need.
pub(crate) async fn ensure_entitlements(pool: &PgPool, user_id: Uuid) -> Result<()> {
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
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to ensure entitlement row")?;
    Ok(())
}

pub(crate) async fn get_entitlements(pool: &PgPool, user_id: Uuid) -> Result<EntitlementFlags> {
    let query = r"
        SELECT pro_enabled, wallet_deployments, history_export, chat_agents,
               hosted_frontend, limits::text AS limits
        FROM entitlements
        WHERE user_id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(user_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to read entitlements")?;

    Ok(row.map_or_else(EntitlementFlags::default, |row| {
        let limits: String = row.get("limits");
        EntitlementFlags {
            pro_enabled: row.get("pro_enabled"),
            wallet_deployments: row.get("wallet_deployments"),
            history_export: row.get("history_export"),
            chat_agents: row.get("chat_agents"),
            hosted_frontend: row.get("hosted_frontend"),
            limits: serde_json::from_str(&limits).unwrap_or_default(),
        }
    }))
}

/// Create a session and return the raw token triple.
///
/// Only hashes are persisted. The insert retries on the (vanishingly rare)
/// hash collision because the hash columns are unique.
pub(crate) async fn create_session(
    pool: &PgPool,
    hasher: &TokenHasher,
    user_id: Uuid,
    ip: Option<&str>,
    device_info: &serde_json::Value,
    access_ttl_seconds: i64,
) -> Result<SessionTokens> {
    let query = r"
        INSERT INTO sessions (id, user_id, session_hash, refresh_hash, expires_at, ip, device_info)
        VALUES ($1, $2, $3, $4, $5, $6, $7::jsonb)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let device_info =
        serde_json::to_string(device_info).context("failed to serialize device info")?;

    for _ in 0..3 {
        let access = generate_token(TOKEN_BYTES)?;
        let refresh = generate_token(TOKEN_BYTES)?;
        let expires_at = Utc::now() + ChronoDuration::seconds(access_ttl_seconds);
        let result = sqlx::query(query)
            .bind(Uuid::new_v4())
            .bind(user_id)
            .bind(hasher.hash(&access))
            .bind(hasher.hash(&refresh))
            .bind(expires_at)
            .bind(ip)
            .bind(&device_info)
            .execute(pool)
            .instrument(span.clone())
            .await;

        match result {
            Ok(_) => {
                let csrf = generate_token(CSRF_TOKEN_BYTES)?;
                return Ok(SessionTokens {
                    access,
                    refresh,
                    csrf,
                });
            }
            Err(err) if is_unique_violation(&err) => {}
            Err(err) => return Err(err).context("failed to insert session"),
        }
    }

    Err(anyhow!("failed to generate unique session tokens"))
}

/// Look up a live session by its access-token hash.
pub(crate) async fn lookup_session_by_access(
    pool: &PgPool,
    token_hash: &[u8],
) -> Result<Option<SessionRecord>> {
    let query = r"
        SELECT id, user_id, expires_at
        FROM sessions
        WHERE session_hash = $1
          AND revoked_at IS NULL
          AND expires_at > now()
        LIMIT 1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = with_retry(|| {
        sqlx::query(query)
            .bind(token_hash)
            .fetch_optional(pool)
            .instrument(span.clone())
    })
    .await
    .context("failed to lookup session")?;

    let Some(row) = row else {
        return Ok(None);
    };

    // Record activity for visibility without extending the session TTL.
    let query = "UPDATE sessions SET last_active_at = now() WHERE session_hash = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(token_hash)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to touch session activity")?;

    Ok(Some(SessionRecord {
        id: row.get("id"),
        user_id: row.get("user_id"),
        expires_at: row.get("expires_at"),
    }))
}

/// Look up a session by refresh-token hash. Refresh tokens outlive the
/// access expiry, so only revocation filters here.
pub(crate) async fn lookup_session_by_refresh(
    pool: &PgPool,
    token_hash: &[u8],
) -> Result<Option<SessionRecord>> {
    let query = r"
        SELECT id, user_id, expires_at
        FROM sessions
        WHERE refresh_hash = $1
          AND revoked_at IS NULL
        LIMIT 1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = with_retry(|| {
        sqlx::query(query)
            .bind(token_hash)
            .fetch_optional(pool)
            .instrument(span.clone())
    })
    .await
    .context("failed to lookup session by refresh hash")?;

    Ok(row.map(|row| SessionRecord {
        id: row.get("id"),
        user_id: row.get("user_id"),
        expires_at: row.get("expires_at"),
    }))
}

/// Rotate all tokens of a session in one UPDATE.
///
/// The old hashes stop matching the instant this commits. Two concurrent
/// refreshes with the same stale token can both pass the lookup and both
/// run this update; last write wins and the loser's tokens die silently.
/// That race is accepted, not serialized.
pub(crate) async fn rotate_session(
    pool: &PgPool,
    hasher: &TokenHasher,
    session_id: Uuid,
    access_ttl_seconds: i64,
) -> Result<SessionTokens> {
    let access = generate_token(TOKEN_BYTES)?;
    let refresh = generate_token(TOKEN_BYTES)?;
    let csrf = generate_token(CSRF_TOKEN_BYTES)?;
    let expires_at = Utc::now() + ChronoDuration::seconds(access_ttl_seconds);

    let query = r"
        UPDATE sessions
        SET session_hash = $2,
            refresh_hash = $3,
            expires_at = $4,
            last_active_at = now()
        WHERE id = $1 AND revoked_at IS NULL
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(session_id)
        .bind(hasher.hash(&access))
        .bind(hasher.hash(&refresh))
        .bind(expires_at)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to rotate session tokens")?;

    Ok(SessionTokens {
        access,
        refresh,
        csrf,
    })
}

/// Revoke by access-token hash. Idempotent; revoking twice is a no-op.
pub(crate) async fn revoke_session(pool: &PgPool, token_hash: &[u8]) -> Result<()> {
    let query = r"
        UPDATE sessions
        SET revoked_at = now()
        WHERE session_hash = $1 AND revoked_at IS NULL
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(token_hash)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to revoke session")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::error::{DatabaseError, ErrorKind};
    use std::borrow::Cow;
    use std::error::Error as StdError;
    use std::fmt;

    #[test]
    fn session_tokens_hold_distinct_values() {
        let tokens = SessionTokens {
            access: "a".to_string(),
            refresh: "r".to_string(),
            csrf: "c".to_string(),
        };
        assert_ne!(tokens.access, tokens.refresh);
        assert_ne!(tokens.access, tokens.csrf);
    }

    #[derive(Debug)]
    struct TestDbError {
        code: Option<&'static str>,
    }

    impl fmt::Display for TestDbError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "test database error")
        }
    }

    impl StdError for TestDbError {}

    impl DatabaseError for TestDbError {
        fn message(&self) -> &'static str {
            "test database error"
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            self.code.map(Cow::Borrowed)
        }

        fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> ErrorKind {
            ErrorKind::UniqueViolation
        }
    }

    #[test]
    fn is_unique_violation_matches_sqlstate() {
        let err = sqlx::Error::Database(Box::new(TestDbError {
            code: Some("23505"),
        }));
        assert!(is_unique_violation(&err));

        let err = sqlx::Error::Database(Box::new(TestDbError {
            code: Some("99999"),
        }));
        assert!(!is_unique_violation(&err));

        let err = sqlx::Error::RowNotFound;
        assert!(!is_unique_violation(&err));
    }

    #[tokio::test]
    async fn with_retry_recovers_from_transient_errors() {
        let calls = std::cell::Cell::new(0u32);
        let result = with_retry(|| {
            let call = calls.get();
            calls.set(call + 1);
            async move {
                if call < 2 {
                    Err(sqlx::Error::PoolTimedOut)
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.ok(), Some(42));
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn with_retry_passes_through_non_transient_errors() {
        let calls = std::cell::Cell::new(0u32);
        let result = with_retry(|| {
            calls.set(calls.get() + 1);
            async { Err::<i32, _>(sqlx::Error::RowNotFound) }
        })
        .await;
        assert!(matches!(result, Err(sqlx::Error::RowNotFound)));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn with_retry_gives_up_after_max_attempts() {
        let calls = std::cell::Cell::new(0u32);
        let result = with_retry(|| {
            calls.set(calls.get() + 1);
            async { Err::<i32, _>(sqlx::Error::PoolTimedOut) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.get(), MAX_STORE_ATTEMPTS);
    }
}
