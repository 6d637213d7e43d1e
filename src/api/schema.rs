//! Idempotent schema bootstrap, run once at server start.

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::{Instrument, info, info_span};

const STATEMENTS: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS users (
        id UUID PRIMARY KEY,
        email TEXT UNIQUE NOT NULL,
        display_name TEXT NULL,
        role TEXT NOT NULL DEFAULT 'normal',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE INDEX IF NOT EXISTS idx_users_role ON users(role)",
    r"
    CREATE TABLE IF NOT EXISTS sessions (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        session_hash BYTEA UNIQUE NOT NULL,
        refresh_hash BYTEA UNIQUE NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL,
        last_active_at TIMESTAMPTZ NULL,
        revoked_at TIMESTAMPTZ NULL,
        ip TEXT NULL,
        device_info JSONB NOT NULL DEFAULT '{}'::jsonb
    )",
    r"
    CREATE TABLE IF NOT EXISTS entitlements (
        user_id UUID PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
        pro_enabled BOOLEAN NOT NULL DEFAULT false,
        wallet_deployments BOOLEAN NOT NULL DEFAULT false,
        history_export BOOLEAN NOT NULL DEFAULT false,
        chat_agents BOOLEAN NOT NULL DEFAULT false,
        hosted_frontend BOOLEAN NOT NULL DEFAULT false,
        limits JSONB NOT NULL DEFAULT '{}'::jsonb
    )",
    r"
    CREATE TABLE IF NOT EXISTS premium_keys (
        id UUID PRIMARY KEY,
        secret_hash BYTEA NOT NULL,
        lookup_hash BYTEA UNIQUE NOT NULL,
        issued_by_admin UUID NOT NULL REFERENCES users(id),
        status TEXT NOT NULL,
        redeemed_by_user UUID NULL REFERENCES users(id),
        expires_at TIMESTAMPTZ NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE INDEX IF NOT EXISTS idx_premium_keys_status ON premium_keys(status)",
    r"
    CREATE TABLE IF NOT EXISTS user_jobs (
        job_id TEXT PRIMARY KEY,
        user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        kind TEXT NOT NULL DEFAULT 'pipeline',
        prompt TEXT NULL,
        filename TEXT NULL,
        network TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE INDEX IF NOT EXISTS idx_user_jobs_user_created ON user_jobs(user_id, created_at DESC)",
    r"
    CREATE TABLE IF NOT EXISTS job_cache (
        job_id TEXT PRIMARY KEY,
        state TEXT NOT NULL,
        progress INTEGER NOT NULL DEFAULT 0,
        address TEXT NULL,
        fq_name TEXT NULL,
        verified BOOLEAN NOT NULL DEFAULT false,
        explorer_url TEXT NULL,
        completed_at TIMESTAMPTZ NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
];

/// Create the durable tables if they do not exist yet.
///
/// # Errors
/// Returns an error if any statement fails; the transaction rolls back.
pub async fn init_schema(pool: &PgPool) -> Result<()> {
    let mut tx = pool.begin().await.context("begin schema transaction")?;

    for statement in STATEMENTS {
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DDL"
        );
        sqlx::query(statement)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .with_context(|| format!("schema statement failed: {statement}"))?;
    }

    tx.commit().await.context("commit schema transaction")?;
    info!("schema bootstrap complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::STATEMENTS;

    #[test]
    fn statements_cover_all_tables() {
        let ddl = STATEMENTS.join("\n");
        for table in [
            "users",
            "sessions",
            "entitlements",
            "premium_keys",
            "user_jobs",
            "job_cache",
        ] {
            assert!(
                ddl.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")),
                "missing table {table}"
            );
        }
    }

    #[test]
    fn hash_columns_are_unique() {
        let ddl = STATEMENTS.join("\n");
        assert!(ddl.contains("session_hash BYTEA UNIQUE NOT NULL"));
        assert!(ddl.contains("refresh_hash BYTEA UNIQUE NOT NULL"));
        assert!(ddl.contains("lookup_hash BYTEA UNIQUE NOT NULL"));
    }
}
