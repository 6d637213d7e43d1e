//! Job ownership records and the cached job state.
//!
//! Deliberately narrow: the gateway needs ownership checks before opening a
//! stream and a place to record verification results. Full job CRUD lives
//! with the upstream service.

use anyhow::{Context, Result};
use axum::{
    Json,
    extract::{Extension, Path},
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tracing::{Instrument, error};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::api::error::ApiError;

use super::auth::AuthState;
use super::auth::guard::{authenticate, require_csrf};

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct AttachJobRequest {
    pub job_id: String,
    pub network: String,
    pub kind: Option<String>,
    pub prompt: Option<String>,
    pub filename: Option<String>,
}

/// Fields the verification trigger writes back after a stream completes.
#[derive(Debug, Clone, Default)]
pub struct JobCachePatch {
    pub state: String,
    pub address: Option<String>,
    pub fq_name: Option<String>,
    pub verified: Option<bool>,
}

pub(crate) async fn user_owns_job(pool: &PgPool, user_id: Uuid, job_id: &str) -> Result<bool> {
    let query = "SELECT 1 FROM user_jobs WHERE user_id = $1 AND job_id = $2";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(user_id)
        .bind(job_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to check job ownership")?;
    Ok(row.is_some())
}

pub(crate) async fn attach_job(
    pool: &PgPool,
    user_id: Uuid,
    request: &AttachJobRequest,
) -> Result<()> {
    let query = r"
        INSERT INTO user_jobs (job_id, user_id, kind, prompt, filename, network)
        VALUES ($1, $2, COALESCE($3, 'pipeline'), $4, $5, $6)
        ON CONFLICT (job_id) DO UPDATE
          SET user_id = EXCLUDED.user_id,
              kind = EXCLUDED.kind,
              prompt = EXCLUDED.prompt,
              filename = EXCLUDED.filename,
              network = EXCLUDED.network
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(&request.job_id)
        .bind(user_id)
        .bind(request.kind.as_deref())
        .bind(request.prompt.as_deref())
        .bind(request.filename.as_deref())
        .bind(&request.network)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to attach job")?;
    Ok(())
}

pub(crate) async fn upsert_job_cache(
    pool: &PgPool,
    job_id: &str,
    patch: &JobCachePatch,
) -> Result<()> {
    let query = r"
        INSERT INTO job_cache (job_id, state, address, fq_name, verified, completed_at)
        VALUES ($1, $2, $3, $4, COALESCE($5, false),
                CASE WHEN $2 = 'completed' THEN now() ELSE NULL END)
        ON CONFLICT (job_id) DO UPDATE SET
            state = EXCLUDED.state,
            address = COALESCE(EXCLUDED.address, job_cache.address),
            fq_name = COALESCE(EXCLUDED.fq_name, job_cache.fq_name),
            verified = COALESCE($5, job_cache.verified),
            completed_at = COALESCE(EXCLUDED.completed_at, job_cache.completed_at),
            updated_at = now()
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(job_id)
        .bind(&patch.state)
        .bind(patch.address.as_deref())
        .bind(patch.fq_name.as_deref())
        .bind(patch.verified)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to upsert job cache")?;
    Ok(())
}

fn job_row_to_json(row: &sqlx::postgres::PgRow) -> serde_json::Value {
    json!({
        "job_id": row.get::<String, _>("job_id"),
        "kind": row.get::<String, _>("kind"),
        "network": row.get::<String, _>("network"),
        "filename": row.get::<Option<String>, _>("filename"),
        "created_at": row.get::<chrono::DateTime<chrono::Utc>, _>("created_at"),
        "state": row.get::<Option<String>, _>("state"),
        "address": row.get::<Option<String>, _>("address"),
        "verified": row.get::<Option<bool>, _>("verified"),
        "completed_at": row.get::<Option<chrono::DateTime<chrono::Utc>>, _>("completed_at"),
    })
}

#[utoipa::path(
    post,
    path = "/v1/jobs/attach",
    request_body = AttachJobRequest,
    responses(
        (status = 200, description = "Job bound to the caller"),
        (status = 401, description = "No session")
    ),
    tag = "jobs"
)]
pub async fn attach(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<AttachJobRequest>>,
) -> Response {
    let ctx = match authenticate(&headers, &pool, &auth_state).await {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(),
    };
    if let Err(err) = require_csrf(&headers) {
        return err.into_response();
    }
    let Some(Json(request)) = payload else {
        return ApiError::bad_request("missing payload").into_response();
    };
    if request.job_id.trim().is_empty() || request.network.trim().is_empty() {
        return ApiError::bad_request("job_id and network are required").into_response();
    }

    match attach_job(&pool, ctx.user_id, &request).await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(err) => {
            error!("job attach failed: {err:#}");
            ApiError::ServiceUnavailable.into_response()
        }
    }
}

#[utoipa::path(
    get,
    path = "/v1/jobs",
    responses(
        (status = 200, description = "Owned jobs joined with cached state"),
        (status = 401, description = "No session")
    ),
    tag = "jobs"
)]
pub async fn list(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
) -> Response {
    let ctx = match authenticate(&headers, &pool, &auth_state).await {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(),
    };

    let sql = r"
        SELECT j.job_id, j.kind, j.network, j.filename, j.created_at,
               c.state, c.address, c.verified, c.completed_at
        FROM user_jobs j
        LEFT JOIN job_cache c ON c.job_id = j.job_id
        WHERE j.user_id = $1
        ORDER BY j.created_at DESC, j.job_id DESC
        LIMIT 50
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = sql
    );
    match sqlx::query(sql)
        .bind(ctx.user_id)
        .fetch_all(&pool.0)
        .instrument(span)
        .await
    {
        Ok(rows) => {
            let jobs: Vec<serde_json::Value> = rows.iter().map(job_row_to_json).collect();
            Json(json!({ "ok": true, "jobs": jobs })).into_response()
        }
        Err(err) => {
            error!("job listing failed: {err}");
            ApiError::ServiceUnavailable.into_response()
        }
    }
}

#[utoipa::path(
    get,
    path = "/v1/jobs/{id}",
    params(("id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "Job with cached state"),
        (status = 404, description = "Not owned or unknown")
    ),
    tag = "jobs"
)]
pub async fn detail(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    Path(job_id): Path<String>,
) -> Response {
    let ctx = match authenticate(&headers, &pool, &auth_state).await {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(),
    };

    let sql = r"
        SELECT j.job_id, j.kind, j.network, j.filename, j.created_at,
               c.state, c.address, c.verified, c.completed_at
        FROM user_jobs j
        LEFT JOIN job_cache c ON c.job_id = j.job_id
        WHERE j.user_id = $1 AND j.job_id = $2
        LIMIT 1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = sql
    );
    match sqlx::query(sql)
        .bind(ctx.user_id)
        .bind(&job_id)
        .fetch_optional(&pool.0)
        .instrument(span)
        .await
    {
        Ok(Some(row)) => {
            Json(json!({ "ok": true, "job": job_row_to_json(&row) })).into_response()
        }
        Ok(None) => ApiError::NotFound.into_response(),
        Err(err) => {
            error!("job detail failed: {err}");
            ApiError::ServiceUnavailable.into_response()
        }
    }
}
