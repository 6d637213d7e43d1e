//! Admin endpoints for entitlement overrides and user visibility.

use anyhow::{Context, Result};
use axum::{
    Json,
    extract::{Extension, Query},
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tracing::{Instrument, error, info};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::metrics::{self, MetricsSink};

use super::auth::guard::{authenticate, require_csrf, require_role};
use super::auth::storage::{ensure_entitlements, upsert_user_by_email};
use super::auth::{AuthState, Role};

#[derive(ToSchema, Serialize, Deserialize, Debug, Default)]
pub struct EntitlementOverrideRequest {
    pub user_id: Uuid,
    pub role: Option<String>,
    pub pro_enabled: Option<bool>,
    pub wallet_deployments: Option<bool>,
    pub history_export: Option<bool>,
    pub chat_agents: Option<bool>,
    pub hosted_frontend: Option<bool>,
    pub limits: Option<serde_json::Value>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct DowngradeRequest {
    pub user_id: Uuid,
}

/// Apply a role and/or flag override in one transaction.
pub(crate) async fn apply_entitlement_override(
    pool: &PgPool,
    request: &EntitlementOverrideRequest,
) -> Result<()> {
    let mut tx = pool.begin().await.context("begin override transaction")?;

    if let Some(role) = request.role.as_deref() {
        let query = "UPDATE users SET role = $2, updated_at = now() WHERE id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(request.user_id)
            .bind(role)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to update role")?;
    }

    let query = "INSERT INTO entitlements (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(request.user_id)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to ensure entitlement row")?;

    let query = r"
        UPDATE entitlements
        SET pro_enabled = COALESCE($2, pro_enabled),
            wallet_deployments = COALESCE($3, wallet_deployments),
            history_export = COALESCE($4, history_export),
            chat_agents = COALESCE($5, chat_agents),
            hosted_frontend = COALESCE($6, hosted_frontend),
            limits = COALESCE($7::jsonb, limits)
        WHERE user_id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let limits = request
        .limits
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .context("failed to serialize limits")?;
    sqlx::query(query)
        .bind(request.user_id)
        .bind(request.pro_enabled)
        .bind(request.wallet_deployments)
        .bind(request.history_export)
        .bind(request.chat_agents)
        .bind(request.hosted_frontend)
        .bind(limits)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to update entitlement flags")?;

    tx.commit().await.context("commit override transaction")?;
    Ok(())
}

#[utoipa::path(
    post,
    path = "/v1/admin/users/entitlements",
    request_body = EntitlementOverrideRequest,
    responses(
        (status = 200, description = "Override applied"),
        (status = 403, description = "Not an admin or CSRF mismatch")
    ),
    tag = "admin"
)]
pub async fn set_entitlements(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    metrics_sink: Extension<Arc<dyn MetricsSink>>,
    payload: Option<Json<EntitlementOverrideRequest>>,
) -> Response {
    let ctx = match authenticate(&headers, &pool, &auth_state).await {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(),
    };
    if let Err(err) = require_csrf(&headers) {
        return err.into_response();
    }
    if let Err(err) = require_role(&pool, &ctx, Role::Admin).await {
        return err.into_response();
    }
    let Some(Json(request)) = payload else {
        return ApiError::bad_request("missing payload").into_response();
    };
    if let Some(role) = request.role.as_deref() {
        if !matches!(role, "normal" | "pro" | "admin") {
            return ApiError::bad_request("unknown role").into_response();
        }
    }

    match apply_entitlement_override(&pool, &request).await {
        Ok(()) => {
            metrics_sink.increment(metrics::ENTITLEMENTS_UPDATE);
            info!(user_id = %request.user_id, "entitlement override applied");
            Json(json!({ "ok": true })).into_response()
        }
        Err(err) => {
            error!("entitlement override failed: {err:#}");
            ApiError::ServiceUnavailable.into_response()
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/admin/users/downgrade",
    request_body = DowngradeRequest,
    responses(
        (status = 200, description = "User downgraded to normal"),
        (status = 403, description = "Not an admin or CSRF mismatch")
    ),
    tag = "admin"
)]
pub async fn downgrade(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    metrics_sink: Extension<Arc<dyn MetricsSink>>,
    payload: Option<Json<DowngradeRequest>>,
) -> Response {
    let ctx = match authenticate(&headers, &pool, &auth_state).await {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(),
    };
    if let Err(err) = require_csrf(&headers) {
        return err.into_response();
    }
    if let Err(err) = require_role(&pool, &ctx, Role::Admin).await {
        return err.into_response();
    }
    let Some(Json(request)) = payload else {
        return ApiError::bad_request("missing payload").into_response();
    };

    let override_request = EntitlementOverrideRequest {
        user_id: request.user_id,
        role: Some("normal".to_string()),
        pro_enabled: Some(false),
        ..EntitlementOverrideRequest::default()
    };
    match apply_entitlement_override(&pool, &override_request).await {
        Ok(()) => {
            metrics_sink.increment(metrics::ROLE_DOWNGRADE);
            info!(user_id = %request.user_id, "user downgraded");
            Json(json!({ "ok": true })).into_response()
        }
        Err(err) => {
            error!("downgrade failed: {err:#}");
            ApiError::ServiceUnavailable.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ActiveUsersQuery {
    pub limit: Option<i64>,
}

#[utoipa::path(
    get,
    path = "/v1/admin/users/active",
    responses(
        (status = 200, description = "Users with live sessions"),
        (status = 403, description = "Not an admin")
    ),
    tag = "admin"
)]
pub async fn active_users(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    Query(query): Query<ActiveUsersQuery>,
) -> Response {
    let ctx = match authenticate(&headers, &pool, &auth_state).await {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(),
    };
    if let Err(err) = require_role(&pool, &ctx, Role::Admin).await {
        return err.into_response();
    }

    let sql = r"
        SELECT u.id, u.email, u.role, u.display_name,
               MAX(COALESCE(s.last_active_at, s.expires_at)) AS last_seen_at
        FROM sessions s
        JOIN users u ON u.id = s.user_id
        WHERE s.revoked_at IS NULL AND s.expires_at > now()
        GROUP BY u.id, u.email, u.role, u.display_name
        ORDER BY last_seen_at DESC
        LIMIT $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = sql
    );
    let rows = sqlx::query(sql)
        .bind(query.limit.unwrap_or(200).clamp(1, 1000))
        .fetch_all(&pool.0)
        .instrument(span)
        .await;

    match rows {
        Ok(rows) => {
            let users: Vec<serde_json::Value> = rows
                .iter()
                .map(|row| {
                    json!({
                        "id": row.get::<Uuid, _>("id").to_string(),
                        "email": row.get::<String, _>("email"),
                        "role": row.get::<String, _>("role"),
                        "display_name": row.get::<Option<String>, _>("display_name"),
                        "last_seen_at": row.get::<Option<chrono::DateTime<chrono::Utc>>, _>("last_seen_at"),
                    })
                })
                .collect();
            Json(json!({ "ok": true, "users": users })).into_response()
        }
        Err(err) => {
            error!("active user listing failed: {err}");
            ApiError::ServiceUnavailable.into_response()
        }
    }
}

/// Promote seed emails to admin with full entitlements at startup.
pub async fn seed_admins(pool: &PgPool, emails: &[String]) -> Result<()> {
    for email in emails {
        let user = upsert_user_by_email(pool, email)
            .await
            .with_context(|| format!("failed to seed admin {email}"))?;
        ensure_entitlements(pool, user.id).await?;
        let request = EntitlementOverrideRequest {
            user_id: user.id,
            role: Some("admin".to_string()),
            pro_enabled: Some(true),
            wallet_deployments: Some(true),
            history_export: Some(true),
            chat_agents: Some(true),
            hosted_frontend: Some(true),
            limits: None,
        };
        apply_entitlement_override(pool, &request).await?;
        info!(email = %email, "seeded admin");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downgrade_override_resets_role_and_pro() {
        let request = EntitlementOverrideRequest {
            user_id: Uuid::nil(),
            role: Some("normal".to_string()),
            pro_enabled: Some(false),
            ..EntitlementOverrideRequest::default()
        };
        assert_eq!(request.role.as_deref(), Some("normal"));
        assert_eq!(request.pro_enabled, Some(false));
        assert!(request.wallet_deployments.is_none());
    }

    #[test]
    fn override_request_parses_partial_payloads() {
        let request: EntitlementOverrideRequest = serde_json::from_value(json!({
            "user_id": Uuid::nil(),
            "chat_agents": true
        }))
        .expect("parse");
        assert_eq!(request.chat_agents, Some(true));
        assert!(request.role.is_none());
    }
}
