//! Premium-key endpoints: minting, listing, revocation, redemption.

pub(crate) mod storage;
pub(crate) mod types;

use axum::{
    Json,
    extract::{Extension, Path, Query},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::metrics::{self, MetricsSink};

use super::auth::guard::{authenticate, extract_client_ip, require_csrf, require_role};
use super::auth::rate_limit::{RateLimitAction, RateLimitDecision};
use super::auth::storage::get_entitlements;
use super::auth::{AuthState, Role};
use self::storage::{
    RedeemOutcome, find_key_by_id, list_keys, mint_key, redeem_key_and_grant_pro, set_key_status,
};
use self::types::{KeySummary, MintKeyRequest, MintKeyResponse, RedeemKeyRequest, RevokeKeyRequest};

fn rate_limited(
    auth_state: &AuthState,
    action: RateLimitAction,
    user_id: Uuid,
    headers: &HeaderMap,
) -> bool {
    let ip = extract_client_ip(headers).unwrap_or_else(|| "unknown".to_string());
    let limiter = auth_state.rate_limiter();
    limiter.check(action, &user_id.to_string()) == RateLimitDecision::Limited
        || limiter.check(action, &ip) == RateLimitDecision::Limited
}

#[utoipa::path(
    post,
    path = "/v1/admin/keys",
    request_body = MintKeyRequest,
    responses(
        (status = 200, description = "Key minted; raw key returned once", body = MintKeyResponse),
        (status = 403, description = "Not an admin or CSRF mismatch")
    ),
    tag = "keys"
)]
pub async fn mint(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    metrics_sink: Extension<Arc<dyn MetricsSink>>,
    payload: Option<Json<MintKeyRequest>>,
) -> Response {
    let ctx = match authenticate(&headers, &pool, &auth_state).await {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(),
    };
    if let Err(err) = require_csrf(&headers) {
        return err.into_response();
    }
    let admin = match require_role(&pool, &ctx, Role::Admin).await {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };
    if rate_limited(&auth_state, RateLimitAction::KeysMint, ctx.user_id, &headers) {
        return ApiError::RateLimited.into_response();
    }

    let request = payload.map(|Json(request)| request).unwrap_or_default();
    match mint_key(&pool, auth_state.hasher(), admin.id, request.expires_at).await {
        Ok((id, key)) => {
            metrics_sink.increment(metrics::KEYS_MINT);
            info!(key_id = %id, admin_id = %admin.id, "premium key minted");
            Json(MintKeyResponse {
                ok: true,
                id: id.to_string(),
                key,
                expires_at: request.expires_at,
            })
            .into_response()
        }
        Err(err) => {
            error!("key mint failed: {err:#}");
            ApiError::ServiceUnavailable.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListKeysQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

#[utoipa::path(
    get,
    path = "/v1/admin/keys",
    responses(
        (status = 200, description = "Keys without secret material", body = [KeySummary]),
        (status = 403, description = "Not an admin")
    ),
    tag = "keys"
)]
pub async fn list(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    Query(query): Query<ListKeysQuery>,
) -> Response {
    let ctx = match authenticate(&headers, &pool, &auth_state).await {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(),
    };
    if let Err(err) = require_role(&pool, &ctx, Role::Admin).await {
        return err.into_response();
    }

    if let Some(status) = query.status.as_deref() {
        if !matches!(status, "minted" | "redeemed" | "revoked") {
            return ApiError::bad_request("unknown status filter").into_response();
        }
    }

    match list_keys(&pool, query.status.as_deref(), query.limit.unwrap_or(50)).await {
        Ok(keys) => Json(json!({ "ok": true, "keys": keys })).into_response(),
        Err(err) => {
            error!("key listing failed: {err:#}");
            ApiError::ServiceUnavailable.into_response()
        }
    }
}

#[utoipa::path(
    get,
    path = "/v1/admin/keys/{id}",
    params(("id" = String, Path, description = "Key id")),
    responses(
        (status = 200, description = "Key detail", body = KeySummary),
        (status = 404, description = "Unknown key")
    ),
    tag = "keys"
)]
pub async fn detail(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    Path(id): Path<Uuid>,
) -> Response {
    let ctx = match authenticate(&headers, &pool, &auth_state).await {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(),
    };
    if let Err(err) = require_role(&pool, &ctx, Role::Admin).await {
        return err.into_response();
    }

    match find_key_by_id(&pool, id).await {
        Ok(Some(key)) => Json(json!({ "ok": true, "key": key })).into_response(),
        Ok(None) => ApiError::NotFound.into_response(),
        Err(err) => {
            error!("key lookup failed: {err:#}");
            ApiError::ServiceUnavailable.into_response()
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/admin/keys/revoke",
    request_body = RevokeKeyRequest,
    responses(
        (status = 200, description = "Key revoked"),
        (status = 404, description = "Unknown key")
    ),
    tag = "keys"
)]
pub async fn revoke(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    metrics_sink: Extension<Arc<dyn MetricsSink>>,
    payload: Option<Json<RevokeKeyRequest>>,
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
    if rate_limited(&auth_state, RateLimitAction::KeysRevoke, ctx.user_id, &headers) {
        return ApiError::RateLimited.into_response();
    }
    let Some(Json(request)) = payload else {
        return ApiError::bad_request("missing payload").into_response();
    };

    match set_key_status(&pool, request.id, "revoked").await {
        Ok(true) => {
            metrics_sink.increment(metrics::KEYS_REVOKE);
            info!(key_id = %request.id, "premium key revoked");
            Json(json!({ "ok": true })).into_response()
        }
        Ok(false) => ApiError::NotFound.into_response(),
        Err(err) => {
            error!("key revocation failed: {err:#}");
            ApiError::ServiceUnavailable.into_response()
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/keys/redeem",
    request_body = RedeemKeyRequest,
    responses(
        (status = 200, description = "Key redeemed; entitlements granted"),
        (status = 400, description = "Unknown or expired key"),
        (status = 409, description = "Key already used")
    ),
    tag = "keys"
)]
pub async fn redeem(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    metrics_sink: Extension<Arc<dyn MetricsSink>>,
    payload: Option<Json<RedeemKeyRequest>>,
) -> Response {
    let ctx = match authenticate(&headers, &pool, &auth_state).await {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(),
    };
    if let Err(err) = require_csrf(&headers) {
        return err.into_response();
    }
    if rate_limited(&auth_state, RateLimitAction::KeysRedeem, ctx.user_id, &headers) {
        return ApiError::RateLimited.into_response();
    }
    let Some(Json(request)) = payload else {
        return ApiError::bad_request("missing payload").into_response();
    };
    let key = request.key.trim();
    if key.len() < 10 || key.len() > 256 {
        return ApiError::bad_request("invalid key format").into_response();
    }

    let lookup_hash = auth_state.hasher().hash(key);
    match redeem_key_and_grant_pro(&pool, &lookup_hash, ctx.user_id).await {
        Ok(RedeemOutcome::Redeemed { key_id }) => {
            metrics_sink.increment(metrics::KEYS_REDEEM);
            metrics_sink.increment(metrics::ROLE_UPGRADE);
            info!(key_id = %key_id, user_id = %ctx.user_id, "premium key redeemed");
            let entitlements = get_entitlements(&pool, ctx.user_id).await.unwrap_or_default();
            (
                StatusCode::OK,
                Json(json!({ "ok": true, "entitlements": entitlements })),
            )
                .into_response()
        }
        Ok(RedeemOutcome::InvalidKey) => ApiError::InvalidKey.into_response(),
        Ok(RedeemOutcome::AlreadyUsed) => ApiError::AlreadyUsed.into_response(),
        Err(err) => {
            error!("redemption failed: {err:#}");
            ApiError::ServiceUnavailable.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::email::LogOtpMailer;
    use crate::api::handlers::auth::{AuthConfig, NoopRateLimiter};
    use crate::api::metrics::NoopMetricsSink;
    use secrecy::SecretString;
    use sqlx::postgres::PgPoolOptions;

    fn auth_state() -> Arc<AuthState> {
        Arc::new(AuthState::new(
            AuthConfig::new("http://localhost:3000".to_string()),
            SecretString::from("0123456789abcdef0123456789abcdef".to_string()),
            Arc::new(NoopRateLimiter),
            Arc::new(LogOtpMailer),
        ))
    }

    #[tokio::test]
    async fn redeem_without_session_is_unauthorized() {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://postgres@localhost/postgres")
            .expect("lazy pool");
        let sink: Arc<dyn MetricsSink> = Arc::new(NoopMetricsSink);
        let response = redeem(
            HeaderMap::new(),
            Extension(pool),
            Extension(auth_state()),
            Extension(sink),
            Some(Json(RedeemKeyRequest {
                key: "0123456789abcdef".to_string(),
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn mint_without_session_is_unauthorized() {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://postgres@localhost/postgres")
            .expect("lazy pool");
        let sink: Arc<dyn MetricsSink> = Arc::new(NoopMetricsSink);
        let response = mint(
            HeaderMap::new(),
            Extension(pool),
            Extension(auth_state()),
            Extension(sink),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
