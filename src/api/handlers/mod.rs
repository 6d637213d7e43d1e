//! API handlers for Forgegate.
//!
//! This module organizes the service's route handlers: auth/session
//! endpoints, premium keys, admin overrides, the narrow job surface, and
//! operational endpoints.

pub mod admin;
pub mod auth;
pub mod health;
pub mod jobs;
pub mod keys;
pub mod root;

use axum::{
    Json,
    extract::Extension,
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;

use crate::api::metrics::AtomicMetricsSink;

use self::auth::AuthState;
use self::auth::guard::authenticate;

#[utoipa::path(
    get,
    path = "/v1/metrics",
    responses(
        (status = 200, description = "Counter snapshot"),
        (status = 401, description = "No session")
    ),
    tag = "metrics"
)]
pub async fn metrics_snapshot(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    sink: Extension<Arc<AtomicMetricsSink>>,
) -> Response {
    if let Err(err) = authenticate(&headers, &pool, &auth_state).await {
        return err.into_response();
    }
    Json(json!({ "ok": true, "metrics": sink.snapshot() })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::email::LogOtpMailer;
    use crate::api::handlers::auth::{AuthConfig, NoopRateLimiter};
    use axum::http::StatusCode;
    use secrecy::SecretString;
    use sqlx::postgres::PgPoolOptions;

    #[tokio::test]
    async fn metrics_requires_session() {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://postgres@localhost/postgres")
            .expect("lazy pool");
        let auth_state = Arc::new(AuthState::new(
            AuthConfig::new("http://localhost:3000".to_string()),
            SecretString::from("0123456789abcdef0123456789abcdef".to_string()),
            Arc::new(NoopRateLimiter),
            Arc::new(LogOtpMailer),
        ));
        let response = metrics_snapshot(
            HeaderMap::new(),
            Extension(pool),
            Extension(auth_state),
            Extension(Arc::new(AtomicMetricsSink::new())),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
