use axum::{
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use sqlx::{Connection, PgPool};
use std::sync::Arc;
use tracing::{Instrument, error, info_span};
use utoipa::ToSchema;

use crate::gateway::GatewayState;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct Health {
    name: String,
    version: String,
    database: String,
    job_service: String,
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Database and upstream job service are healthy", body = [Health]),
        (status = 503, description = "Database or upstream job service is unhealthy", body = [Health])
    ),
    tag = "health"
)]
// axum handler for health
pub async fn health(
    pool: Extension<PgPool>,
    gateway: Extension<Arc<GatewayState>>,
) -> impl IntoResponse {
    let acquire_span = info_span!(
        "db.acquire",
        db.system = "postgresql",
        db.operation = "ACQUIRE"
    );
    let database_ok = match pool.0.acquire().instrument(acquire_span).await {
        Ok(mut conn) => {
            let ping_span = info_span!("db.ping", db.system = "postgresql", db.operation = "PING");
            match conn.ping().instrument(ping_span).await {
                Ok(()) => true,
                Err(error) => {
                    error!("Failed to ping database: {}", error);
                    false
                }
            }
        }
        Err(error) => {
            error!("Failed to acquire database connection: {}", error);
            false
        }
    };

    let upstream_ok = gateway.client().reachable().await;
    let is_healthy = database_ok && upstream_ok;

    let health = Health {
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: if database_ok { "ok" } else { "error" }.to_string(),
        job_service: if upstream_ok { "ok" } else { "error" }.to_string(),
    };

    let status = if is_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(health)).into_response()
}

#[cfg(test)]
mod tests {
    use super::Health;

    #[test]
    fn health_serializes_status_fields() {
        let health = Health {
            name: "forgegate".to_string(),
            version: "0.1.0".to_string(),
            database: "ok".to_string(),
            job_service: "error".to_string(),
        };
        let value = serde_json::to_value(&health).expect("serialize");
        assert_eq!(value["database"], "ok");
        assert_eq!(value["job_service"], "error");
    }
}
