//! Error taxonomy with stable machine-readable codes.
//!
//! Auth failures are terminal for the request; store failures surface as
//! `store_unavailable` so clients retry instead of re-authenticating.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// No, invalid, or expired session.
    Unauthenticated,
    /// Authenticated but insufficient role/entitlement, or CSRF mismatch.
    Forbidden,
    /// Redemption: unknown or expired key.
    InvalidKey,
    /// Redemption: key already left the `minted` state.
    AlreadyUsed,
    RateLimited,
    /// Credential store unreachable; distinct from `Unauthenticated` so
    /// clients retry rather than re-login.
    ServiceUnavailable,
    UpstreamUnreachable,
    UpstreamTimeout,
    BadRequest(String),
    NotFound,
    Internal,
}

#[derive(Serialize)]
struct ErrorBody {
    ok: bool,
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl ApiError {
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::InvalidKey => "invalid_key",
            Self::AlreadyUsed => "already_used",
            Self::RateLimited => "rate_limited",
            Self::ServiceUnavailable => "store_unavailable",
            Self::UpstreamUnreachable => "upstream_unreachable",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::BadRequest(_) => "bad_request",
            Self::NotFound => "not_found",
            Self::Internal => "internal_error",
        }
    }

    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::InvalidKey | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::AlreadyUsed => StatusCode::CONFLICT,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamUnreachable | Self::UpstreamTimeout => StatusCode::BAD_GATEWAY,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = match &self {
            Self::BadRequest(message) => Some(message.clone()),
            _ => None,
        };
        let body = Json(ErrorBody {
            ok: false,
            error: ErrorDetail {
                code: self.code(),
                message,
            },
        });
        (self.status(), body).into_response()
    }
}

/// Map a storage failure to `ServiceUnavailable`, logging the cause.
pub fn store_error(err: &anyhow::Error) -> ApiError {
    error!("credential store failure: {err:#}");
    ApiError::ServiceUnavailable
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ApiError::Unauthenticated.code(), "unauthorized");
        assert_eq!(ApiError::Forbidden.code(), "forbidden");
        assert_eq!(ApiError::InvalidKey.code(), "invalid_key");
        assert_eq!(ApiError::AlreadyUsed.code(), "already_used");
        assert_eq!(ApiError::RateLimited.code(), "rate_limited");
        assert_eq!(ApiError::ServiceUnavailable.code(), "store_unavailable");
        assert_eq!(ApiError::UpstreamUnreachable.code(), "upstream_unreachable");
        assert_eq!(ApiError::UpstreamTimeout.code(), "upstream_timeout");
        assert_eq!(ApiError::bad_request("x").code(), "bad_request");
        assert_eq!(ApiError::NotFound.code(), "not_found");
        assert_eq!(ApiError::Internal.code(), "internal_error");
    }

    #[test]
    fn statuses_follow_taxonomy() {
        assert_eq!(ApiError::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::AlreadyUsed.status(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError::ServiceUnavailable.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ApiError::UpstreamTimeout.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn into_response_returns_error_envelope() {
        let response = ApiError::InvalidKey.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body_bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body_bytes).unwrap();
        assert_eq!(body["ok"], false);
        assert_eq!(body["error"]["code"], "invalid_key");
    }

    #[tokio::test]
    async fn bad_request_carries_message() {
        let response = ApiError::bad_request("missing field").into_response();
        let body_bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body_bytes).unwrap();
        assert_eq!(body["error"]["message"], "missing field");
    }
}
