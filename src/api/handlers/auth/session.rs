//! Session endpoints: OTP login, refresh, logout, and introspection.

use axum::{
    Json,
    extract::Extension,
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{InvalidHeaderValue, SET_COOKIE},
    },
    response::{IntoResponse, Response},
};
use regex::Regex;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::api::email::OtpMessage;
use crate::api::error::ApiError;
use crate::api::metrics::{self, MetricsSink};

use super::guard::{
    ACCESS_COOKIE, CSRF_COOKIE, REFRESH_COOKIE, authenticate, extract_client_ip, extract_cookie,
};
use super::rate_limit::{RateLimitAction, RateLimitDecision};
use super::state::{AuthConfig, AuthState};
use super::storage::{
    SessionTokens, create_session, ensure_entitlements, get_entitlements, get_user_by_email,
    get_user_by_id, lookup_session_by_refresh, revoke_session, rotate_session,
    update_display_name, upsert_user_by_email,
};
use super::types::{
    AuthMode, SendOtpRequest, SendOtpResponse, SessionEnvelope, UserProfile, VerifyOtpRequest,
};

/// Normalize an email for lookup/uniqueness checks.
fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Basic email format check on already-normalized input.
fn valid_email(email_normalized: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|regex| regex.is_match(email_normalized))
}

fn coded_error(status: StatusCode, code: &str) -> Response {
    (status, Json(json!({ "ok": false, "error": { "code": code } }))).into_response()
}

/// Build one auth cookie. Access/refresh are `HttpOnly`; the CSRF cookie is
/// readable so the client can echo it in a header (double-submit).
fn auth_cookie(
    config: &AuthConfig,
    name: &str,
    value: &str,
    max_age_seconds: i64,
    http_only: bool,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!("{name}={value}; Path=/; SameSite=Lax; Max-Age={max_age_seconds}");
    if http_only {
        cookie.push_str("; HttpOnly");
    }
    if config.session_cookie_secure() {
        cookie.push_str("; Secure");
    }
    if let Some(domain) = config.cookie_domain() {
        cookie.push_str("; Domain=");
        cookie.push_str(domain);
    }
    HeaderValue::from_str(&cookie)
}

/// Set the full access/refresh/csrf cookie triple.
fn apply_session_cookies(config: &AuthConfig, tokens: &SessionTokens) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let pairs = [
        (ACCESS_COOKIE, tokens.access.as_str(), config.access_ttl_seconds(), true),
        (REFRESH_COOKIE, tokens.refresh.as_str(), config.refresh_ttl_seconds(), true),
        (CSRF_COOKIE, tokens.csrf.as_str(), config.access_ttl_seconds(), false),
    ];
    for (name, value, max_age, http_only) in pairs {
        match auth_cookie(config, name, value, max_age, http_only) {
            Ok(cookie) => {
                headers.append(SET_COOKIE, cookie);
            }
            Err(err) => error!("failed to build {name} cookie: {err}"),
        }
    }
    headers
}

fn clear_session_cookies(config: &AuthConfig) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for name in [ACCESS_COOKIE, REFRESH_COOKIE, CSRF_COOKIE] {
        match auth_cookie(config, name, "", 0, true) {
            Ok(cookie) => {
                headers.append(SET_COOKIE, cookie);
            }
            Err(err) => error!("failed to build {name} clearing cookie: {err}"),
        }
    }
    headers
}

#[utoipa::path(
    post,
    path = "/v1/auth/send-otp",
    request_body = SendOtpRequest,
    responses(
        (status = 200, description = "Challenge opened", body = SendOtpResponse),
        (status = 400, description = "Invalid identity"),
        (status = 429, description = "Rate limited")
    ),
    tag = "auth"
)]
pub async fn send_otp(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    metrics_sink: Extension<Arc<dyn MetricsSink>>,
    payload: Option<Json<SendOtpRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return ApiError::bad_request("missing payload").into_response();
    };

    let identity = normalize_email(&request.identity);
    if !valid_email(&identity) {
        return ApiError::bad_request("invalid identity").into_response();
    }

    let client_ip = extract_client_ip(&headers).unwrap_or_else(|| "unknown".to_string());
    let limiter = auth_state.rate_limiter();
    if limiter.check(RateLimitAction::OtpSend, &identity) == RateLimitDecision::Limited
        || limiter.check(RateLimitAction::OtpSend, &client_ip) == RateLimitDecision::Limited
    {
        warn!(ip = %client_ip, "otp send rate limited");
        return ApiError::RateLimited.into_response();
    }

    // Signin requires an existing account; signup requires a fresh one.
    let existing = match get_user_by_email(&pool, &identity).await {
        Ok(user) => user,
        Err(err) => {
            error!("user lookup failed: {err:#}");
            return ApiError::ServiceUnavailable.into_response();
        }
    };
    match request.mode {
        AuthMode::Signin if existing.is_none() => {
            return coded_error(StatusCode::NOT_FOUND, "user_not_found");
        }
        AuthMode::Signup if existing.is_some() => {
            return coded_error(StatusCode::CONFLICT, "user_already_exists");
        }
        _ => {}
    }

    let created = match auth_state
        .challenges()
        .create(auth_state.hasher(), &identity)
        .await
    {
        Ok(created) => created,
        Err(err) => {
            error!("failed to open challenge: {err:#}");
            return ApiError::Internal.into_response();
        }
    };

    let message = OtpMessage {
        to_email: identity.clone(),
        to_name: request.name.clone(),
        code: created.code.clone(),
        ttl_minutes: auth_state.config().otp_ttl_minutes(),
    };
    if let Err(err) = auth_state.mailer().send(&message) {
        // Undeliverable challenges are discarded to avoid stranded records.
        auth_state.challenges().discard(&created.challenge_id).await;
        error!("otp delivery failed: {err:#}");
        return coded_error(StatusCode::BAD_GATEWAY, "email_delivery_failed");
    }

    metrics_sink.increment(metrics::OTP_SEND);
    info!(challenge_id = %created.challenge_id, "otp challenge opened");

    Json(SendOtpResponse {
        ok: true,
        challenge_id: created.challenge_id,
        expires_at: created.expires_at,
    })
    .into_response()
}

#[utoipa::path(
    post,
    path = "/v1/auth/verify",
    request_body = VerifyOtpRequest,
    responses(
        (status = 200, description = "Session created", body = SessionEnvelope),
        (status = 401, description = "Code rejected"),
        (status = 429, description = "Rate limited")
    ),
    tag = "auth"
)]
pub async fn verify_otp(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    metrics_sink: Extension<Arc<dyn MetricsSink>>,
    payload: Option<Json<VerifyOtpRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return ApiError::bad_request("missing payload").into_response();
    };

    let identity = normalize_email(&request.identity);
    if !valid_email(&identity) {
        return ApiError::bad_request("invalid identity").into_response();
    }

    if auth_state
        .rate_limiter()
        .check(RateLimitAction::OtpVerify, &identity)
        == RateLimitDecision::Limited
    {
        return ApiError::RateLimited.into_response();
    }

    if let Err(reason) = auth_state
        .challenges()
        .verify(
            auth_state.hasher(),
            &identity,
            request.code.trim(),
            &request.challenge_id,
        )
        .await
    {
        warn!(reason = reason.code(), "otp verification rejected");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "ok": false,
                "error": { "code": "invalid_otp", "reason": reason.code() }
            })),
        )
            .into_response();
    }

    let existing = match get_user_by_email(&pool, &identity).await {
        Ok(user) => user,
        Err(err) => {
            error!("user lookup failed: {err:#}");
            return ApiError::ServiceUnavailable.into_response();
        }
    };
    match request.mode {
        AuthMode::Signin if existing.is_none() => {
            return coded_error(StatusCode::NOT_FOUND, "user_not_found");
        }
        AuthMode::Signup if existing.is_some() => {
            return coded_error(StatusCode::CONFLICT, "user_already_exists");
        }
        _ => {}
    }

    let user = match existing {
        Some(user) => user,
        None => {
            let user = match upsert_user_by_email(&pool, &identity).await {
                Ok(user) => user,
                Err(err) => {
                    error!("user upsert failed: {err:#}");
                    return ApiError::ServiceUnavailable.into_response();
                }
            };
            if let Some(name) = request.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
                if let Err(err) = update_display_name(&pool, user.id, name).await {
                    warn!("display name update failed: {err:#}");
                }
            }
            user
        }
    };

    if let Err(err) = ensure_entitlements(&pool, user.id).await {
        error!("entitlement ensure failed: {err:#}");
        return ApiError::ServiceUnavailable.into_response();
    }

    let tokens = match create_session(
        &pool,
        auth_state.hasher(),
        user.id,
        extract_client_ip(&headers).as_deref(),
        &json!({}),
        auth_state.config().access_ttl_seconds(),
    )
    .await
    {
        Ok(tokens) => tokens,
        Err(err) => {
            error!("session creation failed: {err:#}");
            return ApiError::ServiceUnavailable.into_response();
        }
    };

    metrics_sink.increment(metrics::OTP_VERIFY);
    metrics_sink.increment(metrics::LOGIN);
    info!(user_id = %user.id, "login succeeded");

    let entitlements = get_entitlements(&pool, user.id).await.unwrap_or_default();
    let cookies = apply_session_cookies(auth_state.config(), &tokens);
    let body = SessionEnvelope {
        ok: true,
        user: UserProfile {
            id: user.id.to_string(),
            email: user.email,
            role: user.role,
            display_name: user.display_name,
        },
        entitlements,
    };
    (StatusCode::OK, cookies, Json(body)).into_response()
}

#[utoipa::path(
    post,
    path = "/v1/auth/refresh",
    responses(
        (status = 200, description = "Tokens rotated"),
        (status = 401, description = "Unknown or revoked refresh token"),
        (status = 503, description = "Store unreachable")
    ),
    tag = "auth"
)]
pub async fn refresh(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    metrics_sink: Extension<Arc<dyn MetricsSink>>,
) -> Response {
    let Some(raw_refresh) = extract_cookie(&headers, REFRESH_COOKIE) else {
        return ApiError::Unauthenticated.into_response();
    };
    let refresh_hash = auth_state.hasher().hash(&raw_refresh);

    let session = match lookup_session_by_refresh(&pool, &refresh_hash).await {
        Ok(Some(session)) => session,
        Ok(None) => return ApiError::Unauthenticated.into_response(),
        Err(err) => {
            error!("refresh lookup failed: {err:#}");
            return ApiError::ServiceUnavailable.into_response();
        }
    };

    // All three tokens rotate in one UPDATE; the old pair dies on commit.
    let tokens = match rotate_session(
        &pool,
        auth_state.hasher(),
        session.id,
        auth_state.config().access_ttl_seconds(),
    )
    .await
    {
        Ok(tokens) => tokens,
        Err(err) => {
            error!("token rotation failed: {err:#}");
            return ApiError::ServiceUnavailable.into_response();
        }
    };

    metrics_sink.increment(metrics::SESSION_REFRESH);
    info!(user_id = %session.user_id, "session rotated");

    let cookies = apply_session_cookies(auth_state.config(), &tokens);
    (StatusCode::OK, cookies, Json(json!({ "ok": true }))).into_response()
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout",
    responses(
        (status = 200, description = "Session revoked and cookies cleared")
    ),
    tag = "auth"
)]
pub async fn logout(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    metrics_sink: Extension<Arc<dyn MetricsSink>>,
) -> Response {
    if let Some(token) = extract_cookie(&headers, ACCESS_COOKIE) {
        let token_hash = auth_state.hasher().hash(&token);
        if let Err(err) = revoke_session(&pool, &token_hash).await {
            error!("session revocation failed: {err:#}");
        } else {
            metrics_sink.increment(metrics::LOGOUT);
        }
    }

    // Always clear cookies, even when no session record was found.
    let cookies = clear_session_cookies(auth_state.config());
    (StatusCode::OK, cookies, Json(json!({ "ok": true }))).into_response()
}

#[utoipa::path(
    get,
    path = "/v1/auth/session",
    responses(
        (status = 200, description = "Session is active", body = SessionEnvelope),
        (status = 401, description = "No active session"),
        (status = 503, description = "Store unreachable")
    ),
    tag = "auth"
)]
pub async fn session(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
) -> Response {
    let ctx = match authenticate(&headers, &pool, &auth_state).await {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(),
    };

    let user = match get_user_by_id(&pool, ctx.user_id).await {
        Ok(Some(user)) => user,
        Ok(None) => return ApiError::Unauthenticated.into_response(),
        Err(err) => {
            error!("user lookup failed: {err:#}");
            return ApiError::ServiceUnavailable.into_response();
        }
    };
    let entitlements = get_entitlements(&pool, ctx.user_id).await.unwrap_or_default();

    Json(SessionEnvelope {
        ok: true,
        user: UserProfile {
            id: user.id.to_string(),
            email: user.email,
            role: user.role,
            display_name: user.display_name,
        },
        entitlements,
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::email::LogOtpMailer;
    use crate::api::handlers::auth::rate_limit::NoopRateLimiter;
    use crate::api::metrics::NoopMetricsSink;
    use secrecy::SecretString;
    use sqlx::postgres::PgPoolOptions;

    fn auth_state(frontend: &str) -> Arc<AuthState> {
        Arc::new(AuthState::new(
            AuthConfig::new(frontend.to_string()),
            SecretString::from("0123456789abcdef0123456789abcdef".to_string()),
            Arc::new(NoopRateLimiter),
            Arc::new(LogOtpMailer),
        ))
    }

    fn metrics_sink() -> Arc<dyn MetricsSink> {
        Arc::new(NoopMetricsSink)
    }

    #[test]
    fn normalize_email_trims_and_lowercases() {
        assert_eq!(normalize_email(" Alice@Example.COM "), "alice@example.com");
    }

    #[test]
    fn valid_email_rejects_missing_parts() {
        assert!(valid_email("a@example.com"));
        assert!(!valid_email("not-an-email"));
        assert!(!valid_email("missing-domain@"));
    }

    #[test]
    fn access_cookie_is_http_only_and_csrf_is_not() {
        let config = AuthConfig::new("https://app.forgegate.dev".to_string());
        let tokens = SessionTokens {
            access: "acc".to_string(),
            refresh: "ref".to_string(),
            csrf: "csrf".to_string(),
        };
        let headers = apply_session_cookies(&config, &tokens);
        let cookies: Vec<&str> = headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect();
        assert_eq!(cookies.len(), 3);
        let access = cookies
            .iter()
            .find(|c| c.starts_with(ACCESS_COOKIE))
            .expect("access cookie");
        assert!(access.contains("HttpOnly"));
        assert!(access.contains("Secure"));
        let csrf = cookies
            .iter()
            .find(|c| c.starts_with(CSRF_COOKIE))
            .expect("csrf cookie");
        assert!(!csrf.contains("HttpOnly"));
    }

    #[test]
    fn insecure_frontend_omits_secure_attribute() {
        let config = AuthConfig::new("http://localhost:3000".to_string());
        let cookie = auth_cookie(&config, ACCESS_COOKIE, "v", 60, true).expect("cookie");
        assert!(!cookie.to_str().unwrap().contains("Secure"));
    }

    #[test]
    fn cookie_domain_is_appended_when_configured() {
        let config = AuthConfig::new("https://app.forgegate.dev".to_string())
            .with_cookie_domain(Some("forgegate.dev".to_string()));
        let cookie = auth_cookie(&config, ACCESS_COOKIE, "v", 60, true).expect("cookie");
        assert!(cookie.to_str().unwrap().contains("Domain=forgegate.dev"));
    }

    #[test]
    fn clearing_cookies_zeroes_max_age() {
        let config = AuthConfig::new("http://localhost:3000".to_string());
        let headers = clear_session_cookies(&config);
        for value in headers.get_all(SET_COOKIE) {
            assert!(value.to_str().unwrap().contains("Max-Age=0"));
        }
    }

    #[tokio::test]
    async fn send_otp_missing_payload_is_bad_request() {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://postgres@localhost/postgres")
            .expect("lazy pool");
        let response = send_otp(
            HeaderMap::new(),
            Extension(pool),
            Extension(auth_state("http://localhost:3000")),
            Extension(metrics_sink()),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn send_otp_invalid_identity_is_bad_request() {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://postgres@localhost/postgres")
            .expect("lazy pool");
        let response = send_otp(
            HeaderMap::new(),
            Extension(pool),
            Extension(auth_state("http://localhost:3000")),
            Extension(metrics_sink()),
            Some(Json(SendOtpRequest {
                identity: "not-an-email".to_string(),
                name: None,
                mode: AuthMode::Auto,
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn verify_otp_unknown_challenge_is_unauthorized() {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://postgres@localhost/postgres")
            .expect("lazy pool");
        let response = verify_otp(
            HeaderMap::new(),
            Extension(pool),
            Extension(auth_state("http://localhost:3000")),
            Extension(metrics_sink()),
            Some(Json(VerifyOtpRequest {
                identity: "a@example.com".to_string(),
                code: "123456".to_string(),
                challenge_id: "missing".to_string(),
                mode: AuthMode::Auto,
                name: None,
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn refresh_without_cookie_is_unauthorized() {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://postgres@localhost/postgres")
            .expect("lazy pool");
        let response = refresh(
            HeaderMap::new(),
            Extension(pool),
            Extension(auth_state("http://localhost:3000")),
            Extension(metrics_sink()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn logout_without_cookie_still_clears() {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://postgres@localhost/postgres")
            .expect("lazy pool");
        let response = logout(
            HeaderMap::new(),
            Extension(pool),
            Extension(auth_state("http://localhost:3000")),
            Extension(metrics_sink()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let cookie_count = response.headers().get_all(SET_COOKIE).iter().count();
        assert_eq!(cookie_count, 3);
    }
}
