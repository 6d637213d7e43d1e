//! Request authorization: identity, role rank, and entitlement flags.
//!
//! The authenticated identity is an explicit [`AuthContext`] value returned
//! by [`authenticate`] and passed onward; nothing is stashed on the request.

use axum::http::{HeaderMap, header::AUTHORIZATION, header::COOKIE};
use sqlx::PgPool;
use std::fmt;
use uuid::Uuid;

use crate::api::error::{ApiError, store_error};

use super::state::AuthState;
use super::storage::{
    UserRecord, get_entitlements, get_user_by_id, lookup_session_by_access,
};
use super::types::EntitlementFlags;

pub const ACCESS_COOKIE: &str = "forgegate_access";
pub const REFRESH_COOKIE: &str = "forgegate_refresh";
pub const CSRF_COOKIE: &str = "forgegate_csrf";
pub const CSRF_HEADER: &str = "x-csrf-token";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    Normal,
    Pro,
    Admin,
}

impl Role {
    /// Unknown role strings rank lowest rather than failing the request.
    #[must_use]
    pub fn parse(role: &str) -> Self {
        match role {
            "admin" => Self::Admin,
            "pro" => Self::Pro,
            _ => Self::Normal,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Pro => "pro",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug)]
pub enum EntitlementFlag {
    ProEnabled,
    WalletDeployments,
    HistoryExport,
    ChatAgents,
    HostedFrontend,
}

impl EntitlementFlag {
    #[must_use]
    pub const fn is_set(self, flags: &EntitlementFlags) -> bool {
        match self {
            Self::ProEnabled => flags.pro_enabled,
            Self::WalletDeployments => flags.wallet_deployments,
            Self::HistoryExport => flags.history_export,
            Self::ChatAgents => flags.chat_agents,
            Self::HostedFrontend => flags.hosted_frontend,
        }
    }
}

/// Identity established for one request.
#[derive(Clone, Copy, Debug)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub session_id: Uuid,
}

/// Pull a named cookie out of the Cookie header.
#[must_use]
pub fn extract_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let header = headers.get(COOKIE)?;
    let value = header.to_str().ok()?;
    for pair in value.split(';') {
        let trimmed = pair.trim();
        let mut parts = trimmed.splitn(2, '=');
        let key = parts.next()?.trim();
        let val = parts.next()?.trim();
        if key == name {
            return Some(val.to_string());
        }
    }
    None
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Resolve the access cookie (or bearer token) into an [`AuthContext`].
///
/// A missing or dead session is `Unauthenticated`; a store failure is
/// `ServiceUnavailable` so the client retries instead of re-logging-in.
pub async fn authenticate(
    headers: &HeaderMap,
    pool: &PgPool,
    auth_state: &AuthState,
) -> Result<AuthContext, ApiError> {
    let token = extract_cookie(headers, ACCESS_COOKIE)
        .or_else(|| extract_bearer_token(headers))
        .ok_or(ApiError::Unauthenticated)?;
    let token_hash = auth_state.hasher().hash(&token);
    match lookup_session_by_access(pool, &token_hash).await {
        Ok(Some(session)) => Ok(AuthContext {
            user_id: session.user_id,
            session_id: session.id,
        }),
        Ok(None) => Err(ApiError::Unauthenticated),
        Err(err) => Err(store_error(&err)),
    }
}

/// Double-submit check: the CSRF header must echo the CSRF cookie exactly.
pub fn require_csrf(headers: &HeaderMap) -> Result<(), ApiError> {
    let header = headers
        .get(CSRF_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let cookie = extract_cookie(headers, CSRF_COOKIE).unwrap_or_default();
    if header.is_empty() || header != cookie {
        return Err(ApiError::Forbidden);
    }
    Ok(())
}

/// Load the user and require at least `min` role rank.
pub async fn require_role(
    pool: &PgPool,
    ctx: &AuthContext,
    min: Role,
) -> Result<UserRecord, ApiError> {
    let user = match get_user_by_id(pool, ctx.user_id).await {
        Ok(Some(user)) => user,
        Ok(None) => return Err(ApiError::Unauthenticated),
        Err(err) => return Err(store_error(&err)),
    };
    if Role::parse(&user.role) < min {
        return Err(ApiError::Forbidden);
    }
    Ok(user)
}

/// The `wallet_deployments` flag is also satisfied by `pro_enabled` or a
/// pro/admin role. Two authorization sources, both preserved on purpose for
/// backward compatibility.
#[must_use]
pub const fn wallet_deployments_allowed(flag: bool, pro_enabled: bool, role: Role) -> bool {
    flag || pro_enabled || matches!(role, Role::Pro | Role::Admin)
}

/// Require an entitlement flag for the authenticated user.
pub async fn require_entitlement(
    pool: &PgPool,
    ctx: &AuthContext,
    flag: EntitlementFlag,
) -> Result<EntitlementFlags, ApiError> {
    let flags = match get_entitlements(pool, ctx.user_id).await {
        Ok(flags) => flags,
        Err(err) => return Err(store_error(&err)),
    };
    if flag.is_set(&flags) {
        return Ok(flags);
    }
    if matches!(flag, EntitlementFlag::WalletDeployments) {
        let role = match get_user_by_id(pool, ctx.user_id).await {
            Ok(Some(user)) => Role::parse(&user.role),
            Ok(None) => Role::Normal,
            Err(err) => return Err(store_error(&err)),
        };
        if wallet_deployments_allowed(flags.wallet_deployments, flags.pro_enabled, role) {
            return Ok(flags);
        }
    }
    Err(ApiError::Forbidden)
}

/// Extract a client IP for rate limiting from common proxy headers.
#[must_use]
pub fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if forwarded.is_some() {
        return forwarded.map(str::to_string);
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn role_ordering_is_ordinal() {
        assert!(Role::Normal < Role::Pro);
        assert!(Role::Pro < Role::Admin);
        assert_eq!(Role::parse("admin"), Role::Admin);
        assert_eq!(Role::parse("pro"), Role::Pro);
        assert_eq!(Role::parse("normal"), Role::Normal);
        assert_eq!(Role::parse("unknown"), Role::Normal);
    }

    #[test]
    fn role_round_trips_as_str() {
        for role in [Role::Normal, Role::Pro, Role::Admin] {
            assert_eq!(Role::parse(role.as_str()), role);
        }
    }

    #[test]
    fn wallet_deployments_parity_table() {
        // flag, pro_enabled, role -> allowed
        let cases = [
            (false, false, Role::Normal, false),
            (true, false, Role::Normal, true),
            (false, true, Role::Normal, true),
            (false, false, Role::Pro, true),
            (false, false, Role::Admin, true),
            (true, true, Role::Admin, true),
        ];
        for (flag, pro, role, expected) in cases {
            assert_eq!(
                wallet_deployments_allowed(flag, pro, role),
                expected,
                "flag={flag} pro={pro} role={role}"
            );
        }
    }

    #[test]
    fn extract_cookie_finds_named_value() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("other=1; forgegate_access=token-value; x=2"),
        );
        assert_eq!(
            extract_cookie(&headers, ACCESS_COOKIE),
            Some("token-value".to_string())
        );
        assert_eq!(extract_cookie(&headers, "missing"), None);
    }

    #[test]
    fn extract_bearer_token_requires_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(extract_bearer_token(&headers), Some("abc".to_string()));

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Token abc"));
        assert_eq!(extract_bearer_token(&headers), None);
    }

    #[test]
    fn require_csrf_accepts_matching_pair() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("forgegate_csrf=c1"));
        headers.insert(CSRF_HEADER, HeaderValue::from_static("c1"));
        assert!(require_csrf(&headers).is_ok());
    }

    #[test]
    fn require_csrf_rejects_mismatch_or_missing() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("forgegate_csrf=c1"));
        headers.insert(CSRF_HEADER, HeaderValue::from_static("c2"));
        assert_eq!(require_csrf(&headers), Err(ApiError::Forbidden));

        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("forgegate_csrf=c1"));
        assert_eq!(require_csrf(&headers), Err(ApiError::Forbidden));

        let headers = HeaderMap::new();
        assert_eq!(require_csrf(&headers), Err(ApiError::Forbidden));
    }

    #[test]
    fn extract_client_ip_prefers_forwarded() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("1.2.3.4, 5.6.7.8"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(extract_client_ip(&headers), Some("1.2.3.4".to_string()));
    }

    #[test]
    fn extract_client_ip_falls_back_to_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(extract_client_ip(&headers), Some("9.9.9.9".to_string()));
    }
}
