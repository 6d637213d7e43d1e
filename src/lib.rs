//! # Forgegate (Session & Entitlement Gateway)
//!
//! `forgegate` fronts an AI contract-generation pipeline. It owns three
//! concerns the upstream services do not:
//!
//! ## Sessions
//!
//! Login is passwordless: an email one-time code opens a challenge, and a
//! successful verification mints an access/refresh/CSRF token triple. Only
//! keyed hashes of the access and refresh tokens are stored; rotating the
//! server secret invalidates every outstanding session.
//!
//! - **Rotation:** `POST /v1/auth/refresh` rotates all three tokens in a
//!   single UPDATE; the old access token is dead the instant it commits.
//!   Concurrent refreshes with the same stale token may both succeed
//!   (last write wins); this is accepted rather than serialized.
//! - **CSRF:** state-changing requests must echo the readable `forgegate_csrf`
//!   cookie in the `X-CSRF-Token` header (double-submit).
//!
//! ## Entitlements
//!
//! Premium access is funded by redeemable keys. A key moves `minted ->
//! redeemed` exactly once, under a row lock, and exactly one user is credited
//! with the role upgrade and `pro_enabled` flag. Roles rank
//! `normal < pro < admin`; admins are never downgraded by redemption.
//!
//! ## Job event gateway
//!
//! Long-running generation jobs stream logs over SSE and interactive builder
//! sessions over WebSocket. The gateway re-frames the upstream SSE stream,
//! enriches recognized log lines with flavor events, survives upstream
//! disconnects with bounded reconnects, and fires post-deployment
//! verification exactly once per stream when the terminal `end` frame is
//! seen. The WebSocket bridge queues client frames until the upstream socket
//! opens, bounded by message count and byte size; overflow closes both sides.

pub mod api;
pub mod cli;
pub mod gateway;

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
