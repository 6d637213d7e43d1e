//! Rate limiting primitives.
//!
//! Limits are fixed 15-minute windows keyed by action plus identity or IP.
//! The trait is the seam to an external counter store; the default
//! implementation keeps windows in process memory.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(15 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RateLimitAction {
    OtpSend,
    OtpVerify,
    KeysMint,
    KeysRevoke,
    KeysRedeem,
    AdminLookup,
    StreamOpen,
    BridgeOpen,
    PipelineStart,
}

impl RateLimitAction {
    #[must_use]
    pub const fn key_prefix(self) -> &'static str {
        match self {
            Self::OtpSend => "otp:send",
            Self::OtpVerify => "otp:verify",
            Self::KeysMint => "keys:mint",
            Self::KeysRevoke => "keys:revoke",
            Self::KeysRedeem => "keys:redeem",
            Self::AdminLookup => "admin:lookup",
            Self::StreamOpen => "stream:open",
            Self::BridgeOpen => "bridge:open",
            Self::PipelineStart => "pipeline:start",
        }
    }

    /// Allowed requests per window.
    #[must_use]
    pub const fn limit(self) -> u32 {
        match self {
            Self::OtpSend => 6,
            Self::OtpVerify => 12,
            Self::KeysMint | Self::KeysRevoke => 30,
            Self::KeysRedeem => 10,
            Self::AdminLookup => 60,
            Self::StreamOpen => 120,
            Self::BridgeOpen => 60,
            Self::PipelineStart => 20,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

pub trait RateLimiter: Send + Sync {
    fn check(&self, action: RateLimitAction, key: &str) -> RateLimitDecision;
}

#[derive(Clone, Debug)]
pub struct NoopRateLimiter;

impl RateLimiter for NoopRateLimiter {
    fn check(&self, _action: RateLimitAction, _key: &str) -> RateLimitDecision {
        RateLimitDecision::Allowed
    }
}

/// In-memory fixed-window counters; stale windows are dropped on access.
#[derive(Debug, Default)]
pub struct FixedWindowLimiter {
    windows: Mutex<HashMap<String, (Instant, u32)>>,
}

impl FixedWindowLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RateLimiter for FixedWindowLimiter {
    fn check(&self, action: RateLimitAction, key: &str) -> RateLimitDecision {
        let Ok(mut windows) = self.windows.lock() else {
            return RateLimitDecision::Allowed;
        };
        windows.retain(|_, (started, _)| started.elapsed() < RATE_LIMIT_WINDOW);

        let entry = windows
            .entry(format!("{}:{key}", action.key_prefix()))
            .or_insert((Instant::now(), 0));
        entry.1 += 1;
        if entry.1 > action.limit() {
            RateLimitDecision::Limited
        } else {
            RateLimitDecision::Allowed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_rate_limiter_allows() {
        let limiter = NoopRateLimiter;
        assert_eq!(
            limiter.check(RateLimitAction::OtpSend, "user@example.com"),
            RateLimitDecision::Allowed
        );
    }

    #[test]
    fn fixed_window_limits_after_threshold() {
        let limiter = FixedWindowLimiter::new();
        let limit = RateLimitAction::OtpSend.limit();
        for _ in 0..limit {
            assert_eq!(
                limiter.check(RateLimitAction::OtpSend, "a@example.com"),
                RateLimitDecision::Allowed
            );
        }
        assert_eq!(
            limiter.check(RateLimitAction::OtpSend, "a@example.com"),
            RateLimitDecision::Limited
        );
        // Other keys and actions have their own windows.
        assert_eq!(
            limiter.check(RateLimitAction::OtpSend, "b@example.com"),
            RateLimitDecision::Allowed
        );
        assert_eq!(
            limiter.check(RateLimitAction::OtpVerify, "a@example.com"),
            RateLimitDecision::Allowed
        );
    }
}
