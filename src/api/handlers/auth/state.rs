//! Auth state and configuration.

use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;

use crate::api::email::OtpMailer;

use super::otp::ChallengeManager;
use super::rate_limit::RateLimiter;
use super::token::TokenHasher;

const DEFAULT_ACCESS_TTL_SECONDS: i64 = 90 * 60;
const DEFAULT_REFRESH_TTL_SECONDS: i64 = 30 * 24 * 60 * 60;
const DEFAULT_OTP_TTL_SECONDS: u64 = 10 * 60;
const DEFAULT_OTP_GRACE_SECONDS: u64 = 60;
const DEFAULT_OTP_MAX_ATTEMPTS: u32 = 5;

#[derive(Clone, Debug)]
pub struct AuthConfig {
    frontend_base_url: String,
    cookie_domain: Option<String>,
    access_ttl_seconds: i64,
    refresh_ttl_seconds: i64,
    otp_ttl_seconds: u64,
    otp_grace_seconds: u64,
    otp_max_attempts: u32,
}

impl AuthConfig {
    #[must_use]
    pub fn new(frontend_base_url: String) -> Self {
        Self {
            frontend_base_url,
            cookie_domain: None,
            access_ttl_seconds: DEFAULT_ACCESS_TTL_SECONDS,
            refresh_ttl_seconds: DEFAULT_REFRESH_TTL_SECONDS,
            otp_ttl_seconds: DEFAULT_OTP_TTL_SECONDS,
            otp_grace_seconds: DEFAULT_OTP_GRACE_SECONDS,
            otp_max_attempts: DEFAULT_OTP_MAX_ATTEMPTS,
        }
    }

    #[must_use]
    pub fn with_cookie_domain(mut self, domain: Option<String>) -> Self {
        self.cookie_domain = domain;
        self
    }

    #[must_use]
    pub fn with_access_ttl_seconds(mut self, seconds: i64) -> Self {
        self.access_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_refresh_ttl_seconds(mut self, seconds: i64) -> Self {
        self.refresh_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_otp_ttl_seconds(mut self, seconds: u64) -> Self {
        self.otp_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_otp_grace_seconds(mut self, seconds: u64) -> Self {
        self.otp_grace_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_otp_max_attempts(mut self, attempts: u32) -> Self {
        self.otp_max_attempts = attempts;
        self
    }

    pub(crate) fn frontend_base_url(&self) -> &str {
        &self.frontend_base_url
    }

    pub(crate) fn cookie_domain(&self) -> Option<&str> {
        self.cookie_domain.as_deref()
    }

    pub(crate) fn access_ttl_seconds(&self) -> i64 {
        self.access_ttl_seconds
    }

    pub(crate) fn refresh_ttl_seconds(&self) -> i64 {
        self.refresh_ttl_seconds
    }

    pub(crate) fn otp_ttl(&self) -> Duration {
        Duration::from_secs(self.otp_ttl_seconds)
    }

    pub(crate) fn otp_ttl_minutes(&self) -> u64 {
        self.otp_ttl_seconds / 60
    }

    pub(crate) fn otp_grace(&self) -> Duration {
        Duration::from_secs(self.otp_grace_seconds)
    }

    pub(crate) fn otp_max_attempts(&self) -> u32 {
        self.otp_max_attempts
    }

    /// Cookies are only marked Secure when the frontend is served over HTTPS.
    pub(crate) fn session_cookie_secure(&self) -> bool {
        self.frontend_base_url.starts_with("https://")
    }
}

pub struct AuthState {
    config: AuthConfig,
    hasher: TokenHasher,
    challenges: ChallengeManager,
    rate_limiter: Arc<dyn RateLimiter>,
    mailer: Arc<dyn OtpMailer>,
}

impl AuthState {
    #[must_use]
    pub fn new(
        config: AuthConfig,
        secret: SecretString,
        rate_limiter: Arc<dyn RateLimiter>,
        mailer: Arc<dyn OtpMailer>,
    ) -> Self {
        let challenges = ChallengeManager::new(
            config.otp_ttl(),
            config.otp_grace(),
            config.otp_max_attempts(),
        );
        Self {
            config,
            hasher: TokenHasher::new(secret),
            challenges,
            rate_limiter,
            mailer,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    #[must_use]
    pub fn hasher(&self) -> &TokenHasher {
        &self.hasher
    }

    pub(crate) fn challenges(&self) -> &ChallengeManager {
        &self.challenges
    }

    pub(crate) fn rate_limiter(&self) -> &dyn RateLimiter {
        self.rate_limiter.as_ref()
    }

    pub(crate) fn mailer(&self) -> &dyn OtpMailer {
        self.mailer.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::email::LogOtpMailer;
    use crate::api::handlers::auth::rate_limit::NoopRateLimiter;

    #[test]
    fn auth_config_defaults_and_overrides() {
        let config = AuthConfig::new("https://app.forgegate.dev".to_string());
        assert_eq!(config.access_ttl_seconds(), super::DEFAULT_ACCESS_TTL_SECONDS);
        assert_eq!(
            config.refresh_ttl_seconds(),
            super::DEFAULT_REFRESH_TTL_SECONDS
        );
        assert_eq!(config.otp_ttl_minutes(), 10);
        assert_eq!(config.otp_max_attempts(), 5);
        assert!(config.session_cookie_secure());
        assert!(config.cookie_domain().is_none());

        let config = config
            .with_access_ttl_seconds(60)
            .with_refresh_ttl_seconds(120)
            .with_otp_ttl_seconds(300)
            .with_otp_grace_seconds(5)
            .with_otp_max_attempts(3)
            .with_cookie_domain(Some("forgegate.dev".to_string()));
        assert_eq!(config.access_ttl_seconds(), 60);
        assert_eq!(config.refresh_ttl_seconds(), 120);
        assert_eq!(config.otp_ttl_minutes(), 5);
        assert_eq!(config.otp_max_attempts(), 3);
        assert_eq!(config.cookie_domain(), Some("forgegate.dev"));
    }

    #[test]
    fn insecure_frontend_disables_secure_cookies() {
        let config = AuthConfig::new("http://localhost:3000".to_string());
        assert!(!config.session_cookie_secure());
    }

    #[test]
    fn auth_state_constructs_with_noop_collaborators() {
        let config = AuthConfig::new("http://localhost:3000".to_string());
        let state = AuthState::new(
            config,
            secrecy::SecretString::from("0123456789abcdef0123456789abcdef".to_string()),
            Arc::new(NoopRateLimiter),
            Arc::new(LogOtpMailer),
        );
        assert_eq!(state.config().otp_max_attempts(), 5);
    }
}
