//! One-time code challenges.
//!
//! Challenges are ephemeral, TTL-backed records kept in process memory.
//! A challenge binds a hashed code to an identity, allows a bounded number
//! of attempts, and is single-use: after a successful verification the
//! record flips to `used` and lingers for a short grace window so replays
//! fail instead of silently recreating state.

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::token::{CSRF_TOKEN_BYTES, TokenHasher, generate_token};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtpVerifyError {
    /// Record absent or past its TTL.
    Expired,
    /// Attempt budget exhausted; correct codes no longer help.
    Locked,
    /// The challenge is bound to a different identity.
    IdentityMismatch,
    /// Wrong code; the attempt was counted.
    CodeMismatch,
    /// The challenge was already consumed.
    Replayed,
}

impl OtpVerifyError {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Expired => "expired_challenge",
            Self::Locked => "locked",
            Self::IdentityMismatch => "identity_mismatch",
            Self::CodeMismatch => "code_mismatch",
            Self::Replayed => "replayed",
        }
    }
}

#[derive(Debug)]
struct ChallengeRecord {
    identity: String,
    code_hash: Vec<u8>,
    attempts: u32,
    used: bool,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct CreatedChallenge {
    pub challenge_id: String,
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

pub struct ChallengeManager {
    ttl: Duration,
    grace: Duration,
    max_attempts: u32,
    challenges: Mutex<HashMap<String, ChallengeRecord>>,
}

impl ChallengeManager {
    #[must_use]
    pub fn new(ttl: Duration, grace: Duration, max_attempts: u32) -> Self {
        Self {
            ttl,
            grace,
            max_attempts,
            challenges: Mutex::new(HashMap::new()),
        }
    }

    /// Open a challenge for `identity` and return the raw code for delivery.
    ///
    /// # Errors
    /// Returns an error if challenge-id generation fails.
    pub async fn create(
        &self,
        hasher: &TokenHasher,
        identity: &str,
    ) -> Result<CreatedChallenge> {
        let challenge_id = generate_token(CSRF_TOKEN_BYTES)?;
        let code = six_digit_code();
        let code_hash = hasher.hash(&bind_code(identity, &code));

        let mut challenges = self.challenges.lock().await;
        // Expired records are purged here rather than on a timer.
        challenges.retain(|_, record| record.expires_at > Instant::now());
        challenges.insert(
            challenge_id.clone(),
            ChallengeRecord {
                identity: identity.to_string(),
                code_hash,
                attempts: 0,
                used: false,
                expires_at: Instant::now() + self.ttl,
            },
        );

        let ttl_seconds = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        Ok(CreatedChallenge {
            challenge_id,
            code,
            expires_at: Utc::now() + ChronoDuration::seconds(ttl_seconds),
        })
    }

    /// Check a code against a challenge.
    ///
    /// Success consumes the challenge: the record flips to `used` and its
    /// remaining lifetime shrinks to the grace window.
    ///
    /// # Errors
    /// Returns the failure reason; `CodeMismatch` also burns an attempt.
    pub async fn verify(
        &self,
        hasher: &TokenHasher,
        identity: &str,
        code: &str,
        challenge_id: &str,
    ) -> Result<(), OtpVerifyError> {
        let mut challenges = self.challenges.lock().await;
        let Some(record) = challenges.get_mut(challenge_id) else {
            return Err(OtpVerifyError::Expired);
        };
        if record.expires_at <= Instant::now() {
            challenges.remove(challenge_id);
            return Err(OtpVerifyError::Expired);
        }
        if record.used {
            return Err(OtpVerifyError::Replayed);
        }
        if record.attempts >= self.max_attempts {
            return Err(OtpVerifyError::Locked);
        }
        if record.identity != identity {
            return Err(OtpVerifyError::IdentityMismatch);
        }
        if record.code_hash != hasher.hash(&bind_code(identity, code)) {
            record.attempts += 1;
            return Err(OtpVerifyError::CodeMismatch);
        }

        record.used = true;
        record.expires_at = Instant::now() + self.grace;
        Ok(())
    }

    /// Drop a challenge whose code could not be delivered.
    pub async fn discard(&self, challenge_id: &str) {
        self.challenges.lock().await.remove(challenge_id);
    }
}

fn six_digit_code() -> String {
    rand::thread_rng().gen_range(100_000..1_000_000).to_string()
}

/// Bind the code to its identity so challenges cannot be swapped between
/// identities.
fn bind_code(identity: &str, code: &str) -> String {
    format!("{identity}|{code}")
}
