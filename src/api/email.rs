//! One-time code delivery abstraction.
//!
//! The challenge manager generates the code; delivery is an external
//! collaborator behind `OtpMailer`. The default sender logs the recipient
//! and expiry but never the code itself; a real deployment plugs in an
//! SMTP/API-backed implementation.

use anyhow::Result;
use tracing::info;

#[derive(Clone, Debug)]
pub struct OtpMessage {
    pub to_email: String,
    pub to_name: Option<String>,
    pub code: String,
    pub ttl_minutes: u64,
}

/// Delivery abstraction for one-time codes.
pub trait OtpMailer: Send + Sync {
    /// Deliver a code or return an error so the challenge can be discarded.
    fn send(&self, message: &OtpMessage) -> Result<()>;
}

/// Local dev sender that logs delivery instead of sending real email.
#[derive(Clone, Debug)]
pub struct LogOtpMailer;

impl OtpMailer for LogOtpMailer {
    fn send(&self, message: &OtpMessage) -> Result<()> {
        info!(
            to_email = %message.to_email,
            ttl_minutes = message.ttl_minutes,
            "otp delivery stub"
        );
        Ok(())
    }
}
