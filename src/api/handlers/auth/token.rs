//! Token generation and keyed hashing.
//!
//! Raw tokens are only ever returned to the client; the database stores a
//! keyed HMAC digest so equality checks never touch the raw value. The HMAC
//! key is process-wide configuration; rotating it invalidates every
//! outstanding session.

use anyhow::{Context, Result};
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::{RngCore, rngs::OsRng};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

/// Default token size. 32 bytes is well above the 128-bit entropy floor.
pub const TOKEN_BYTES: usize = 32;

/// CSRF tokens are compared, never stored, so they can be shorter.
pub const CSRF_TOKEN_BYTES: usize = 16;

/// Create a URL-safe random token with `n` bytes of entropy.
///
/// # Errors
/// Returns an error if the OS entropy source fails.
pub fn generate_token(n: usize) -> Result<String> {
    let mut bytes = vec![0u8; n];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate token")?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

/// Keyed, deterministic token digest. Not reversible.
pub struct TokenHasher {
    secret: SecretString,
}

impl TokenHasher {
    #[must_use]
    pub fn new(secret: SecretString) -> Self {
        Self { secret }
    }

    /// HMAC-SHA256 of the raw token under the server secret.
    #[must_use]
    pub fn hash(&self, raw: &str) -> Vec<u8> {
        // HMAC accepts keys of any length.
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(
            self.secret.expose_secret().as_bytes(),
        )
        .expect("hmac accepts any key length");
        mac.update(raw.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }
}

/// Unkeyed digest kept alongside minted keys for audit purposes; lookups
/// always go through the keyed hash.
#[must_use]
pub fn sha256_digest(raw: &str) -> Vec<u8> {
    use sha2::Digest;
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    fn hasher() -> TokenHasher {
        TokenHasher::new(SecretString::from(
            "0123456789abcdef0123456789abcdef".to_string(),
        ))
    }

    #[test]
    fn generate_token_has_requested_entropy() {
        let decoded_len = generate_token(TOKEN_BYTES)
            .ok()
            .and_then(|token| URL_SAFE_NO_PAD.decode(token.as_bytes()).ok())
            .map(|bytes| bytes.len());
        assert_eq!(decoded_len, Some(TOKEN_BYTES));
    }

    #[test]
    fn generate_token_is_url_safe() {
        let token = generate_token(TOKEN_BYTES).expect("token");
        assert!(
            token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
    }

    #[test]
    fn hash_is_deterministic() {
        let hasher = hasher();
        assert_eq!(hasher.hash("token"), hasher.hash("token"));
        assert_ne!(hasher.hash("token"), hasher.hash("other"));
    }

    #[test]
    fn hash_depends_on_key() {
        let first = hasher();
        let second = TokenHasher::new(SecretString::from(
            "fedcba9876543210fedcba9876543210".to_string(),
        ));
        assert_ne!(first.hash("token"), second.hash("token"));
    }

    #[test]
    fn sha256_digest_is_stable() {
        assert_eq!(sha256_digest("key"), sha256_digest("key"));
        assert_eq!(sha256_digest("key").len(), 32);
    }
}
