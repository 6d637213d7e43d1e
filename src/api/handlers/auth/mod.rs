//! Auth handlers and supporting modules.
//!
//! This module coordinates passwordless login (one-time codes), session
//! lifecycle, and the role/entitlement gate.
//!
//! ## Token handling
//!
//! Access, refresh, and CSRF tokens are independent random values. The
//! database stores keyed HMAC digests of the access and refresh tokens; the
//! CSRF token is never persisted, it travels as a readable cookie and must be
//! echoed in the `X-CSRF-Token` header on state-changing requests.
//!
//! > **Warning:** Rotating the session secret invalidates every outstanding
//! > session; there is no migration path by design.

pub mod guard;
pub(crate) mod otp;
pub mod rate_limit;
pub(crate) mod session;
mod state;
pub(crate) mod storage;
pub(crate) mod token;
pub(crate) mod types;

pub use self::guard::{AuthContext, EntitlementFlag, Role};
pub use self::rate_limit::{FixedWindowLimiter, NoopRateLimiter};
pub use self::state::{AuthConfig, AuthState};
pub use self::token::TokenHasher;
