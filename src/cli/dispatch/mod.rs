//! Command-line argument dispatch and server initialization.
//!
//! This module maps validated CLI arguments to the appropriate action, such
//! as starting the API server with its full configuration state.

use crate::cli::actions::{Action, server::Args};
use anyhow::{Context, Result};

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>("dsn")
        .cloned()
        .context("missing required argument: --dsn")?;
    let session_secret = matches
        .get_one::<String>("session-secret")
        .cloned()
        .context("missing required argument: --session-secret")?;
    let job_service_url = matches
        .get_one::<String>("job-service-url")
        .cloned()
        .context("missing required argument: --job-service-url")?;

    Ok(Action::Server(Args {
        port,
        dsn,
        session_secret,
        job_service_url,
        builder_url: matches.get_one::<String>("builder-url").cloned(),
        frontend_url: matches
            .get_one::<String>("frontend-url")
            .cloned()
            .unwrap_or_else(|| "http://localhost:3000".to_string()),
        cookie_domain: matches.get_one::<String>("cookie-domain").cloned(),
        seed_admin_emails: matches.get_one::<String>("seed-admin-emails").cloned(),
        access_ttl_minutes: matches
            .get_one::<i64>("access-ttl-minutes")
            .copied()
            .unwrap_or(90),
        refresh_ttl_days: matches
            .get_one::<i64>("refresh-ttl-days")
            .copied()
            .unwrap_or(30),
        otp_ttl_minutes: matches
            .get_one::<u64>("otp-ttl-minutes")
            .copied()
            .unwrap_or(10),
    }))
}

#[cfg(test)]
mod tests {
    use super::handler;
    use crate::cli::{actions::Action, commands};

    #[test]
    fn builds_server_action_from_matches() {
        temp_env::with_vars_unset(["FORGEGATE_BUILDER_URL", "FORGEGATE_COOKIE_DOMAIN"], || {
            let matches = commands::new()
                .try_get_matches_from(vec![
                    "forgegate",
                    "--dsn",
                    "postgres://user@localhost:5432/forgegate",
                    "--session-secret",
                    "0123456789abcdef0123456789abcdef",
                    "--job-service-url",
                    "http://localhost:4000",
                    "--port",
                    "9999",
                ])
                .expect("parse");
            let Action::Server(args) = handler(&matches).expect("handler");
            assert_eq!(args.port, 9999);
            assert_eq!(args.job_service_url, "http://localhost:4000");
            assert!(args.builder_url.is_none());
            assert_eq!(args.access_ttl_minutes, 90);
            assert_eq!(args.refresh_ttl_days, 30);
            assert_eq!(args.otp_ttl_minutes, 10);
        });
    }
}
