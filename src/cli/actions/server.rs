use crate::{api, gateway::GatewayConfig};
use anyhow::{Context, Result};
use secrecy::SecretString;
use url::Url;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub session_secret: String,
    pub job_service_url: String,
    pub builder_url: Option<String>,
    pub frontend_url: String,
    pub cookie_domain: Option<String>,
    pub seed_admin_emails: Option<String>,
    pub access_ttl_minutes: i64,
    pub refresh_ttl_days: i64,
    pub otp_ttl_minutes: u64,
}

/// Execute the server action.
///
/// # Errors
/// Returns an error if configuration is invalid or the server fails to start.
pub async fn handle(action: super::Action) -> Result<()> {
    let super::Action::Server(args) = action;

    Url::parse(&args.job_service_url).context("invalid --job-service-url")?;
    if let Some(builder) = &args.builder_url {
        Url::parse(builder).context("invalid --builder-url")?;
    }

    let auth_config = api::handlers::auth::AuthConfig::new(args.frontend_url)
        .with_cookie_domain(args.cookie_domain)
        .with_access_ttl_seconds(args.access_ttl_minutes * 60)
        .with_refresh_ttl_seconds(args.refresh_ttl_days * 24 * 3600)
        .with_otp_ttl_seconds(args.otp_ttl_minutes * 60);

    let gateway_config = GatewayConfig::new(args.job_service_url)
        .with_builder_base_url(args.builder_url);

    let seed_admins = args
        .seed_admin_emails
        .as_deref()
        .map(parse_admin_emails)
        .unwrap_or_default();

    api::new(
        args.port,
        args.dsn,
        SecretString::from(args.session_secret),
        auth_config,
        gateway_config,
        seed_admins,
    )
    .await
}

fn parse_admin_emails(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|email| email.trim().to_lowercase())
        .filter(|email| !email.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::parse_admin_emails;

    #[test]
    fn parse_admin_emails_trims_and_lowercases() {
        let emails = parse_admin_emails(" Root@Example.COM , ops@example.com ,, ");
        assert_eq!(emails, vec!["root@example.com", "ops@example.com"]);
    }

    #[test]
    fn parse_admin_emails_empty_input() {
        assert!(parse_admin_emails("").is_empty());
    }
}
