use clap::{
    Arg, ArgAction, ColorChoice, Command,
    builder::{
        ValueParser,
        styling::{AnsiColor, Effects, Styles},
    },
};

/// Session secrets key the token HMAC; a short secret weakens every hash.
pub fn validator_session_secret() -> ValueParser {
    ValueParser::from(
        move |secret: &str| -> std::result::Result<String, String> {
            if secret.len() < 32 {
                return Err("session secret must be at least 32 characters".to_string());
            }
            Ok(secret.to_string())
        },
    )
}

pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    Command::new("forgegate")
        .about("Session, entitlement, and job-stream gateway")
        .version(env!("CARGO_PKG_VERSION"))
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .help("Port to listen on")
                .default_value("8080")
                .env("FORGEGATE_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("dsn")
                .short('d')
                .long("dsn")
                .help("Database connection string")
                .env("FORGEGATE_DSN")
                .required(true),
        )
        .arg(
            Arg::new("session-secret")
                .long("session-secret")
                .help("HMAC key for token hashing; rotating it invalidates all sessions")
                .env("FORGEGATE_SESSION_SECRET")
                .value_parser(validator_session_secret())
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new("job-service-url")
                .long("job-service-url")
                .help("Base URL of the upstream job-execution service")
                .env("FORGEGATE_JOB_SERVICE_URL")
                .required(true),
        )
        .arg(
            Arg::new("builder-url")
                .long("builder-url")
                .help("Base URL of the upstream builder service (WebSocket bridge)")
                .env("FORGEGATE_BUILDER_URL"),
        )
        .arg(
            Arg::new("frontend-url")
                .long("frontend-url")
                .help("Frontend origin for CORS and cookie security policy")
                .default_value("http://localhost:3000")
                .env("FORGEGATE_FRONTEND_URL"),
        )
        .arg(
            Arg::new("cookie-domain")
                .long("cookie-domain")
                .help("Optional Domain attribute for auth cookies")
                .env("FORGEGATE_COOKIE_DOMAIN"),
        )
        .arg(
            Arg::new("seed-admin-emails")
                .long("seed-admin-emails")
                .help("Comma-separated emails promoted to admin at startup")
                .env("FORGEGATE_SEED_ADMIN_EMAILS"),
        )
        .arg(
            Arg::new("access-ttl-minutes")
                .long("access-ttl-minutes")
                .help("Access token lifetime in minutes")
                .default_value("90")
                .env("FORGEGATE_ACCESS_TTL_MINUTES")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("refresh-ttl-days")
                .long("refresh-ttl-days")
                .help("Refresh token lifetime in days")
                .default_value("30")
                .env("FORGEGATE_REFRESH_TTL_DAYS")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("otp-ttl-minutes")
                .long("otp-ttl-minutes")
                .help("One-time code lifetime in minutes")
                .default_value("10")
                .env("FORGEGATE_OTP_TTL_MINUTES")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("verbosity")
                .short('v')
                .long("verbose")
                .help("Verbosity level: ERROR, WARN, INFO, DEBUG, TRACE (use multiple times)")
                .action(ArgAction::Count),
        )
}

#[cfg(test)]
mod tests {
    use super::new;

    fn base_args() -> Vec<&'static str> {
        vec![
            "forgegate",
            "--dsn",
            "postgres://user@localhost:5432/forgegate",
            "--session-secret",
            "0123456789abcdef0123456789abcdef",
            "--job-service-url",
            "http://localhost:4000",
        ]
    }

    #[test]
    fn parses_minimal_arguments() {
        temp_env::with_vars_unset(
            ["FORGEGATE_PORT", "FORGEGATE_FRONTEND_URL"],
            || {
                let matches = new().try_get_matches_from(base_args()).expect("parse");
                assert_eq!(matches.get_one::<u16>("port").copied(), Some(8080));
                assert_eq!(
                    matches.get_one::<String>("frontend-url").map(String::as_str),
                    Some("http://localhost:3000")
                );
            },
        );
    }

    #[test]
    fn rejects_short_session_secret() {
        let mut args = base_args();
        args[4] = "too-short";
        let result = new().try_get_matches_from(args);
        assert!(result.is_err());
    }

    #[test]
    fn requires_dsn() {
        temp_env::with_vars_unset(["FORGEGATE_DSN"], || {
            let result = new().try_get_matches_from(vec![
                "forgegate",
                "--session-secret",
                "0123456789abcdef0123456789abcdef",
                "--job-service-url",
                "http://localhost:4000",
            ]);
            assert!(result.is_err());
        });
    }
}
