//! Map parsed arguments onto the daemon action and its configuration.

use crate::cli::actions::{Action, daemon::Args};
use crate::cli::commands::{self, device, login, session, totp};
use crate::config::SecurityConfig;
use anyhow::{Context, Result};
use secrecy::SecretString;

/// # Errors
/// Returns an error if required arguments are missing or invalid.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let dsn = matches
        .get_one::<String>(commands::ARG_DSN)
        .cloned()
        .context("missing required argument: --dsn")?;
    let signing_key = matches
        .get_one::<String>(commands::ARG_SIGNING_KEY)
        .cloned()
        .context("missing required argument: --signing-key")?;
    let cleanup_interval = matches
        .get_one::<u64>(commands::ARG_CLEANUP_INTERVAL)
        .copied()
        .context("missing required argument: --cleanup-interval-seconds")?;

    let (totp_config, sudo_config) = totp::parse(matches)?;
    let config = SecurityConfig::default()
        .with_session(session::parse(matches)?)
        .with_login(login::parse(matches)?)
        .with_device(device::parse(matches)?)
        .with_totp(totp_config)
        .with_sudo(sudo_config);

    Ok(Action::Daemon(Args {
        dsn: SecretString::from(dsn),
        migrate: matches.get_flag(commands::ARG_MIGRATE),
        signing_key: SecretString::from(signing_key),
        cleanup_interval: std::time::Duration::from_secs(cleanup_interval),
        config,
    }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Duration;
    use secrecy::ExposeSecret;

    fn daemon_args(env: &[(&str, Option<&str>)], argv: &[&str]) -> Result<Args> {
        let mut action = None;
        temp_env::with_vars(env, || {
            let mut args = vec!["warden", "--dsn", "postgres://localhost/warden", "--signing-key", "k"];
            args.extend_from_slice(argv);
            let matches = commands::new().get_matches_from(args);
            action = Some(handler(&matches));
        });
        match action.unwrap()? {
            Action::Daemon(args) => Ok(args),
        }
    }

    #[test]
    fn defaults_match_library_defaults() -> Result<()> {
        let args = daemon_args(&[("WARDEN_BAN_CHECK_URL", None)], &[])?;
        assert_eq!(args.dsn.expose_secret(), "postgres://localhost/warden");
        assert!(!args.migrate);
        assert_eq!(args.config.session.reuse_grace, Duration::seconds(30));
        assert_eq!(args.config.session.access_token_ttl, Duration::minutes(5));
        assert_eq!(args.config.login.lock_threshold, 5);
        assert_eq!(args.config.login.backoff.len(), 5);
        assert_eq!(args.config.device.max_accounts_per_device, 2);
        assert!(args.config.device.ban_check_url.is_none());
        assert_eq!(args.config.totp.issuer, "Warden");
        assert_eq!(args.config.sudo.ttl, Duration::minutes(15));
        Ok(())
    }

    #[test]
    fn env_overrides_reach_the_config() -> Result<()> {
        let args = daemon_args(
            &[
                ("WARDEN_MAX_SESSIONS_PER_USER", Some("3")),
                ("WARDEN_LOGIN_LOCK_THRESHOLD", Some("7")),
                ("WARDEN_LOGIN_BACKOFF", Some("0,5")),
                ("WARDEN_BAN_CHECK_URL", Some("https://admin.internal")),
                ("WARDEN_BAN_CHECK_TOKEN", Some("svc")),
                ("WARDEN_SUDO_TTL_SECONDS", Some("120")),
            ],
            &["--migrate"],
        )?;
        assert!(args.migrate);
        assert_eq!(args.config.session.max_concurrent_sessions, 3);
        assert_eq!(args.config.login.lock_threshold, 7);
        assert_eq!(
            args.config.login.backoff.delay_for(9),
            std::time::Duration::from_secs(5)
        );
        assert_eq!(
            args.config.device.ban_check_url.as_ref().map(url::Url::as_str),
            Some("https://admin.internal/")
        );
        assert_eq!(args.config.sudo.ttl, Duration::minutes(2));
        Ok(())
    }
}
