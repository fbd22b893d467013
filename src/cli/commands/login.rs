use crate::config::{BackoffSchedule, LoginConfig};
use anyhow::{Context, Result};
use chrono::Duration;
use clap::{Arg, ArgMatches, Command};

pub const ARG_ATTEMPT_WINDOW: &str = "login-attempt-window-seconds";
pub const ARG_LOCK_THRESHOLD: &str = "login-lock-threshold";
pub const ARG_LOCK_DURATION: &str = "login-lock-seconds";
pub const ARG_BACKOFF: &str = "login-backoff";
pub const ARG_TOTP_WINDOW: &str = "totp-attempt-window-seconds";
pub const ARG_TOTP_MAX_ATTEMPTS: &str = "totp-max-attempts";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ATTEMPT_WINDOW)
                .long(ARG_ATTEMPT_WINDOW)
                .help("Window in which failed logins accumulate")
                .env("WARDEN_LOGIN_ATTEMPT_WINDOW_SECONDS")
                .default_value("1800")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_LOCK_THRESHOLD)
                .long(ARG_LOCK_THRESHOLD)
                .help("Failed logins that lock the account")
                .env("WARDEN_LOGIN_LOCK_THRESHOLD")
                .default_value("5")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(ARG_LOCK_DURATION)
                .long(ARG_LOCK_DURATION)
                .help("How long a brute-force lock lasts")
                .env("WARDEN_LOGIN_LOCK_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_BACKOFF)
                .long(ARG_BACKOFF)
                .help("Comma-separated delays in seconds, indexed by failure count")
                .env("WARDEN_LOGIN_BACKOFF")
                .default_value("0,1,2,4,8")
                .value_parser(clap::value_parser!(BackoffSchedule)),
        )
        .arg(
            Arg::new(ARG_TOTP_WINDOW)
                .long(ARG_TOTP_WINDOW)
                .help("Window in which wrong second-factor codes accumulate")
                .env("WARDEN_TOTP_ATTEMPT_WINDOW_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_TOTP_MAX_ATTEMPTS)
                .long(ARG_TOTP_MAX_ATTEMPTS)
                .help("Wrong second-factor codes allowed per window")
                .env("WARDEN_TOTP_MAX_ATTEMPTS")
                .default_value("3")
                .value_parser(clap::value_parser!(u32)),
        )
}

/// # Errors
/// Returns an error if a defaulted argument is missing.
pub fn parse(matches: &ArgMatches) -> Result<LoginConfig> {
    let seconds = |id: &str| -> Result<Duration> {
        matches
            .get_one::<i64>(id)
            .copied()
            .map(Duration::seconds)
            .with_context(|| format!("missing required argument: --{id}"))
    };
    let count = |id: &str| -> Result<u32> {
        matches
            .get_one::<u32>(id)
            .copied()
            .with_context(|| format!("missing required argument: --{id}"))
    };
    let backoff = matches
        .get_one::<BackoffSchedule>(ARG_BACKOFF)
        .cloned()
        .context("missing required argument: --login-backoff")?;

    Ok(LoginConfig::default()
        .with_attempt_window(seconds(ARG_ATTEMPT_WINDOW)?)
        .with_lock_threshold(count(ARG_LOCK_THRESHOLD)?)
        .with_lock_duration(seconds(ARG_LOCK_DURATION)?)
        .with_backoff(backoff)
        .with_totp_limits(seconds(ARG_TOTP_WINDOW)?, count(ARG_TOTP_MAX_ATTEMPTS)?))
}
