use crate::config::SessionConfig;
use anyhow::{Context, Result};
use chrono::Duration;
use clap::{Arg, ArgMatches, Command};

pub const ARG_ACCESS_TOKEN_TTL: &str = "access-token-ttl-seconds";
pub const ARG_REFRESH_TOKEN_TTL: &str = "refresh-token-ttl-seconds";
pub const ARG_REUSE_GRACE: &str = "reuse-grace-seconds";
pub const ARG_MAX_SESSIONS: &str = "max-sessions-per-user";
pub const ARG_THEFT_LOCK: &str = "theft-lock-seconds";
pub const ARG_IP_ROTATION_WINDOW: &str = "ip-rotation-window-seconds";
pub const ARG_IP_ROTATION_THRESHOLD: &str = "ip-rotation-threshold";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ACCESS_TOKEN_TTL)
                .long(ARG_ACCESS_TOKEN_TTL)
                .help("Access token lifetime in seconds")
                .env("WARDEN_ACCESS_TOKEN_TTL_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_REFRESH_TOKEN_TTL)
                .long(ARG_REFRESH_TOKEN_TTL)
                .help("Refresh token lifetime in seconds")
                .env("WARDEN_REFRESH_TOKEN_TTL_SECONDS")
                .default_value("604800")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_REUSE_GRACE)
                .long(ARG_REUSE_GRACE)
                .help("Window in which a consumed refresh token may be replayed")
                .env("WARDEN_REUSE_GRACE_SECONDS")
                .default_value("30")
                .value_parser(clap::value_parser!(i64).range(0..)),
        )
        .arg(
            Arg::new(ARG_MAX_SESSIONS)
                .long(ARG_MAX_SESSIONS)
                .help("Concurrent sessions per user before the oldest is evicted")
                .env("WARDEN_MAX_SESSIONS_PER_USER")
                .default_value("5")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new(ARG_THEFT_LOCK)
                .long(ARG_THEFT_LOCK)
                .help("Account lock duration after refresh token reuse")
                .env("WARDEN_THEFT_LOCK_SECONDS")
                .default_value("604800")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_IP_ROTATION_WINDOW)
                .long(ARG_IP_ROTATION_WINDOW)
                .help("Window for counting distinct refresh IPs")
                .env("WARDEN_IP_ROTATION_WINDOW_SECONDS")
                .default_value("3600")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_IP_ROTATION_THRESHOLD)
                .long(ARG_IP_ROTATION_THRESHOLD)
                .help("Distinct IPs within the window that raise an alert")
                .env("WARDEN_IP_ROTATION_THRESHOLD")
                .default_value("3")
                .value_parser(clap::value_parser!(usize)),
        )
}

fn seconds(matches: &ArgMatches, id: &str) -> Result<Duration> {
    matches
        .get_one::<i64>(id)
        .copied()
        .map(Duration::seconds)
        .with_context(|| format!("missing required argument: --{id}"))
}

/// # Errors
/// Returns an error if a defaulted argument is missing.
pub fn parse(matches: &ArgMatches) -> Result<SessionConfig> {
    let max_sessions = matches
        .get_one::<usize>(ARG_MAX_SESSIONS)
        .copied()
        .context("missing required argument: --max-sessions-per-user")?;
    let ip_threshold = matches
        .get_one::<usize>(ARG_IP_ROTATION_THRESHOLD)
        .copied()
        .context("missing required argument: --ip-rotation-threshold")?;

    Ok(SessionConfig::default()
        .with_access_token_ttl(seconds(matches, ARG_ACCESS_TOKEN_TTL)?)
        .with_refresh_token_ttl(seconds(matches, ARG_REFRESH_TOKEN_TTL)?)
        .with_reuse_grace(seconds(matches, ARG_REUSE_GRACE)?)
        .with_max_concurrent_sessions(max_sessions)
        .with_theft_lock(seconds(matches, ARG_THEFT_LOCK)?)
        .with_ip_rotation(seconds(matches, ARG_IP_ROTATION_WINDOW)?, ip_threshold))
}
