use crate::config::DeviceConfig;
use anyhow::{Context, Result, anyhow};
use chrono::Duration;
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;
use url::Url;

pub const ARG_MAX_ACCOUNTS: &str = "max-accounts-per-device";
pub const ARG_CACHE_TTL: &str = "device-cache-ttl-seconds";
pub const ARG_BAN_CHECK_URL: &str = "ban-check-url";
pub const ARG_BAN_CHECK_TOKEN: &str = "ban-check-token";
pub const ARG_BAN_CHECK_TIMEOUT: &str = "ban-check-timeout-ms";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_MAX_ACCOUNTS)
                .long(ARG_MAX_ACCOUNTS)
                .help("Accounts one device may register")
                .env("WARDEN_MAX_ACCOUNTS_PER_DEVICE")
                .default_value("2")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_CACHE_TTL)
                .long(ARG_CACHE_TTL)
                .help("Lifetime of cached device records")
                .env("WARDEN_DEVICE_CACHE_TTL_SECONDS")
                .default_value("86400")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_BAN_CHECK_URL)
                .long(ARG_BAN_CHECK_URL)
                .help("Base URL of the admin device-ban service")
                .env("WARDEN_BAN_CHECK_URL")
                .requires(ARG_BAN_CHECK_TOKEN),
        )
        .arg(
            Arg::new(ARG_BAN_CHECK_TOKEN)
                .long(ARG_BAN_CHECK_TOKEN)
                .help("Service token sent as X-Service-Token")
                .env("WARDEN_BAN_CHECK_TOKEN")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_BAN_CHECK_TIMEOUT)
                .long(ARG_BAN_CHECK_TIMEOUT)
                .help("Ban check timeout in milliseconds")
                .env("WARDEN_BAN_CHECK_TIMEOUT_MS")
                .default_value("500")
                .value_parser(clap::value_parser!(u64)),
        )
}

/// # Errors
/// Returns an error if the ban service URL does not parse.
pub fn parse(matches: &ArgMatches) -> Result<DeviceConfig> {
    let max_accounts = matches
        .get_one::<i64>(ARG_MAX_ACCOUNTS)
        .copied()
        .context("missing required argument: --max-accounts-per-device")?;
    let cache_ttl = matches
        .get_one::<i64>(ARG_CACHE_TTL)
        .copied()
        .context("missing required argument: --device-cache-ttl-seconds")?;
    let timeout = matches
        .get_one::<u64>(ARG_BAN_CHECK_TIMEOUT)
        .copied()
        .context("missing required argument: --ban-check-timeout-ms")?;

    let mut config = DeviceConfig::default()
        .with_max_accounts_per_device(max_accounts)
        .with_cache_ttl(Duration::seconds(cache_ttl))
        .with_ban_check_timeout(std::time::Duration::from_millis(timeout));

    if let Some(url) = matches.get_one::<String>(ARG_BAN_CHECK_URL) {
        let url = Url::parse(url).map_err(|e| anyhow!("invalid --{ARG_BAN_CHECK_URL}: {e}"))?;
        let token = matches
            .get_one::<String>(ARG_BAN_CHECK_TOKEN)
            .cloned()
            .context("missing required argument: --ban-check-token")?;
        config = config.with_ban_check(url, SecretString::from(token));
    }
    Ok(config)
}
