use crate::config::{SudoConfig, TotpConfig};
use anyhow::{Context, Result};
use chrono::Duration;
use clap::{Arg, ArgMatches, Command};

pub const ARG_ISSUER: &str = "totp-issuer";
pub const ARG_BACKUP_CODES: &str = "backup-code-count";
pub const ARG_PENDING_TTL: &str = "pending-token-ttl-seconds";
pub const ARG_SUDO_TTL: &str = "sudo-ttl-seconds";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ISSUER)
                .long(ARG_ISSUER)
                .help("Issuer shown in authenticator apps")
                .env("WARDEN_TOTP_ISSUER")
                .default_value("Warden"),
        )
        .arg(
            Arg::new(ARG_BACKUP_CODES)
                .long(ARG_BACKUP_CODES)
                .help("Backup codes generated on enrollment")
                .env("WARDEN_BACKUP_CODE_COUNT")
                .default_value("10")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new(ARG_PENDING_TTL)
                .long(ARG_PENDING_TTL)
                .help("Lifetime of the token between password and code")
                .env("WARDEN_PENDING_TOKEN_TTL_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_SUDO_TTL)
                .long(ARG_SUDO_TTL)
                .help("Lifetime of a sudo grant")
                .env("WARDEN_SUDO_TTL_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
}

/// # Errors
/// Returns an error if a defaulted argument is missing.
pub fn parse(matches: &ArgMatches) -> Result<(TotpConfig, SudoConfig)> {
    let issuer = matches
        .get_one::<String>(ARG_ISSUER)
        .cloned()
        .context("missing required argument: --totp-issuer")?;
    let backup_codes = matches
        .get_one::<usize>(ARG_BACKUP_CODES)
        .copied()
        .context("missing required argument: --backup-code-count")?;
    let pending_ttl = matches
        .get_one::<i64>(ARG_PENDING_TTL)
        .copied()
        .context("missing required argument: --pending-token-ttl-seconds")?;
    let sudo_ttl = matches
        .get_one::<i64>(ARG_SUDO_TTL)
        .copied()
        .context("missing required argument: --sudo-ttl-seconds")?;

    Ok((
        TotpConfig::default()
            .with_issuer(issuer)
            .with_backup_code_count(backup_codes)
            .with_pending_token_ttl(Duration::seconds(pending_ttl)),
        SudoConfig::default().with_ttl(Duration::seconds(sudo_ttl)),
    ))
}
