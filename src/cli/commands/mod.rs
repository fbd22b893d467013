pub mod device;
pub mod logging;
pub mod login;
pub mod session;
pub mod totp;

use clap::{
    Arg, ColorChoice, Command,
    builder::styling::{AnsiColor, Effects, Styles},
};

pub const ARG_DSN: &str = "dsn";
pub const ARG_MIGRATE: &str = "migrate";
pub const ARG_SIGNING_KEY: &str = "signing-key";
pub const ARG_CLEANUP_INTERVAL: &str = "cleanup-interval-seconds";

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::GIT_COMMIT_HASH).into_boxed_str(),
    );

    let command = Command::new("warden")
        .about("Credential and session security daemon")
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new(ARG_DSN)
                .short('d')
                .long(ARG_DSN)
                .help("Database connection string")
                .env("WARDEN_DSN")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_MIGRATE)
                .long(ARG_MIGRATE)
                .help("Apply the schema and legacy backfills before starting")
                .env("WARDEN_MIGRATE")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_SIGNING_KEY)
                .long(ARG_SIGNING_KEY)
                .help("HS256 key for access tokens")
                .env("WARDEN_SIGNING_KEY")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_CLEANUP_INTERVAL)
                .long(ARG_CLEANUP_INTERVAL)
                .help("Interval of the expired session and sudo cleanup")
                .env("WARDEN_CLEANUP_INTERVAL_SECONDS")
                .default_value("3600")
                .value_parser(clap::value_parser!(u64).range(1..)),
        );

    let command = session::with_args(command);
    let command = login::with_args(command);
    let command = device::with_args(command);
    let command = totp::with_args(command);
    logging::with_args(command)
}
