use crate::cli::telemetry;
use crate::clock::{SharedClock, SystemClock};
use crate::config::SecurityConfig;
use crate::services::Services;
use crate::session::JwtIssuer;
use crate::store::{PgStore, Stores};
use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use tracing::info;

#[derive(Debug)]
pub struct Args {
    pub dsn: SecretString,
    pub migrate: bool,
    pub signing_key: SecretString,
    pub cleanup_interval: std::time::Duration,
    pub config: SecurityConfig,
}

fn log_startup_args(args: &Args) {
    let config = &args.config;
    info!(
        migrate = args.migrate,
        cleanup_interval_secs = args.cleanup_interval.as_secs(),
        max_sessions = config.session.max_concurrent_sessions,
        reuse_grace_secs = config.session.reuse_grace.num_seconds(),
        lock_threshold = config.login.lock_threshold,
        max_accounts_per_device = config.device.max_accounts_per_device,
        ban_check = config.device.ban_check_url.is_some(),
        "starting warden"
    );
}

/// Connect, optionally migrate, run the sweeps until ctrl-c.
///
/// # Errors
/// Returns an error if the database is unreachable, the schema fails to apply
/// or the services cannot be built.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let store = Arc::new(PgStore::connect(args.dsn.expose_secret()).await?);
    if args.migrate {
        store.migrate().await?;
    }

    let clock: SharedClock = Arc::new(SystemClock);
    let services = Services::build(
        &args.config,
        &Stores::from_backend(store),
        Arc::new(JwtIssuer::new(&args.signing_key)),
        clock,
        args.cleanup_interval,
    )?;
    services.start();
    info!("warden running, press ctrl-c to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("shutting down");
    services.stop();
    telemetry::shutdown_tracer();
    Ok(())
}
