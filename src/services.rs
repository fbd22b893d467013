//! Wiring: every component built once over one set of stores.

use crate::audit::{AuditLog, SecurityAudit};
use crate::auth::Authenticator;
use crate::clock::SharedClock;
use crate::config::SecurityConfig;
use crate::device::{self, DeviceTracker};
use crate::login::LoginAttemptTracker;
use crate::password::{Argon2Hasher, PasswordHasher};
use crate::session::{AccessTokenIssuer, SessionManager};
use crate::store::Stores;
use crate::sudo::SudoService;
use crate::sweeper::Sweeper;
use crate::totp::TotpService;
use anyhow::Result;
use std::sync::Arc;
use tracing::warn;

pub struct Services {
    pub audit: Arc<AuditLog>,
    pub login: Arc<LoginAttemptTracker>,
    pub devices: Arc<DeviceTracker>,
    pub sessions: Arc<SessionManager>,
    pub totp: Arc<TotpService>,
    pub sudo: Arc<SudoService>,
    pub auth: Arc<Authenticator>,
    cleanup: Sweeper,
}

impl Services {
    /// # Errors
    /// Returns an error if the ban-check HTTP client cannot be built.
    pub fn build(
        config: &SecurityConfig,
        stores: &Stores,
        issuer: Arc<dyn AccessTokenIssuer>,
        clock: SharedClock,
        cleanup_interval: std::time::Duration,
    ) -> Result<Self> {
        let hasher: Arc<dyn PasswordHasher> = Arc::new(Argon2Hasher);
        let audit = Arc::new(AuditLog::new(stores.audit.clone(), clock.clone()));
        let audit_sink: Arc<dyn SecurityAudit> = audit.clone();

        let login = Arc::new(LoginAttemptTracker::new(
            config.login.clone(),
            stores.users.clone(),
            clock.clone(),
        ));
        let devices = Arc::new(DeviceTracker::new(
            config.device.clone(),
            stores.devices.clone(),
            device::ban::from_config(&config.device)?,
            audit_sink.clone(),
            clock.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(
            config.session.clone(),
            stores.sessions.clone(),
            stores.users.clone(),
            stores.totp.clone(),
            issuer,
            login.clone(),
            audit_sink.clone(),
            clock.clone(),
        ));
        let totp = Arc::new(TotpService::new(
            config.totp.clone(),
            stores.totp.clone(),
            stores.users.clone(),
            hasher.clone(),
            audit_sink.clone(),
            clock.clone(),
        ));
        let sudo = Arc::new(SudoService::new(
            config.sudo.clone(),
            stores.users.clone(),
            stores.sudo.clone(),
            totp.clone(),
            login.clone(),
            hasher.clone(),
            audit_sink.clone(),
            clock.clone(),
        ));
        let auth = Arc::new(Authenticator::new(
            stores.users.clone(),
            sessions.clone(),
            login.clone(),
            devices.clone(),
            totp.clone(),
            hasher,
            audit_sink,
            clock,
        ));

        Ok(Self {
            audit,
            login,
            devices,
            sessions,
            totp,
            sudo,
            auth,
            cleanup: Sweeper::new("expired-sessions", cleanup_interval),
        })
    }

    /// Start every background sweep.
    pub fn start(&self) {
        self.login.start();
        self.devices.start();

        let sessions = Arc::clone(&self.sessions);
        let sudo = Arc::clone(&self.sudo);
        self.cleanup.start(move || {
            let sessions = Arc::clone(&sessions);
            let sudo = Arc::clone(&sudo);
            async move {
                if let Err(err) = sessions.cleanup_expired_sessions().await {
                    warn!("Session cleanup failed: {err:#}");
                }
                if let Err(err) = sudo.cleanup_expired().await {
                    warn!("Sudo cleanup failed: {err:#}");
                }
            }
        });
    }

    pub fn stop(&self) {
        self.cleanup.stop();
        self.devices.stop();
        self.login.stop();
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.cleanup.is_running() && self.devices.is_running() && self.login.is_running()
    }
}
