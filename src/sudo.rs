//! Short-lived re-authentication grants for high-risk actions.
//!
//! A sudo token only proves that the user re-entered their credentials
//! recently. What it unlocks is decided by the caller. Wrong passwords and
//! codes count against a per-user throttle kept apart from the login one.

use crate::audit::{SecurityAudit, SecurityEvent, SecurityEventType};
use crate::clock::SharedClock;
use crate::config::SudoConfig;
use crate::error::{AuthError, AuthResult};
use crate::login::LoginLockout;
use crate::password::{PasswordHasher, verify_password};
use crate::store::{SudoSession, SudoStore, UserStore};
use crate::tokens::{generate_opaque_token, hash_token, truncate_user_agent};
use crate::totp::{SecondFactor, TotpService};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

fn throttle_key(user_id: Uuid) -> String {
    format!("sudo:{user_id}")
}

#[derive(Clone, Debug)]
pub struct SudoGrant {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

pub struct SudoService {
    config: SudoConfig,
    users: Arc<dyn UserStore>,
    store: Arc<dyn SudoStore>,
    totp: Arc<TotpService>,
    lockout: Arc<dyn LoginLockout>,
    hasher: Arc<dyn PasswordHasher>,
    audit: Arc<dyn SecurityAudit>,
    clock: SharedClock,
}

impl SudoService {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        config: SudoConfig,
        users: Arc<dyn UserStore>,
        store: Arc<dyn SudoStore>,
        totp: Arc<TotpService>,
        lockout: Arc<dyn LoginLockout>,
        hasher: Arc<dyn PasswordHasher>,
        audit: Arc<dyn SecurityAudit>,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            users,
            store,
            totp,
            lockout,
            hasher,
            audit,
            clock,
        }
    }

    async fn fail(&self, user_id: Uuid, ip: &str, user_agent: &str, reason: &str) {
        self.lockout.record_failure(&throttle_key(user_id), ip).await;
        self.audit
            .record(
                SecurityEvent::new(SecurityEventType::SudoFailed)
                    .user(user_id)
                    .ip(ip)
                    .user_agent(user_agent)
                    .details(reason),
            )
            .await;
    }

    /// Re-check the password and, when 2FA is on, one second factor.
    ///
    /// # Errors
    /// `InvalidCredentials` for a wrong password or unknown user,
    /// `TotpRequired` when 2FA is enabled and no factor was given,
    /// `InvalidCode` when the factor does not verify,
    /// `RateLimited` after too many failures in the attempt window.
    pub async fn verify(
        &self,
        user_id: Uuid,
        password: &str,
        factor: Option<SecondFactor<'_>>,
        ip: &str,
        user_agent: &str,
    ) -> AuthResult<SudoGrant> {
        let now = self.clock.now();
        self.store
            .delete_expired_sudo_sessions(Some(user_id), now)
            .await
            .context("Failed to prune expired sudo sessions")?;

        let key = throttle_key(user_id);
        if let Some(retry_at) = self.lockout.locked_until(&key).await {
            return Err(AuthError::RateLimited { retry_at });
        }

        let Some(user) = self.users.find_user(user_id).await? else {
            return Err(AuthError::InvalidCredentials);
        };
        if !verify_password(&self.hasher, password, &user.password_hash).await? {
            self.fail(user_id, ip, user_agent, "invalid password").await;
            return Err(AuthError::InvalidCredentials);
        }

        if self.totp.is_enabled(user_id).await? {
            let verified = match factor {
                None => return Err(AuthError::TotpRequired),
                Some(SecondFactor::Totp(code)) => self.totp.verify(user_id, code).await?,
                Some(SecondFactor::BackupCode(code)) => {
                    self.totp.verify_backup_code(user_id, code).await?
                }
            };
            if !verified {
                self.fail(user_id, ip, user_agent, "invalid second factor").await;
                return Err(AuthError::InvalidCode);
            }
        }

        self.lockout.reset(&key).await;
        let token = generate_opaque_token()?;
        let expires_at = now + self.config.ttl;
        self.store
            .insert_sudo_session(SudoSession {
                id: Uuid::now_v7(),
                user_id,
                token_hash: hash_token(&token),
                ip_address: ip.to_string(),
                user_agent: truncate_user_agent(user_agent, self.config.user_agent_max_len),
                expires_at,
                created_at: now,
                last_used_at: now,
            })
            .await
            .context("Failed to store sudo session")?;

        info!(user_id = %user_id, %expires_at, "sudo mode activated");
        self.audit
            .record(
                SecurityEvent::new(SecurityEventType::SudoActivated)
                    .user(user_id)
                    .email(&user.email)
                    .ip(ip)
                    .user_agent(user_agent)
                    .success(),
            )
            .await;
        Ok(SudoGrant { token, expires_at })
    }

    async fn live_session(&self, user_id: Uuid, token: &str) -> Result<Option<SudoSession>> {
        let now = self.clock.now();
        Ok(self
            .store
            .find_sudo_session(user_id, &hash_token(token))
            .await?
            .filter(|session| session.expires_at > now))
    }

    /// True when `token` belongs to `user_id` and has not expired.
    ///
    /// # Errors
    /// Returns an error if the store query fails.
    pub async fn validate_token(&self, user_id: Uuid, token: &str) -> Result<bool> {
        let Some(session) = self.live_session(user_id, token).await? else {
            return Ok(false);
        };
        self.store
            .touch_sudo_session(session.id, self.clock.now())
            .await?;
        Ok(true)
    }

    /// Push the expiry of a still-valid token one full TTL past now.
    ///
    /// # Errors
    /// `InvalidToken` when the token is unknown or already expired.
    pub async fn extend_session(&self, user_id: Uuid, token: &str) -> AuthResult<DateTime<Utc>> {
        let Some(session) = self.live_session(user_id, token).await? else {
            return Err(AuthError::InvalidToken("sudo session expired"));
        };
        let expires_at = self.clock.now() + self.config.ttl;
        if !self.store.extend_sudo_session(session.id, expires_at).await? {
            return Err(AuthError::InvalidToken("sudo session expired"));
        }
        debug!(user_id = %user_id, %expires_at, "sudo session extended");
        Ok(expires_at)
    }

    /// # Errors
    /// Returns an error if the store delete fails.
    pub async fn revoke_token(&self, user_id: Uuid, token: &str) -> Result<bool> {
        let revoked = self
            .store
            .delete_sudo_session(user_id, &hash_token(token))
            .await?;
        if revoked {
            self.audit
                .record(
                    SecurityEvent::new(SecurityEventType::SudoRevoked)
                        .user(user_id)
                        .success(),
                )
                .await;
        }
        Ok(revoked)
    }

    /// # Errors
    /// Returns an error if the store delete fails.
    pub async fn revoke_all(&self, user_id: Uuid) -> Result<u64> {
        let revoked = self.store.delete_user_sudo_sessions(user_id).await?;
        if revoked > 0 {
            self.audit
                .record(
                    SecurityEvent::new(SecurityEventType::SudoRevoked)
                        .user(user_id)
                        .success()
                        .details(format!("{revoked} sudo sessions revoked")),
                )
                .await;
        }
        Ok(revoked)
    }

    /// Most recent unexpired grant.
    ///
    /// # Errors
    /// Returns an error if the store query fails.
    pub async fn active_session(&self, user_id: Uuid) -> Result<Option<SudoSession>> {
        self.store
            .latest_sudo_session(user_id, self.clock.now())
            .await
    }

    /// # Errors
    /// Returns an error if the store query fails.
    pub async fn is_totp_enabled(&self, user_id: Uuid) -> Result<bool> {
        self.totp.is_enabled(user_id).await
    }

    /// # Errors
    /// Returns an error if the store delete fails.
    pub async fn cleanup_expired(&self) -> Result<u64> {
        let deleted = self
            .store
            .delete_expired_sudo_sessions(None, self.clock.now())
            .await?;
        if deleted > 0 {
            info!(deleted, "expired sudo sessions removed");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::clock::{Clock, ManualClock};
    use crate::config::{LoginConfig, TotpConfig};
    use crate::login::LoginAttemptTracker;
    use crate::password::Argon2Hasher;
    use crate::store::{AuditStore, MemoryStore, User};
    use crate::totp::build_totp;
    use chrono::Duration;

    struct Fixture {
        sudo: SudoService,
        totp: Arc<TotpService>,
        store: Arc<MemoryStore>,
        clock: ManualClock,
        user_id: Uuid,
    }

    async fn fixture() -> Fixture {
        fixture_with(SudoConfig::default()).await
    }

    async fn fixture_with(config: SudoConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::default();
        let shared: SharedClock = Arc::new(clock.clone());
        let hasher: Arc<dyn PasswordHasher> = Arc::new(Argon2Hasher);
        let user = User::new("bob@example.com", hasher.hash("correct horse").unwrap());
        let user_id = user.id;
        store.insert_user(user).await;
        let audit: Arc<dyn SecurityAudit> = Arc::new(AuditLog::new(store.clone(), shared.clone()));
        let totp = Arc::new(TotpService::new(
            TotpConfig::default(),
            store.clone(),
            store.clone(),
            hasher.clone(),
            audit.clone(),
            shared.clone(),
        ));
        let lockout = Arc::new(LoginAttemptTracker::new(
            LoginConfig::default().with_lock_threshold(3),
            store.clone(),
            shared.clone(),
        ));
        let sudo = SudoService::new(
            config,
            store.clone(),
            store.clone(),
            totp.clone(),
            lockout,
            hasher,
            audit,
            shared,
        );
        Fixture {
            sudo,
            totp,
            store,
            clock,
            user_id,
        }
    }

    async fn enroll(f: &Fixture) -> (String, Vec<String>) {
        let setup = f.totp.generate_setup(f.user_id).await.unwrap();
        let code = current_code(&setup.secret, &f.clock);
        let codes = f.totp.verify_and_enable(f.user_id, &code).await.unwrap();
        (setup.secret, codes)
    }

    fn current_code(secret: &str, clock: &ManualClock) -> String {
        build_totp(secret, "Warden", "user")
            .unwrap()
            .generate(u64::try_from(clock.now().timestamp()).unwrap())
    }

    #[tokio::test]
    async fn password_only_grant_validates_until_expiry() -> anyhow::Result<()> {
        let f = fixture().await;
        let grant = f
            .sudo
            .verify(f.user_id, "correct horse", None, "10.0.0.1", "curl")
            .await?;
        assert_eq!(grant.expires_at, f.clock.now() + Duration::minutes(15));
        assert!(f.sudo.validate_token(f.user_id, &grant.token).await?);
        assert!(!f.sudo.validate_token(Uuid::now_v7(), &grant.token).await?);
        assert!(f.sudo.active_session(f.user_id).await?.is_some());

        f.clock.advance(Duration::minutes(16));
        assert!(!f.sudo.validate_token(f.user_id, &grant.token).await?);
        assert!(f.sudo.active_session(f.user_id).await?.is_none());
        assert_eq!(f.sudo.cleanup_expired().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn stored_user_agent_follows_configured_limit() -> anyhow::Result<()> {
        let f = fixture_with(SudoConfig::default().with_user_agent_max_len(8)).await;
        f.sudo
            .verify(f.user_id, "correct horse", None, "10.0.0.1", "Mozilla/5.0 (X11)")
            .await?;
        let session = f.sudo.active_session(f.user_id).await?.unwrap();
        assert_eq!(session.user_agent, "Mozilla/");
        Ok(())
    }

    #[tokio::test]
    async fn wrong_password_is_rejected_and_audited() -> anyhow::Result<()> {
        let f = fixture().await;
        assert!(matches!(
            f.sudo.verify(f.user_id, "wrong", None, "10.0.0.1", "curl").await,
            Err(AuthError::InvalidCredentials)
        ));
        let events = f.store.recent_events(f.user_id, 10).await?;
        assert_eq!(events[0].event_type, SecurityEventType::SudoFailed);
        Ok(())
    }

    #[tokio::test]
    async fn repeated_failures_are_rate_limited() -> anyhow::Result<()> {
        let f = fixture().await;
        for _ in 0..3 {
            assert!(matches!(
                f.sudo.verify(f.user_id, "wrong", None, "", "").await,
                Err(AuthError::InvalidCredentials)
            ));
        }

        match f.sudo.verify(f.user_id, "correct horse", None, "", "").await {
            Err(AuthError::RateLimited { retry_at }) => {
                assert_eq!(retry_at, f.clock.now() + Duration::minutes(15));
            }
            other => panic!("expected rate limit, got {other:?}"),
        }

        f.clock.advance(Duration::minutes(16));
        f.sudo.verify(f.user_id, "correct horse", None, "", "").await?;
        Ok(())
    }

    #[tokio::test]
    async fn enrolled_user_needs_a_second_factor() -> anyhow::Result<()> {
        let f = fixture().await;
        let (secret, backup_codes) = enroll(&f).await;
        assert!(f.sudo.is_totp_enabled(f.user_id).await?);

        assert!(matches!(
            f.sudo.verify(f.user_id, "correct horse", None, "", "").await,
            Err(AuthError::TotpRequired)
        ));
        assert!(matches!(
            f.sudo
                .verify(f.user_id, "correct horse", Some(SecondFactor::Totp("000000")), "", "")
                .await,
            Err(AuthError::InvalidCode)
        ));

        let code = current_code(&secret, &f.clock);
        f.sudo
            .verify(f.user_id, "correct horse", Some(SecondFactor::Totp(&code)), "", "")
            .await?;

        let backup = SecondFactor::BackupCode(&backup_codes[0]);
        f.sudo
            .verify(f.user_id, "correct horse", Some(backup), "", "")
            .await?;
        assert!(matches!(
            f.sudo.verify(f.user_id, "correct horse", Some(backup), "", "").await,
            Err(AuthError::InvalidCode)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn extend_and_revoke() -> anyhow::Result<()> {
        let f = fixture().await;
        let grant = f
            .sudo
            .verify(f.user_id, "correct horse", None, "", "")
            .await?;

        f.clock.advance(Duration::minutes(10));
        let extended = f.sudo.extend_session(f.user_id, &grant.token).await?;
        assert_eq!(extended, f.clock.now() + Duration::minutes(15));

        f.clock.advance(Duration::minutes(10));
        assert!(f.sudo.validate_token(f.user_id, &grant.token).await?);

        assert!(f.sudo.revoke_token(f.user_id, &grant.token).await?);
        assert!(!f.sudo.validate_token(f.user_id, &grant.token).await?);
        assert!(matches!(
            f.sudo.extend_session(f.user_id, &grant.token).await,
            Err(AuthError::InvalidToken(_))
        ));

        f.sudo.verify(f.user_id, "correct horse", None, "", "").await?;
        f.sudo.verify(f.user_id, "correct horse", None, "", "").await?;
        assert_eq!(f.sudo.revoke_all(f.user_id).await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn verify_prunes_expired_grants() -> anyhow::Result<()> {
        let f = fixture().await;
        f.sudo.verify(f.user_id, "correct horse", None, "", "").await?;
        f.clock.advance(Duration::hours(1));
        f.sudo.verify(f.user_id, "correct horse", None, "", "").await?;
        assert_eq!(f.sudo.revoke_all(f.user_id).await?, 1);
        Ok(())
    }
}
