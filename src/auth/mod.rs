//! Login orchestration across the tracker, device checks, password
//! verification, second factor and session issuance.

#[cfg(test)]
mod tests;

use crate::audit::{SecurityAudit, SecurityEvent, SecurityEventType};
use crate::clock::SharedClock;
use crate::device::{BanStatus, DenyReason, DeviceReputation, DeviceVerdict, hash_fingerprint};
use crate::error::{AuthError, AuthResult};
use crate::login::LoginAttemptTracker;
use crate::password::{PasswordHasher, verify_password};
use crate::session::{SessionManager, TokenPair};
use crate::store::{DeviceFingerprint, User, UserStore};
use crate::totp::{SecondFactor, TotpService};
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const BRUTE_FORCE_REASON: &str = "too many failed login attempts";

#[derive(Debug)]
pub struct LoginRequest {
    pub email: String,
    pub password: SecretString,
    pub device_fingerprint: Option<String>,
    pub ip: String,
    pub user_agent: String,
}

impl LoginRequest {
    #[must_use]
    pub fn client(&self) -> Client<'_> {
        Client {
            ip: &self.ip,
            user_agent: &self.user_agent,
            device_fingerprint: self.device_fingerprint.as_deref(),
        }
    }
}

/// Where a request came from.
#[derive(Clone, Copy, Debug, Default)]
pub struct Client<'a> {
    pub ip: &'a str,
    pub user_agent: &'a str,
    pub device_fingerprint: Option<&'a str>,
}

impl Client<'_> {
    fn fingerprint_hash(&self) -> Option<String> {
        self.device_fingerprint
            .filter(|fp| !fp.is_empty())
            .map(|fp| hash_fingerprint([fp]))
    }
}

#[derive(Debug)]
pub enum LoginOutcome {
    Authenticated(TokenPair),
    /// Password accepted; present `pending_token` with a code to finish.
    TotpRequired { pending_token: String },
}

pub struct Authenticator {
    users: Arc<dyn UserStore>,
    sessions: Arc<SessionManager>,
    attempts: Arc<LoginAttemptTracker>,
    devices: Arc<dyn DeviceReputation>,
    totp: Arc<TotpService>,
    hasher: Arc<dyn PasswordHasher>,
    audit: Arc<dyn SecurityAudit>,
    clock: SharedClock,
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

impl Authenticator {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        users: Arc<dyn UserStore>,
        sessions: Arc<SessionManager>,
        attempts: Arc<LoginAttemptTracker>,
        devices: Arc<dyn DeviceReputation>,
        totp: Arc<TotpService>,
        hasher: Arc<dyn PasswordHasher>,
        audit: Arc<dyn SecurityAudit>,
        clock: SharedClock,
    ) -> Self {
        Self {
            users,
            sessions,
            attempts,
            devices,
            totp,
            hasher,
            audit,
            clock,
        }
    }

    async fn check_device(&self, client: Client<'_>) -> AuthResult<()> {
        let Some(raw) = client.device_fingerprint.filter(|fp| !fp.is_empty()) else {
            return Ok(());
        };
        if let BanStatus::Banned { message } = self.devices.check_admin_ban(raw).await {
            warn!(ip = client.ip, "login from banned device");
            return Err(AuthError::DeviceBlocked { reason: message });
        }
        if let DeviceVerdict::Denied(DenyReason::Blocked { reason }) =
            self.devices.is_device_blocked(&hash_fingerprint([raw])).await
        {
            warn!(ip = client.ip, "login from blocked device");
            return Err(AuthError::DeviceBlocked { reason });
        }
        Ok(())
    }

    async fn login_failed(&self, email: &str, user_id: Option<Uuid>, client: Client<'_>, reason: &str) {
        let mut event = SecurityEvent::new(SecurityEventType::LoginFailed)
            .email(email)
            .ip(client.ip)
            .user_agent(client.user_agent)
            .details(reason);
        if let Some(user_id) = user_id {
            event = event.user(user_id);
        }
        self.audit.record(event).await;
    }

    /// Password step of a login.
    ///
    /// # Errors
    /// `DeviceBlocked`, `AccountLocked` or `InvalidCredentials`; never
    /// reveals whether the email exists.
    pub async fn login(&self, request: LoginRequest) -> AuthResult<LoginOutcome> {
        let email = normalize_email(&request.email);
        let client = request.client();

        self.check_device(client).await?;

        if let Some(until) = self.attempts.locked_until(&email).await {
            self.audit
                .record(
                    SecurityEvent::new(SecurityEventType::LoginLocked)
                        .email(&email)
                        .ip(client.ip)
                        .user_agent(client.user_agent),
                )
                .await;
            return Err(AuthError::locked(until, self.clock.now(), BRUTE_FORCE_REASON));
        }

        let delay = self.attempts.delay_for(&email).await;
        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis(), "applying login backoff");
            tokio::time::sleep(delay).await;
        }

        let Some(user) = self.users.find_user_by_email(&email).await? else {
            self.attempts.record_failed_login(&email, client.ip).await;
            self.login_failed(&email, None, client, "unknown account").await;
            return Err(AuthError::InvalidCredentials);
        };

        self.sessions.ensure_unlocked(&user).await?;

        let password = request.password.expose_secret();
        if !verify_password(&self.hasher, password, &user.password_hash).await? {
            self.password_failed(&user, &email, client).await?;
            return Err(AuthError::InvalidCredentials);
        }

        self.attempts.reset_attempts(&email).await;

        if self.totp.is_enabled(user.id).await? {
            let pending_token = self.totp.create_pending_token(user.id).await?;
            debug!(user_id = %user.id, "password accepted, second factor pending");
            return Ok(LoginOutcome::TotpRequired { pending_token });
        }

        Ok(LoginOutcome::Authenticated(
            self.finish_login(&user, client).await?,
        ))
    }

    async fn password_failed(&self, user: &User, email: &str, client: Client<'_>) -> AuthResult<()> {
        let verdict = self.attempts.record_failed_login(email, client.ip).await;
        if let Err(err) = self.attempts.record_failed_attempt_db(user.id).await {
            warn!("Failed to record durable login failure: {err:#}");
        }
        self.login_failed(email, Some(user.id), client, "invalid password")
            .await;

        if verdict.should_lock {
            self.attempts.persist_lock(user.id, BRUTE_FORCE_REASON).await?;
            self.audit
                .record(
                    SecurityEvent::new(SecurityEventType::AccountLocked)
                        .user(user.id)
                        .email(email)
                        .ip(client.ip)
                        .details(BRUTE_FORCE_REASON),
                )
                .await;
            self.audit
                .record(
                    SecurityEvent::new(SecurityEventType::BruteForceDetected)
                        .user(user.id)
                        .email(email)
                        .ip(client.ip)
                        .details(format!("{} failed attempts", verdict.attempts)),
                )
                .await;
        }
        Ok(())
    }

    async fn finish_login(&self, user: &User, client: Client<'_>) -> AuthResult<TokenPair> {
        let pair = self
            .sessions
            .create_session(user, client.ip, client.user_agent)
            .await?;

        if let Some(hash) = client.fingerprint_hash() {
            if let Err(err) = self
                .devices
                .record_device_login(user.id, &hash, client.ip, client.user_agent)
                .await
            {
                warn!(user_id = %user.id, "Failed to record device login: {err:#}");
            }
        }
        if let Err(err) = self
            .attempts
            .record_successful_login(user.id, &user.email, client.ip)
            .await
        {
            warn!(user_id = %user.id, "Failed to record successful login: {err:#}");
        }

        info!(user_id = %user.id, ip = client.ip, "login succeeded");
        self.audit
            .record(
                SecurityEvent::new(SecurityEventType::LoginSuccess)
                    .user(user.id)
                    .email(&user.email)
                    .ip(client.ip)
                    .user_agent(client.user_agent)
                    .success(),
            )
            .await;
        Ok(pair)
    }

    /// Second-factor step with an authenticator app code.
    ///
    /// # Errors
    /// `InvalidToken`/`TokenExpired` for a bad pending token,
    /// `TotpInvalid` for a wrong code, `TotpMaxAttempts` once exhausted.
    pub async fn complete_totp_login(
        &self,
        pending_token: &str,
        code: &str,
        client: Client<'_>,
    ) -> AuthResult<TokenPair> {
        self.complete_login(pending_token, SecondFactor::Totp(code), client)
            .await
    }

    /// Second-factor step with a single-use backup code.
    ///
    /// # Errors
    /// Same as [`Self::complete_totp_login`].
    pub async fn complete_backup_code_login(
        &self,
        pending_token: &str,
        code: &str,
        client: Client<'_>,
    ) -> AuthResult<TokenPair> {
        self.complete_login(pending_token, SecondFactor::BackupCode(code), client)
            .await
    }

    async fn complete_login(
        &self,
        pending_token: &str,
        factor: SecondFactor<'_>,
        client: Client<'_>,
    ) -> AuthResult<TokenPair> {
        let pending = self.totp.validate_pending_token(pending_token).await?;
        let key = pending.user_id.to_string();

        if self.attempts.totp_attempts_remaining(&key).await == 0 {
            self.audit
                .record(
                    SecurityEvent::new(SecurityEventType::TotpMaxAttempts)
                        .user(pending.user_id)
                        .ip(client.ip)
                        .user_agent(client.user_agent)
                        .details("attempt after second factor lockout"),
                )
                .await;
            return Err(AuthError::TotpMaxAttempts);
        }

        let user = self
            .users
            .find_user(pending.user_id)
            .await?
            .ok_or(AuthError::InvalidToken("pending token owner not found"))?;
        if !self.totp.is_enabled(user.id).await? {
            return Err(AuthError::TotpNotEnabled);
        }
        self.sessions.ensure_unlocked(&user).await?;

        let verified = match factor {
            SecondFactor::Totp(code) => self.totp.verify(user.id, code).await?,
            SecondFactor::BackupCode(code) => {
                // The pending token is claimed before a backup code can be
                // spent and handed back when the code does not match.
                self.totp.consume_pending_token(&pending).await?;
                let used = self.totp.verify_backup_code(user.id, code).await?;
                if !used {
                    self.totp.release_pending_token(&pending).await?;
                }
                used
            }
        };
        if !verified {
            let attempts_remaining = self.attempts.record_totp_attempt(&key).await;
            self.audit
                .record(
                    SecurityEvent::new(SecurityEventType::TotpFailed)
                        .user(user.id)
                        .ip(client.ip)
                        .user_agent(client.user_agent)
                        .details(format!("{attempts_remaining} attempts remaining")),
                )
                .await;
            if attempts_remaining == 0 {
                self.audit
                    .record(
                        SecurityEvent::new(SecurityEventType::TotpMaxAttempts)
                            .user(user.id)
                            .ip(client.ip),
                    )
                    .await;
                return Err(AuthError::TotpMaxAttempts);
            }
            return Err(AuthError::TotpInvalid { attempts_remaining });
        }

        if let SecondFactor::Totp(_) = factor {
            self.totp.consume_pending_token(&pending).await?;
        }
        self.attempts.reset_totp_attempts(&key).await;
        self.audit
            .record(
                SecurityEvent::new(SecurityEventType::TotpSuccess)
                    .user(user.id)
                    .ip(client.ip)
                    .user_agent(client.user_agent)
                    .success(),
            )
            .await;

        self.finish_login(&user, client).await
    }

    /// Gate and count a new account on a device.
    ///
    /// # Errors
    /// `DeviceBlocked` when the admin ban check or the local block list
    /// rejects the device, `DeviceLimitReached` on a full device, `Internal` when the
    /// registration cannot be stored.
    pub async fn register_device(
        &self,
        user_id: Uuid,
        fingerprint: &str,
        ip: &str,
        user_agent: &str,
    ) -> AuthResult<Option<DeviceFingerprint>> {
        if fingerprint.is_empty() {
            return Ok(None);
        }
        if let BanStatus::Banned { message } = self.devices.check_admin_ban(fingerprint).await {
            warn!(%user_id, ip, "registration from banned device");
            return Err(AuthError::DeviceBlocked { reason: message });
        }
        let hash = hash_fingerprint([fingerprint]);
        match self.devices.can_register_account(&hash, ip, user_agent).await {
            DeviceVerdict::Denied(DenyReason::Blocked { reason }) => {
                return Err(AuthError::DeviceBlocked { reason });
            }
            DeviceVerdict::Denied(DenyReason::LimitReached { account_count }) => {
                self.audit
                    .record(
                        SecurityEvent::new(SecurityEventType::DeviceLimitReached)
                            .user(user_id)
                            .ip(ip)
                            .user_agent(user_agent)
                            .details(format!("{account_count} accounts on device")),
                    )
                    .await;
                return Err(AuthError::DeviceLimitReached {
                    count: account_count,
                });
            }
            DeviceVerdict::Allowed { .. } | DeviceVerdict::Unknown => {}
        }
        let device = self
            .devices
            .record_device_registration(user_id, &hash, ip, user_agent)
            .await?;
        Ok(Some(device))
    }
}
