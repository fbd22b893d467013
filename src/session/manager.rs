use super::access::{AccessTokenIssuer, Claims};
use super::anomaly::{self, REUSE_REVOKE_REASON, SessionSecurityStats};
use crate::audit::{SecurityAudit, SecurityEvent, SecurityEventType};
use crate::clock::SharedClock;
use crate::config::SessionConfig;
use crate::error::{AuthError, AuthResult, format_remaining};
use crate::login::LoginLockout;
use crate::store::{NewSession, Session, SessionLock, SessionStore, TotpStore, User, UserStore};
use crate::tokens::{generate_opaque_token, generate_token_family, hash_token, truncate_user_agent};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const LOCKED_BY_SYSTEM: &str = "system";
const SESSION_LIMIT_REASON: &str = "session limit exceeded";

#[derive(Clone, Debug, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub token_type: &'static str,
    #[serde(skip)]
    pub session_id: Uuid,
}

/// Issues and rotates token pairs, detects refresh-token reuse and owns the
/// session-level account lock.
pub struct SessionManager {
    config: SessionConfig,
    sessions: Arc<dyn SessionStore>,
    users: Arc<dyn UserStore>,
    totp: Arc<dyn TotpStore>,
    issuer: Arc<dyn AccessTokenIssuer>,
    lockout: Arc<dyn LoginLockout>,
    audit: Arc<dyn SecurityAudit>,
    clock: SharedClock,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        config: SessionConfig,
        sessions: Arc<dyn SessionStore>,
        users: Arc<dyn UserStore>,
        totp: Arc<dyn TotpStore>,
        issuer: Arc<dyn AccessTokenIssuer>,
        lockout: Arc<dyn LoginLockout>,
        audit: Arc<dyn SecurityAudit>,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            sessions,
            users,
            totp,
            issuer,
            lockout,
            audit,
            clock,
        }
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Reject users locked by either the user row, a session lock, or the
    /// login tracker.
    ///
    /// # Errors
    /// `AccountLocked` with the remaining time, or `Internal` on store failure.
    pub async fn ensure_unlocked(&self, user: &User) -> AuthResult<()> {
        let now = self.clock.now();
        if let Some(until) = user.locked_until.filter(|until| *until > now) {
            let reason = user
                .lock_reason
                .clone()
                .unwrap_or_else(|| "account locked".to_string());
            return Err(AuthError::locked(until, now, reason));
        }
        if let Some(lock) = self.sessions.active_lock(user.id, now).await? {
            return Err(AuthError::locked(lock.expires_at, now, lock.reason));
        }
        if let Some(until) = self.lockout.locked_until(&user.email).await {
            return Err(AuthError::locked(
                until,
                now,
                "too many failed login attempts",
            ));
        }
        Ok(())
    }

    /// Refresh only honors session locks. A brute-force lock on the login
    /// identifier is logged but does not cut off sessions already issued.
    async fn ensure_refresh_allowed(&self, user: &User, now: DateTime<Utc>) -> AuthResult<()> {
        if let Some(lock) = self.sessions.active_lock(user.id, now).await? {
            return Err(AuthError::locked(lock.expires_at, now, lock.reason));
        }
        if let Some(until) = self.lockout.locked_until(&user.email).await {
            warn!(user_id = %user.id, %until, "refresh while login attempts are locked");
        }
        Ok(())
    }

    async fn totp_enabled(&self, user_id: Uuid) -> Result<bool> {
        Ok(self
            .totp
            .totp_state(user_id)
            .await?
            .is_some_and(|state| state.is_active()))
    }

    fn access_token(
        &self,
        user: &User,
        totp_enabled: bool,
        session_id: Uuid,
        jti: String,
        now: DateTime<Utc>,
    ) -> Result<String> {
        self.issuer.issue(&Claims {
            sub: user.id,
            email: user.email.clone(),
            username: user.username.clone(),
            totp_enabled,
            sid: session_id,
            iat: now.timestamp(),
            exp: (now + self.config.access_token_ttl).timestamp(),
            jti,
        })
    }

    fn pair(&self, access_token: String, refresh_token: String, session_id: Uuid) -> TokenPair {
        TokenPair {
            access_token,
            refresh_token,
            expires_in: self.config.access_token_ttl.num_seconds(),
            token_type: "Bearer",
            session_id,
        }
    }

    fn new_session(
        &self,
        user_id: Uuid,
        refresh_token: &str,
        token_family: String,
        ip: &str,
        user_agent: &str,
        now: DateTime<Utc>,
    ) -> NewSession {
        NewSession {
            id: Uuid::now_v7(),
            user_id,
            refresh_token_hash: hash_token(refresh_token),
            access_token_id: Uuid::new_v4().to_string(),
            ip_address: ip.to_string(),
            user_agent: truncate_user_agent(user_agent, self.config.user_agent_max_len),
            token_family,
            created_at: now,
            expires_at: now + self.config.refresh_token_ttl,
        }
    }

    /// Revoke least recently used sessions so one more fits under the cap.
    async fn enforce_session_cap(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let live = self.sessions.live_sessions(user_id, now).await?;
        let keep = self.config.max_concurrent_sessions.saturating_sub(1);
        for session in live.iter().skip(keep) {
            if self
                .sessions
                .revoke_session(session.id, SESSION_LIMIT_REASON, now)
                .await?
            {
                debug!(user_id = %user_id, session_id = %session.id, "evicted session over limit");
            }
        }
        Ok(())
    }

    /// Start a new token family for a freshly authenticated user.
    ///
    /// # Errors
    /// `AccountLocked` when any lock is active, `Internal` on store failure.
    pub async fn create_session(
        &self,
        user: &User,
        ip: &str,
        user_agent: &str,
    ) -> AuthResult<TokenPair> {
        self.ensure_unlocked(user).await?;
        let now = self.clock.now();
        self.enforce_session_cap(user.id, now).await?;

        let refresh_token = generate_opaque_token()?;
        let child = self.new_session(
            user.id,
            &refresh_token,
            generate_token_family()?,
            ip,
            user_agent,
            now,
        );
        let session = self
            .sessions
            .insert_session(child)
            .await
            .context("Failed to create session")?;

        let totp_enabled = self.totp_enabled(user.id).await?;
        let access = self.access_token(
            user,
            totp_enabled,
            session.id,
            session.access_token_id.clone(),
            now,
        )?;

        info!(user_id = %user.id, session_id = %session.id, ip, "session created");
        self.audit
            .record(
                SecurityEvent::new(SecurityEventType::SessionCreated)
                    .user(user.id)
                    .email(&user.email)
                    .ip(ip)
                    .user_agent(user_agent)
                    .success(),
            )
            .await;
        Ok(self.pair(access, refresh_token, session.id))
    }

    /// Rotate a refresh token.
    ///
    /// A consumed token presented again within the grace period gets a new
    /// access token and keeps its refresh token. Past the grace period the
    /// whole family is revoked and the account locked.
    ///
    /// # Errors
    /// `InvalidToken` for unknown, expired, revoked or concurrently consumed
    /// tokens; `AccountLocked` on reuse or an active lock.
    pub async fn refresh_session(
        &self,
        refresh_token: &str,
        ip: &str,
        user_agent: &str,
    ) -> AuthResult<TokenPair> {
        let now = self.clock.now();
        let session = self
            .sessions
            .find_session_by_refresh_hash(&hash_token(refresh_token))
            .await?
            .ok_or(AuthError::InvalidToken("refresh token not found"))?;
        if session.is_revoked() {
            return Err(AuthError::InvalidToken("session revoked"));
        }
        if session.is_expired(now) {
            return Err(AuthError::InvalidToken("session expired"));
        }

        if session.is_used {
            return self
                .replay_used(&session, refresh_token, ip, user_agent, now)
                .await;
        }

        let user = self
            .users
            .find_user(session.user_id)
            .await?
            .ok_or(AuthError::InvalidToken("session owner not found"))?;
        self.ensure_refresh_allowed(&user, now).await?;

        if session.ip_address != ip {
            warn!(
                user_id = %user.id,
                previous_ip = %session.ip_address,
                ip,
                "refresh from a different IP"
            );
        }
        if session.user_agent != truncate_user_agent(user_agent, self.config.user_agent_max_len) {
            warn!(user_id = %user.id, "refresh from a different user agent");
        }

        let new_refresh = generate_opaque_token()?;
        let child = self.new_session(
            user.id,
            &new_refresh,
            session.token_family.clone(),
            ip,
            user_agent,
            now,
        );
        let Some(child) = self
            .sessions
            .consume_and_rotate(session.id, now, child)
            .await?
        else {
            warn!(user_id = %user.id, session_id = %session.id, "lost refresh race");
            return Err(AuthError::InvalidToken("refresh token already used"));
        };

        let totp_enabled = self.totp_enabled(user.id).await?;
        let access = self.access_token(
            &user,
            totp_enabled,
            child.id,
            child.access_token_id.clone(),
            now,
        )?;

        self.audit
            .record(
                SecurityEvent::new(SecurityEventType::SessionRefreshed)
                    .user(user.id)
                    .ip(ip)
                    .user_agent(user_agent)
                    .success(),
            )
            .await;
        self.check_ip_rotation(user.id, ip, user_agent, now).await;

        Ok(self.pair(access, new_refresh, child.id))
    }

    async fn replay_used(
        &self,
        session: &Session,
        refresh_token: &str,
        ip: &str,
        user_agent: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<TokenPair> {
        let elapsed = now - session.last_used_at;
        if elapsed <= self.config.reuse_grace {
            let user = self
                .users
                .find_user(session.user_id)
                .await?
                .ok_or(AuthError::InvalidToken("session owner not found"))?;
            self.ensure_refresh_allowed(&user, now).await?;

            // Point the access token at the newest rotation of the family.
            let current = self
                .sessions
                .latest_unused_in_family(&session.token_family, now)
                .await?
                .map_or(session.id, |latest| latest.id);
            let totp_enabled = self.totp_enabled(user.id).await?;
            let access = self.access_token(
                &user,
                totp_enabled,
                current,
                Uuid::new_v4().to_string(),
                now,
            )?;
            debug!(
                user_id = %user.id,
                elapsed_ms = elapsed.num_milliseconds(),
                "refresh replay within grace period"
            );
            return Ok(self.pair(access, refresh_token.to_string(), current));
        }

        error!(
            user_id = %session.user_id,
            session_id = %session.id,
            token_family = %session.token_family,
            elapsed_secs = elapsed.num_seconds(),
            "refresh token reuse detected"
        );
        let revoked = self
            .sessions
            .revoke_family(&session.token_family, REUSE_REVOKE_REASON, now)
            .await
            .context("Failed to revoke token family")?;
        let until = self.lock_account(session.user_id, REUSE_REVOKE_REASON).await?;

        self.audit
            .record(
                SecurityEvent::new(SecurityEventType::TokenReuseDetected)
                    .user(session.user_id)
                    .ip(ip)
                    .user_agent(user_agent)
                    .details(format!(
                        "refresh token reuse in family {}, {revoked} sessions revoked",
                        session.token_family
                    )),
            )
            .await;
        self.audit
            .record(
                SecurityEvent::new(SecurityEventType::AccountLocked)
                    .user(session.user_id)
                    .ip(ip)
                    .details(format!(
                        "{REUSE_REVOKE_REASON} (locked for {})",
                        format_remaining(self.config.theft_lock)
                    )),
            )
            .await;

        Err(AuthError::locked(until, now, REUSE_REVOKE_REASON))
    }

    async fn check_ip_rotation(&self, user_id: Uuid, ip: &str, user_agent: &str, now: DateTime<Utc>) {
        let since = now - self.config.ip_rotation_window;
        match self.sessions.sessions_created_since(user_id, since).await {
            Ok(recent) => {
                let ips = anomaly::distinct_ips(&recent);
                if ips >= self.config.ip_rotation_threshold {
                    warn!(user_id = %user_id, distinct_ips = ips, "suspicious IP rotation");
                    self.audit
                        .record(
                            SecurityEvent::new(SecurityEventType::IpRotation)
                                .user(user_id)
                                .ip(ip)
                                .user_agent(user_agent)
                                .details(format!("{ips} distinct IPs within the rotation window")),
                        )
                        .await;
                }
            }
            Err(err) => warn!("IP rotation check failed: {err:#}"),
        }
    }

    /// Revoke one session. Already revoked sessions are left alone.
    ///
    /// # Errors
    /// Returns an error if the store update fails.
    pub async fn revoke_session(&self, session_id: Uuid, reason: &str) -> Result<bool> {
        let Some(session) = self.sessions.find_session(session_id).await? else {
            return Ok(false);
        };
        let revoked = self
            .sessions
            .revoke_session(session_id, reason, self.clock.now())
            .await?;
        if revoked {
            self.audit
                .record(
                    SecurityEvent::new(SecurityEventType::SessionRevoked)
                        .user(session.user_id)
                        .success()
                        .details(reason),
                )
                .await;
        }
        Ok(revoked)
    }

    /// # Errors
    /// Returns an error if the store lookup or update fails.
    pub async fn revoke_session_by_refresh_token(
        &self,
        refresh_token: &str,
        reason: &str,
    ) -> Result<bool> {
        match self
            .sessions
            .find_session_by_refresh_hash(&hash_token(refresh_token))
            .await?
        {
            Some(session) => self.revoke_session(session.id, reason).await,
            None => Ok(false),
        }
    }

    /// # Errors
    /// Returns an error if the store update fails.
    pub async fn revoke_all_user_sessions(&self, user_id: Uuid, reason: &str) -> Result<u64> {
        let revoked = self
            .sessions
            .revoke_user_sessions(user_id, reason, self.clock.now())
            .await?;
        if revoked > 0 {
            self.audit
                .record(
                    SecurityEvent::new(SecurityEventType::SessionRevoked)
                        .user(user_id)
                        .success()
                        .details(format!("{revoked} sessions revoked: {reason}")),
                )
                .await;
        }
        Ok(revoked)
    }

    /// # Errors
    /// Returns an error if the store update fails.
    pub async fn revoke_token_family(&self, token_family: &str, reason: &str) -> Result<u64> {
        self.sessions
            .revoke_family(token_family, reason, self.clock.now())
            .await
    }

    /// Lock the account at the session layer and revoke every session.
    ///
    /// # Errors
    /// Returns an error if either store write fails.
    pub async fn lock_account(&self, user_id: Uuid, reason: &str) -> Result<DateTime<Utc>> {
        let now = self.clock.now();
        let until = now + self.config.theft_lock;
        self.sessions
            .insert_lock(SessionLock {
                id: Uuid::now_v7(),
                user_id,
                reason: reason.to_string(),
                locked_by: LOCKED_BY_SYSTEM.to_string(),
                locked_at: now,
                expires_at: until,
            })
            .await
            .context("Failed to insert session lock")?;
        let revoked = self
            .sessions
            .revoke_user_sessions(user_id, &format!("Account locked: {reason}"), now)
            .await
            .context("Failed to revoke sessions of locked account")?;
        warn!(user_id = %user_id, revoked, %until, "account locked: {reason}");
        Ok(until)
    }

    /// Verify an access token against the signing key, the clock and the
    /// state of its session.
    ///
    /// # Errors
    /// `InvalidToken` for forged tokens or dead sessions, `TokenExpired`.
    pub async fn validate_access_token(&self, token: &str) -> AuthResult<Claims> {
        let claims = self
            .issuer
            .decode(token)
            .map_err(|_| AuthError::InvalidToken("malformed access token"))?;
        if claims.exp <= self.clock.now().timestamp() {
            return Err(AuthError::TokenExpired);
        }
        match self.sessions.find_session(claims.sid).await? {
            Some(session) if !session.is_revoked() => Ok(claims),
            _ => Err(AuthError::InvalidToken("session revoked")),
        }
    }

    /// Live sessions, newest first.
    ///
    /// # Errors
    /// Returns an error if the store query fails.
    pub async fn active_sessions(&self, user_id: Uuid) -> Result<Vec<Session>> {
        let mut sessions = self
            .sessions
            .live_sessions(user_id, self.clock.now())
            .await?;
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    /// # Errors
    /// Returns an error if the store query fails.
    pub async fn active_session_count(&self, user_id: Uuid) -> Result<usize> {
        Ok(self
            .sessions
            .live_sessions(user_id, self.clock.now())
            .await?
            .len())
    }

    /// # Errors
    /// Returns an error if the store delete fails.
    pub async fn cleanup_expired_sessions(&self) -> Result<u64> {
        let deleted = self
            .sessions
            .delete_expired_sessions(self.clock.now())
            .await?;
        if deleted > 0 {
            info!(deleted, "expired sessions removed");
        }
        Ok(deleted)
    }

    /// # Errors
    /// Returns an error if the store queries fail.
    pub async fn detect_session_anomaly(&self, user_id: Uuid) -> Result<Option<String>> {
        let now = self.clock.now();
        let created = self
            .sessions
            .sessions_created_since(user_id, now - Duration::hours(1))
            .await?;
        let revoked = self
            .sessions
            .sessions_revoked_since(user_id, now - Duration::hours(24))
            .await?;
        Ok(anomaly::detect(
            &created,
            &revoked,
            self.config.ip_rotation_threshold,
        ))
    }

    /// # Errors
    /// Returns an error if the store queries fail.
    pub async fn security_stats(&self, user_id: Uuid) -> Result<SessionSecurityStats> {
        let now = self.clock.now();
        let month_ago = now - Duration::days(30);
        let recent = self
            .sessions
            .sessions_created_since(user_id, month_ago)
            .await?;
        let revoked = self
            .sessions
            .sessions_revoked_since(user_id, month_ago)
            .await?;
        Ok(SessionSecurityStats {
            active_sessions: self.active_session_count(user_id).await?,
            sessions_last_30_days: recent.len(),
            revoked_last_30_days: revoked.len(),
            unique_ips_last_30_days: anomaly::distinct_ips(&recent),
            anomaly: self.detect_session_anomaly(user_id).await?,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::clock::ManualClock;
    use crate::config::LoginConfig;
    use crate::login::LoginAttemptTracker;
    use crate::session::JwtIssuer;
    use crate::store::{AuditStore, MemoryStore};
    use secrecy::SecretString;
    use std::collections::HashSet;

    const IP: &str = "203.0.113.7";
    const UA: &str = "Mozilla/5.0 (X11; Linux x86_64)";

    struct Fixture {
        manager: Arc<SessionManager>,
        tracker: Arc<LoginAttemptTracker>,
        store: Arc<MemoryStore>,
        clock: ManualClock,
        user: User,
    }

    async fn fixture(config: SessionConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::default();
        let shared: SharedClock = Arc::new(clock.clone());
        let user = User::new("alice@example.com", "unused".to_string());
        store.insert_user(user.clone()).await;
        let tracker = Arc::new(LoginAttemptTracker::new(
            LoginConfig::default().with_lock_threshold(2),
            store.clone(),
            shared.clone(),
        ));
        let manager = Arc::new(SessionManager::new(
            config,
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(JwtIssuer::new(&SecretString::from("session-manager-test-key"))),
            tracker.clone(),
            Arc::new(AuditLog::new(store.clone(), shared.clone())),
            shared,
        ));
        Fixture {
            manager,
            tracker,
            store,
            clock,
            user,
        }
    }

    async fn event_types(f: &Fixture) -> Vec<SecurityEventType> {
        f.store
            .recent_events(f.user.id, 100)
            .await
            .unwrap()
            .into_iter()
            .map(|event| event.event_type)
            .collect()
    }

    #[tokio::test]
    async fn refresh_rotates_within_family() -> anyhow::Result<()> {
        let f = fixture(SessionConfig::default()).await;
        let first = f.manager.create_session(&f.user, IP, UA).await?;
        assert_eq!(first.token_type, "Bearer");
        assert_eq!(first.expires_in, 300);

        f.clock.advance(Duration::minutes(1));
        let second = f.manager.refresh_session(&first.refresh_token, IP, UA).await?;
        assert_ne!(second.refresh_token, first.refresh_token);
        assert_ne!(second.session_id, first.session_id);

        let parent = f.store.sessions_for_user(f.user.id).await;
        assert_eq!(parent.len(), 2);
        assert_eq!(
            parent[0].token_family, parent[1].token_family,
            "rotation must stay in the family"
        );

        f.clock.advance(Duration::minutes(1));
        let third = f.manager.refresh_session(&second.refresh_token, IP, UA).await?;
        assert_eq!(f.manager.active_session_count(f.user.id).await?, 1);
        assert_eq!(f.manager.active_sessions(f.user.id).await?[0].id, third.session_id);
        Ok(())
    }

    #[tokio::test]
    async fn replay_within_grace_keeps_refresh_token() -> anyhow::Result<()> {
        let f = fixture(SessionConfig::default()).await;
        let pair = f.manager.create_session(&f.user, IP, UA).await?;
        let rotated = f.manager.refresh_session(&pair.refresh_token, IP, UA).await?;

        f.clock.advance(Duration::seconds(10));
        let replay = f.manager.refresh_session(&pair.refresh_token, IP, UA).await?;
        assert_eq!(replay.refresh_token, pair.refresh_token);
        assert_eq!(replay.session_id, rotated.session_id);

        let claims = f.manager.validate_access_token(&replay.access_token).await?;
        assert_eq!(claims.sid, rotated.session_id);
        assert_eq!(f.store.sessions_for_user(f.user.id).await.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn replay_after_grace_revokes_family_and_locks() -> anyhow::Result<()> {
        let f = fixture(SessionConfig::default()).await;
        let pair = f.manager.create_session(&f.user, IP, UA).await?;
        let rotated = f.manager.refresh_session(&pair.refresh_token, IP, UA).await?;

        f.clock.advance(Duration::seconds(31));
        match f.manager.refresh_session(&pair.refresh_token, "198.51.100.1", UA).await {
            Err(AuthError::AccountLocked { remaining, reason, .. }) => {
                assert_eq!(remaining, Duration::days(7));
                assert_eq!(reason, REUSE_REVOKE_REASON);
            }
            other => panic!("expected lock, got {other:?}"),
        }

        assert!(matches!(
            f.manager.refresh_session(&rotated.refresh_token, IP, UA).await,
            Err(AuthError::InvalidToken(_))
        ));
        assert!(matches!(
            f.manager.create_session(&f.user, IP, UA).await,
            Err(AuthError::AccountLocked { .. })
        ));
        assert_eq!(f.manager.active_session_count(f.user.id).await?, 0);
        assert!(event_types(&f).await.contains(&SecurityEventType::TokenReuseDetected));

        let stats = f.manager.security_stats(f.user.id).await?;
        assert!(stats.anomaly.is_some());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_refreshes_rotate_once() -> anyhow::Result<()> {
        let f = fixture(SessionConfig::default()).await;
        let pair = f.manager.create_session(&f.user, IP, UA).await?;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = f.manager.clone();
            let token = pair.refresh_token.clone();
            handles.push(tokio::spawn(async move {
                manager.refresh_session(&token, IP, UA).await
            }));
        }

        let mut rotated = HashSet::new();
        for handle in handles {
            match handle.await? {
                Ok(next) if next.refresh_token != pair.refresh_token => {
                    rotated.insert(next.refresh_token);
                }
                Ok(_) | Err(AuthError::InvalidToken(_)) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(rotated.len(), 1);
        assert_eq!(f.store.sessions_for_user(f.user.id).await.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn session_cap_evicts_least_recently_used() -> anyhow::Result<()> {
        let f = fixture(SessionConfig::default().with_max_concurrent_sessions(2)).await;
        let oldest = f.manager.create_session(&f.user, IP, UA).await?;
        f.clock.advance(Duration::seconds(1));
        f.manager.create_session(&f.user, IP, UA).await?;
        f.clock.advance(Duration::seconds(1));
        f.manager.create_session(&f.user, IP, UA).await?;

        assert_eq!(f.manager.active_session_count(f.user.id).await?, 2);
        let evicted = f
            .store
            .find_session(oldest.session_id)
            .await?
            .unwrap();
        assert_eq!(evicted.revoke_reason.as_deref(), Some(SESSION_LIMIT_REASON));
        Ok(())
    }

    #[tokio::test]
    async fn access_token_follows_clock_and_session() -> anyhow::Result<()> {
        let f = fixture(SessionConfig::default()).await;
        let pair = f.manager.create_session(&f.user, IP, UA).await?;

        let claims = f.manager.validate_access_token(&pair.access_token).await?;
        assert_eq!(claims.sub, f.user.id);
        assert!(!claims.totp_enabled);

        f.clock.advance(Duration::minutes(6));
        assert!(matches!(
            f.manager.validate_access_token(&pair.access_token).await,
            Err(AuthError::TokenExpired)
        ));

        let fresh = f.manager.create_session(&f.user, IP, UA).await?;
        assert!(f.manager.revoke_session(fresh.session_id, "logout").await?);
        assert!(!f.manager.revoke_session(fresh.session_id, "logout").await?);
        assert!(matches!(
            f.manager.validate_access_token(&fresh.access_token).await,
            Err(AuthError::InvalidToken(_))
        ));
        assert!(matches!(
            f.manager.validate_access_token("garbage").await,
            Err(AuthError::InvalidToken(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn expired_or_unknown_refresh_tokens_are_rejected() -> anyhow::Result<()> {
        let f = fixture(SessionConfig::default()).await;
        let pair = f.manager.create_session(&f.user, IP, UA).await?;

        assert!(matches!(
            f.manager.refresh_session("nope", IP, UA).await,
            Err(AuthError::InvalidToken(_))
        ));

        f.clock.advance(Duration::days(8));
        assert!(matches!(
            f.manager.refresh_session(&pair.refresh_token, IP, UA).await,
            Err(AuthError::InvalidToken("session expired"))
        ));
        assert_eq!(f.manager.cleanup_expired_sessions().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn login_lockout_blocks_new_sessions() -> anyhow::Result<()> {
        let f = fixture(SessionConfig::default()).await;
        f.tracker.record_failed_login(&f.user.email, IP).await;
        f.tracker.record_failed_login(&f.user.email, IP).await;

        assert!(matches!(
            f.manager.create_session(&f.user, IP, UA).await,
            Err(AuthError::AccountLocked { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn login_lockout_does_not_cut_off_refresh() -> anyhow::Result<()> {
        let f = fixture(SessionConfig::default()).await;
        let pair = f.manager.create_session(&f.user, IP, UA).await?;
        f.tracker.record_failed_login(&f.user.email, IP).await;
        f.tracker.record_failed_login(&f.user.email, IP).await;
        assert!(f.tracker.is_locked(&f.user.email).await);

        let rotated = f.manager.refresh_session(&pair.refresh_token, IP, UA).await?;
        let replay = f.manager.refresh_session(&pair.refresh_token, IP, UA).await?;
        assert_eq!(replay.refresh_token, pair.refresh_token);

        f.manager.lock_account(f.user.id, "admin action").await?;
        assert!(matches!(
            f.manager.refresh_session(&rotated.refresh_token, IP, UA).await,
            Err(AuthError::AccountLocked { .. }) | Err(AuthError::InvalidToken(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn revoke_by_refresh_token_and_all() -> anyhow::Result<()> {
        let f = fixture(SessionConfig::default()).await;
        let a = f.manager.create_session(&f.user, IP, UA).await?;
        f.manager.create_session(&f.user, IP, UA).await?;
        f.manager.create_session(&f.user, IP, UA).await?;

        assert!(f.manager.revoke_session_by_refresh_token(&a.refresh_token, "logout").await?);
        assert!(!f.manager.revoke_session_by_refresh_token("unknown", "logout").await?);
        assert_eq!(f.manager.revoke_all_user_sessions(f.user.id, "password changed").await?, 2);
        assert_eq!(f.manager.active_session_count(f.user.id).await?, 0);
        assert!(event_types(&f).await.contains(&SecurityEventType::SessionRevoked));
        Ok(())
    }

    #[tokio::test]
    async fn family_revoke_leaves_other_logins_alone() -> anyhow::Result<()> {
        let f = fixture(SessionConfig::default()).await;
        let phone = f.manager.create_session(&f.user, IP, UA).await?;
        let laptop = f.manager.create_session(&f.user, IP, UA).await?;
        f.manager.refresh_session(&phone.refresh_token, IP, UA).await?;

        let family = f
            .store
            .sessions_for_user(f.user.id)
            .await
            .into_iter()
            .find(|s| s.id == phone.session_id)
            .map(|s| s.token_family)
            .unwrap();
        assert_eq!(f.manager.revoke_token_family(&family, "lost phone").await?, 2);

        let live = f.manager.active_sessions(f.user.id).await?;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, laptop.session_id);
        Ok(())
    }

    #[tokio::test]
    async fn ip_rotation_is_audited() -> anyhow::Result<()> {
        let f = fixture(SessionConfig::default().with_ip_rotation(Duration::hours(1), 2)).await;
        let pair = f.manager.create_session(&f.user, "10.0.0.1", UA).await?;
        f.manager.refresh_session(&pair.refresh_token, "10.0.0.2", UA).await?;

        assert!(event_types(&f).await.contains(&SecurityEventType::IpRotation));
        Ok(())
    }
}
