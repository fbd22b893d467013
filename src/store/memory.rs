//! In-process backend. One mutex guards all state, which makes every
//! conditional update trivially atomic.

use super::legacy;
use super::models::{
    BackupCode, DeviceFingerprint, DeviceSighting, DeviceUserMapping, NewSession, PendingToken,
    Session, SessionLock, SudoSession, TotpState, User,
};
use super::{AuditStore, DeviceStore, SessionStore, SudoStore, TotpStore, UserStore};
use crate::audit::SecurityEvent;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct State {
    users: HashMap<Uuid, User>,
    sessions: Vec<Session>,
    locks: Vec<SessionLock>,
    devices: HashMap<String, DeviceFingerprint>,
    mappings: Vec<DeviceUserMapping>,
    totp: HashMap<Uuid, TotpState>,
    backup_codes: Vec<BackupCode>,
    pending: Vec<PendingToken>,
    sudo: Vec<SudoSession>,
    events: Vec<SecurityEvent>,
}

impl State {
    fn upsert_device(&mut self, sighting: &DeviceSighting<'_>) -> bool {
        let is_new_mapping = !self.mappings.iter().any(|m| {
            m.fingerprint_hash == sighting.fingerprint_hash && m.user_id == sighting.user_id
        });
        if is_new_mapping {
            self.mappings.push(DeviceUserMapping {
                fingerprint_hash: sighting.fingerprint_hash.to_string(),
                user_id: sighting.user_id,
                first_seen_at: sighting.at,
                last_seen_at: sighting.at,
            });
        } else {
            for mapping in self.mappings.iter_mut().filter(|m| {
                m.fingerprint_hash == sighting.fingerprint_hash && m.user_id == sighting.user_id
            }) {
                mapping.last_seen_at = sighting.at;
            }
        }

        let device = self
            .devices
            .entry(sighting.fingerprint_hash.to_string())
            .or_insert_with(|| DeviceFingerprint {
                fingerprint_hash: sighting.fingerprint_hash.to_string(),
                first_ip: sighting.ip.to_string(),
                first_user_agent: sighting.user_agent.to_string(),
                account_count: 0,
                blocked: false,
                block_reason: None,
                first_seen_at: sighting.at,
                last_seen_at: sighting.at,
            });
        device.last_seen_at = sighting.at;
        if is_new_mapping {
            device.account_count += 1;
        }
        is_new_mapping
    }

    fn mapping_count(&self, fingerprint_hash: &str) -> i64 {
        let count = self
            .mappings
            .iter()
            .filter(|m| m.fingerprint_hash == fingerprint_hash)
            .count();
        i64::try_from(count).unwrap_or(i64::MAX)
    }

    fn device(&self, fingerprint_hash: &str) -> Result<DeviceFingerprint> {
        self.devices
            .get(fingerprint_hash)
            .cloned()
            .ok_or_else(|| anyhow!("device {fingerprint_hash} vanished"))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_user(&self, user: User) {
        self.state.lock().await.users.insert(user.id, user);
    }

    pub async fn user(&self, user_id: Uuid) -> Option<User> {
        self.state.lock().await.users.get(&user_id).cloned()
    }

    pub async fn sessions_for_user(&self, user_id: Uuid) -> Vec<Session> {
        self.state
            .lock()
            .await
            .sessions
            .iter()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Insert a raw backup code row, bypassing the enable flow.
    pub async fn put_backup_code(&self, code: BackupCode) {
        self.state.lock().await.backup_codes.push(code);
    }

    pub async fn event_count(&self) -> usize {
        self.state.lock().await.events.len()
    }

    pub async fn mapping_count(&self, fingerprint_hash: &str) -> i64 {
        self.state.lock().await.mapping_count(fingerprint_hash)
    }

    /// Overwrite a device row, e.g. to simulate counter drift.
    pub async fn put_device(&self, device: DeviceFingerprint) {
        self.state
            .lock()
            .await
            .devices
            .insert(device.fingerprint_hash.clone(), device);
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>> {
        Ok(self.state.lock().await.users.get(&user_id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(self
            .state
            .lock()
            .await
            .users
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn lock_user(
        &self,
        user_id: Uuid,
        until: DateTime<Utc>,
        reason: &str,
        failed_attempts: i32,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| anyhow!("user {user_id} not found"))?;
        user.locked_until = Some(until);
        user.lock_reason = Some(reason.to_string());
        user.failed_login_attempts = failed_attempts;
        Ok(())
    }

    async fn record_failed_login(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(user) = state.users.get_mut(&user_id) {
            user.failed_login_attempts += 1;
            user.last_failed_login_at = Some(at);
        }
        Ok(())
    }

    async fn record_successful_login(
        &self,
        user_id: Uuid,
        ip: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(user) = state.users.get_mut(&user_id) {
            user.failed_login_attempts = 0;
            user.locked_until = None;
            user.lock_reason = None;
            user.last_login_at = Some(at);
            user.last_login_ip = Some(ip.to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert_session(&self, session: NewSession) -> Result<Session> {
        let session = session.into_session();
        self.state.lock().await.sessions.push(session.clone());
        Ok(session)
    }

    async fn find_session(&self, session_id: Uuid) -> Result<Option<Session>> {
        Ok(self
            .state
            .lock()
            .await
            .sessions
            .iter()
            .find(|s| s.id == session_id)
            .cloned())
    }

    async fn find_session_by_refresh_hash(
        &self,
        refresh_token_hash: &str,
    ) -> Result<Option<Session>> {
        Ok(self
            .state
            .lock()
            .await
            .sessions
            .iter()
            .find(|s| s.refresh_token_hash == refresh_token_hash)
            .cloned())
    }

    async fn consume_and_rotate(
        &self,
        session_id: Uuid,
        used_at: DateTime<Utc>,
        child: NewSession,
    ) -> Result<Option<Session>> {
        let mut state = self.state.lock().await;
        let Some(parent) = state
            .sessions
            .iter_mut()
            .find(|s| s.id == session_id && !s.is_used && s.revoked_at.is_none())
        else {
            return Ok(None);
        };
        parent.is_used = true;
        parent.last_used_at = used_at;

        let child = child.into_session();
        state.sessions.push(child.clone());
        Ok(Some(child))
    }

    async fn latest_unused_in_family(
        &self,
        token_family: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        Ok(self
            .state
            .lock()
            .await
            .sessions
            .iter()
            .filter(|s| s.token_family == token_family && !s.is_used && s.is_live(now))
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn live_sessions(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self
            .state
            .lock()
            .await
            .sessions
            .iter()
            .filter(|s| s.user_id == user_id && !s.is_used && s.is_live(now))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.last_used_at.cmp(&a.last_used_at));
        Ok(sessions)
    }

    async fn sessions_created_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        Ok(self
            .state
            .lock()
            .await
            .sessions
            .iter()
            .filter(|s| s.user_id == user_id && s.created_at > since)
            .cloned()
            .collect())
    }

    async fn sessions_revoked_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        Ok(self
            .state
            .lock()
            .await
            .sessions
            .iter()
            .filter(|s| s.user_id == user_id && s.revoked_at.is_some_and(|at| at > since))
            .cloned()
            .collect())
    }

    async fn revoke_session(
        &self,
        session_id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state
            .sessions
            .iter_mut()
            .find(|s| s.id == session_id && s.revoked_at.is_none())
        {
            Some(session) => {
                session.revoked_at = Some(at);
                session.revoke_reason = Some(reason.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn revoke_user_sessions(
        &self,
        user_id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut revoked = 0;
        for session in state
            .sessions
            .iter_mut()
            .filter(|s| s.user_id == user_id && s.revoked_at.is_none())
        {
            session.revoked_at = Some(at);
            session.revoke_reason = Some(reason.to_string());
            revoked += 1;
        }
        Ok(revoked)
    }

    async fn revoke_family(
        &self,
        token_family: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut revoked = 0;
        for session in state
            .sessions
            .iter_mut()
            .filter(|s| s.token_family == token_family && s.revoked_at.is_none())
        {
            session.revoked_at = Some(at);
            session.revoke_reason = Some(reason.to_string());
            revoked += 1;
        }
        Ok(revoked)
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.sessions.len();
        state.sessions.retain(|s| !s.is_expired(now));
        Ok(u64::try_from(before - state.sessions.len()).unwrap_or(u64::MAX))
    }

    async fn insert_lock(&self, lock: SessionLock) -> Result<()> {
        self.state.lock().await.locks.push(lock);
        Ok(())
    }

    async fn active_lock(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<Option<SessionLock>> {
        Ok(self
            .state
            .lock()
            .await
            .locks
            .iter()
            .filter(|l| l.user_id == user_id && l.expires_at > now)
            .max_by_key(|l| l.locked_at)
            .cloned())
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn find_device(&self, fingerprint_hash: &str) -> Result<Option<DeviceFingerprint>> {
        Ok(self.state.lock().await.devices.get(fingerprint_hash).cloned())
    }

    async fn record_registration(&self, sighting: DeviceSighting<'_>) -> Result<DeviceFingerprint> {
        let mut state = self.state.lock().await;
        state.upsert_device(&sighting);
        state.device(sighting.fingerprint_hash)
    }

    async fn record_login(&self, sighting: DeviceSighting<'_>) -> Result<DeviceFingerprint> {
        let mut state = self.state.lock().await;
        state.upsert_device(&sighting);
        let count = state.mapping_count(sighting.fingerprint_hash);
        if let Some(device) = state.devices.get_mut(sighting.fingerprint_hash) {
            device.account_count = count;
        }
        state.device(sighting.fingerprint_hash)
    }

    async fn block_device(
        &self,
        fingerprint_hash: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<DeviceFingerprint> {
        let mut state = self.state.lock().await;
        let device = state
            .devices
            .entry(fingerprint_hash.to_string())
            .or_insert_with(|| DeviceFingerprint {
                fingerprint_hash: fingerprint_hash.to_string(),
                first_ip: String::new(),
                first_user_agent: String::new(),
                account_count: 0,
                blocked: false,
                block_reason: None,
                first_seen_at: at,
                last_seen_at: at,
            });
        device.blocked = true;
        device.block_reason = Some(reason.to_string());
        Ok(device.clone())
    }

    async fn devices_for_user(&self, user_id: Uuid) -> Result<Vec<DeviceFingerprint>> {
        let state = self.state.lock().await;
        Ok(state
            .mappings
            .iter()
            .filter(|m| m.user_id == user_id)
            .filter_map(|m| state.devices.get(&m.fingerprint_hash).cloned())
            .collect())
    }
}

#[async_trait]
impl TotpStore for MemoryStore {
    async fn totp_state(&self, user_id: Uuid) -> Result<Option<TotpState>> {
        Ok(self.state.lock().await.totp.get(&user_id).cloned())
    }

    async fn save_pending_secret(&self, user_id: Uuid, secret: &str) -> Result<()> {
        self.state.lock().await.totp.insert(
            user_id,
            TotpState {
                user_id,
                secret: Some(secret.to_string()),
                enabled: false,
                verified_at: None,
            },
        );
        Ok(())
    }

    async fn enable_totp(
        &self,
        user_id: Uuid,
        at: DateTime<Utc>,
        code_hashes: &[String],
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.totp.get_mut(&user_id) {
            Some(totp) if !totp.enabled && totp.secret.is_some() => {
                totp.enabled = true;
                totp.verified_at = Some(at);
            }
            _ => return Ok(false),
        }
        state.backup_codes.retain(|c| c.user_id != user_id);
        for hash in code_hashes {
            state.backup_codes.push(BackupCode {
                id: Uuid::now_v7(),
                user_id,
                code_hash: hash.clone(),
                used_at: None,
                created_at: at,
            });
        }
        Ok(true)
    }

    async fn disable_totp(&self, user_id: Uuid) -> Result<()> {
        let mut state = self.state.lock().await;
        state.totp.remove(&user_id);
        state.backup_codes.retain(|c| c.user_id != user_id);
        state.pending.retain(|p| p.user_id != user_id);
        Ok(())
    }

    async fn consume_backup_code(
        &self,
        user_id: Uuid,
        candidate_hashes: &[String],
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.backup_codes.iter_mut().find(|c| {
            c.user_id == user_id
                && legacy::is_unused(c.used_at)
                && candidate_hashes.contains(&c.code_hash)
        }) {
            Some(code) => {
                code.used_at = Some(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn backup_code_status(&self, user_id: Uuid) -> Result<(i64, i64)> {
        let state = self.state.lock().await;
        let codes: Vec<&BackupCode> = state
            .backup_codes
            .iter()
            .filter(|c| c.user_id == user_id)
            .collect();
        let remaining = codes.iter().filter(|c| legacy::is_unused(c.used_at)).count();
        Ok((
            i64::try_from(remaining).unwrap_or(i64::MAX),
            i64::try_from(codes.len()).unwrap_or(i64::MAX),
        ))
    }

    async fn replace_pending_token(&self, token: PendingToken) -> Result<()> {
        let mut state = self.state.lock().await;
        state.pending.retain(|p| p.user_id != token.user_id);
        state.pending.push(token);
        Ok(())
    }

    async fn find_pending_token(&self, token_hash: &str) -> Result<Option<PendingToken>> {
        Ok(self
            .state
            .lock()
            .await
            .pending
            .iter()
            .find(|p| p.token_hash == token_hash)
            .cloned())
    }

    async fn consume_pending_token(&self, token_id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state
            .pending
            .iter_mut()
            .find(|p| p.id == token_id && p.used_at.is_none())
        {
            Some(token) => {
                token.used_at = Some(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn release_pending_token(&self, token_id: Uuid) -> Result<()> {
        if let Some(token) = self
            .state
            .lock()
            .await
            .pending
            .iter_mut()
            .find(|p| p.id == token_id)
        {
            token.used_at = None;
        }
        Ok(())
    }
}

#[async_trait]
impl SudoStore for MemoryStore {
    async fn insert_sudo_session(&self, session: SudoSession) -> Result<()> {
        self.state.lock().await.sudo.push(session);
        Ok(())
    }

    async fn find_sudo_session(
        &self,
        user_id: Uuid,
        token_hash: &str,
    ) -> Result<Option<SudoSession>> {
        Ok(self
            .state
            .lock()
            .await
            .sudo
            .iter()
            .find(|s| s.user_id == user_id && s.token_hash == token_hash)
            .cloned())
    }

    async fn touch_sudo_session(&self, session_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(session) = state.sudo.iter_mut().find(|s| s.id == session_id) {
            session.last_used_at = at;
        }
        Ok(())
    }

    async fn extend_sudo_session(
        &self,
        session_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.sudo.iter_mut().find(|s| s.id == session_id) {
            Some(session) => {
                session.expires_at = expires_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_sudo_session(&self, user_id: Uuid, token_hash: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let before = state.sudo.len();
        state
            .sudo
            .retain(|s| !(s.user_id == user_id && s.token_hash == token_hash));
        Ok(state.sudo.len() < before)
    }

    async fn delete_user_sudo_sessions(&self, user_id: Uuid) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.sudo.len();
        state.sudo.retain(|s| s.user_id != user_id);
        Ok(u64::try_from(before - state.sudo.len()).unwrap_or(u64::MAX))
    }

    async fn delete_expired_sudo_sessions(
        &self,
        user_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.sudo.len();
        state.sudo.retain(|s| {
            let in_scope = user_id.is_none_or(|id| id == s.user_id);
            !(in_scope && s.expires_at <= now)
        });
        Ok(u64::try_from(before - state.sudo.len()).unwrap_or(u64::MAX))
    }

    async fn latest_sudo_session(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<SudoSession>> {
        Ok(self
            .state
            .lock()
            .await
            .sudo
            .iter()
            .filter(|s| s.user_id == user_id && s.expires_at > now)
            .max_by_key(|s| s.created_at)
            .cloned())
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn insert_event(&self, event: &SecurityEvent) -> Result<()> {
        self.state.lock().await.events.push(event.clone());
        Ok(())
    }

    async fn recent_events(&self, user_id: Uuid, limit: i64) -> Result<Vec<SecurityEvent>> {
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .state
            .lock()
            .await
            .events
            .iter()
            .rev()
            .filter(|e| e.user_id == Some(user_id))
            .take(limit)
            .cloned()
            .collect())
    }
}
