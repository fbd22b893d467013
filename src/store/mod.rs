//! Persistence port.
//!
//! One trait per component so each service depends only on the records it
//! owns. `PgStore` is the production backend; `MemoryStore` keeps everything
//! in-process for tests and embedding.

pub mod legacy;
pub mod memory;
pub mod models;
pub mod postgres;

use crate::audit::SecurityEvent;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use models::{
    BackupCode, DeviceFingerprint, DeviceSighting, DeviceUserMapping, NewSession, PendingToken,
    Session, SessionLock, SudoSession, TotpState, User,
};
pub use postgres::PgStore;

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>>;

    /// Lookup by already-normalized email.
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>>;

    /// Persist a lock on the user row.
    async fn lock_user(
        &self,
        user_id: Uuid,
        until: DateTime<Utc>,
        reason: &str,
        failed_attempts: i32,
    ) -> Result<()>;

    async fn record_failed_login(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Clear failure counters and lock, stamp last login.
    async fn record_successful_login(&self, user_id: Uuid, ip: &str, at: DateTime<Utc>)
    -> Result<()>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert_session(&self, session: NewSession) -> Result<Session>;

    async fn find_session(&self, session_id: Uuid) -> Result<Option<Session>>;

    async fn find_session_by_refresh_hash(&self, refresh_token_hash: &str)
    -> Result<Option<Session>>;

    /// Atomically flip `is_used` from false to true on a live session and insert
    /// `child` in the same transaction.
    ///
    /// Returns `None` when the flag was already set (a concurrent caller won).
    async fn consume_and_rotate(
        &self,
        session_id: Uuid,
        used_at: DateTime<Utc>,
        child: NewSession,
    ) -> Result<Option<Session>>;

    /// Newest live, unused session in a family.
    async fn latest_unused_in_family(
        &self,
        token_family: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>>;

    /// Live heads of each token family (not yet rotated), most recently used
    /// first.
    async fn live_sessions(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<Vec<Session>>;

    /// Sessions created after `since`, any state.
    async fn sessions_created_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<Session>>;

    /// Sessions revoked after `since`.
    async fn sessions_revoked_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<Session>>;

    /// Returns false when the session was already revoked or does not exist.
    async fn revoke_session(&self, session_id: Uuid, reason: &str, at: DateTime<Utc>)
    -> Result<bool>;

    async fn revoke_user_sessions(&self, user_id: Uuid, reason: &str, at: DateTime<Utc>)
    -> Result<u64>;

    async fn revoke_family(&self, token_family: &str, reason: &str, at: DateTime<Utc>)
    -> Result<u64>;

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64>;

    async fn insert_lock(&self, lock: SessionLock) -> Result<()>;

    /// Most recent lock still in force.
    async fn active_lock(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<Option<SessionLock>>;
}

#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn find_device(&self, fingerprint_hash: &str) -> Result<Option<DeviceFingerprint>>;

    /// Upsert the device and its user mapping in one transaction. The counter
    /// only moves when the mapping is new.
    async fn record_registration(&self, sighting: DeviceSighting<'_>) -> Result<DeviceFingerprint>;

    /// Upsert like registration, then resync `account_count` from mappings.
    async fn record_login(&self, sighting: DeviceSighting<'_>) -> Result<DeviceFingerprint>;

    /// Mark a device blocked, creating the record if it was never seen.
    async fn block_device(
        &self,
        fingerprint_hash: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<DeviceFingerprint>;

    async fn devices_for_user(&self, user_id: Uuid) -> Result<Vec<DeviceFingerprint>>;
}

#[async_trait]
pub trait TotpStore: Send + Sync {
    async fn totp_state(&self, user_id: Uuid) -> Result<Option<TotpState>>;

    /// Store a not-yet-enabled secret, replacing any earlier pending one.
    async fn save_pending_secret(&self, user_id: Uuid, secret: &str) -> Result<()>;

    /// Flip to enabled and store backup code hashes in one transaction.
    /// Returns false when already enabled.
    async fn enable_totp(
        &self,
        user_id: Uuid,
        at: DateTime<Utc>,
        code_hashes: &[String],
    ) -> Result<bool>;

    /// Clear the secret, backup codes and pending tokens.
    async fn disable_totp(&self, user_id: Uuid) -> Result<()>;

    /// Mark the first unused code matching any of `candidate_hashes` as used.
    async fn consume_backup_code(
        &self,
        user_id: Uuid,
        candidate_hashes: &[String],
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// `(remaining, total)` backup codes.
    async fn backup_code_status(&self, user_id: Uuid) -> Result<(i64, i64)>;

    /// Store a pending token, dropping earlier ones for the same user.
    async fn replace_pending_token(&self, token: PendingToken) -> Result<()>;

    async fn find_pending_token(&self, token_hash: &str) -> Result<Option<PendingToken>>;

    /// Set `used_at` if still unset.
    async fn consume_pending_token(&self, token_id: Uuid, at: DateTime<Utc>) -> Result<bool>;

    /// Clear `used_at` on a token claimed for a factor that then failed.
    async fn release_pending_token(&self, token_id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait SudoStore: Send + Sync {
    async fn insert_sudo_session(&self, session: SudoSession) -> Result<()>;

    async fn find_sudo_session(&self, user_id: Uuid, token_hash: &str)
    -> Result<Option<SudoSession>>;

    async fn touch_sudo_session(&self, session_id: Uuid, at: DateTime<Utc>) -> Result<()>;

    async fn extend_sudo_session(&self, session_id: Uuid, expires_at: DateTime<Utc>)
    -> Result<bool>;

    async fn delete_sudo_session(&self, user_id: Uuid, token_hash: &str) -> Result<bool>;

    async fn delete_user_sudo_sessions(&self, user_id: Uuid) -> Result<u64>;

    /// Delete expired sessions, for one user or for everyone.
    async fn delete_expired_sudo_sessions(
        &self,
        user_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    async fn latest_sudo_session(&self, user_id: Uuid, now: DateTime<Utc>)
    -> Result<Option<SudoSession>>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn insert_event(&self, event: &SecurityEvent) -> Result<()>;

    /// Newest first.
    async fn recent_events(&self, user_id: Uuid, limit: i64) -> Result<Vec<SecurityEvent>>;
}

/// Every port, wired to one backend.
#[derive(Clone)]
pub struct Stores {
    pub users: Arc<dyn UserStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub devices: Arc<dyn DeviceStore>,
    pub totp: Arc<dyn TotpStore>,
    pub sudo: Arc<dyn SudoStore>,
    pub audit: Arc<dyn AuditStore>,
}

impl Stores {
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: UserStore + SessionStore + DeviceStore + TotpStore + SudoStore + AuditStore + 'static,
    {
        Self {
            users: backend.clone(),
            sessions: backend.clone(),
            devices: backend.clone(),
            totp: backend.clone(),
            sudo: backend.clone(),
            audit: backend,
        }
    }
}
