use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Row, postgres::PgRow};
use uuid::Uuid;

/// The slice of the user row this crate reads and mutates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub username: Option<String>,
    pub password_hash: String,
    pub locked_until: Option<DateTime<Utc>>,
    pub lock_reason: Option<String>,
    pub failed_login_attempts: i32,
    pub last_failed_login_at: Option<DateTime<Utc>>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub last_login_ip: Option<String>,
}

impl User {
    #[must_use]
    pub fn new(email: &str, password_hash: String) -> Self {
        Self {
            id: Uuid::now_v7(),
            email: email.trim().to_lowercase(),
            username: None,
            password_hash,
            locked_until: None,
            lock_reason: None,
            failed_login_attempts: 0,
            last_failed_login_at: None,
            last_login_at: None,
            last_login_ip: None,
        }
    }

    #[must_use]
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }
}

impl<'r> FromRow<'r, PgRow> for User {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            email: row.try_get("email")?,
            username: row.try_get("username")?,
            password_hash: row.try_get("password_hash")?,
            locked_until: row.try_get("locked_until")?,
            lock_reason: row.try_get("lock_reason")?,
            failed_login_attempts: row.try_get("failed_login_attempts")?,
            last_failed_login_at: row.try_get("last_failed_login_at")?,
            last_login_at: row.try_get("last_login_at")?,
            last_login_ip: row.try_get("last_login_ip")?,
        })
    }
}

/// One step of a refresh-token lineage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub refresh_token_hash: String,
    pub access_token_id: String,
    pub ip_address: String,
    pub user_agent: String,
    pub token_family: String,
    pub is_used: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoke_reason: Option<String>,
}

impl Session {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    /// Neither revoked nor expired.
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.is_revoked() && !self.is_expired(now)
    }
}

impl<'r> FromRow<'r, PgRow> for Session {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            refresh_token_hash: row.try_get("refresh_token_hash")?,
            access_token_id: row.try_get("access_token_id")?,
            ip_address: row.try_get("ip_address")?,
            user_agent: row.try_get("user_agent")?,
            token_family: row.try_get("token_family")?,
            is_used: row.try_get("is_used")?,
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
            last_used_at: row.try_get("last_used_at")?,
            revoked_at: row.try_get("revoked_at")?,
            revoke_reason: row.try_get("revoke_reason")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub refresh_token_hash: String,
    pub access_token_id: String,
    pub ip_address: String,
    pub user_agent: String,
    pub token_family: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl NewSession {
    #[must_use]
    pub fn into_session(self) -> Session {
        Session {
            id: self.id,
            user_id: self.user_id,
            refresh_token_hash: self.refresh_token_hash,
            access_token_id: self.access_token_id,
            ip_address: self.ip_address,
            user_agent: self.user_agent,
            token_family: self.token_family,
            is_used: false,
            created_at: self.created_at,
            expires_at: self.expires_at,
            last_used_at: self.created_at,
            revoked_at: None,
            revoke_reason: None,
        }
    }
}

/// Lock placed by the session layer (token theft, admin action).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLock {
    pub id: Uuid,
    pub user_id: Uuid,
    pub reason: String,
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for SessionLock {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            reason: row.try_get("reason")?,
            locked_by: row.try_get("locked_by")?,
            locked_at: row.try_get("locked_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFingerprint {
    pub fingerprint_hash: String,
    pub first_ip: String,
    pub first_user_agent: String,
    pub account_count: i64,
    pub blocked: bool,
    pub block_reason: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for DeviceFingerprint {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            fingerprint_hash: row.try_get("fingerprint_hash")?,
            first_ip: row.try_get("first_ip")?,
            first_user_agent: row.try_get("first_user_agent")?,
            account_count: row.try_get("account_count")?,
            blocked: row.try_get("blocked")?,
            block_reason: row.try_get("block_reason")?,
            first_seen_at: row.try_get("first_seen_at")?,
            last_seen_at: row.try_get("last_seen_at")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceUserMapping {
    pub fingerprint_hash: String,
    pub user_id: Uuid,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Who touched a device and from where.
#[derive(Debug, Clone, Copy)]
pub struct DeviceSighting<'a> {
    pub fingerprint_hash: &'a str,
    pub user_id: Uuid,
    pub ip: &'a str,
    pub user_agent: &'a str,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TotpState {
    pub user_id: Uuid,
    pub secret: Option<String>,
    pub enabled: bool,
    pub verified_at: Option<DateTime<Utc>>,
}

impl TotpState {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.enabled && self.secret.as_deref().is_some_and(|s| !s.is_empty())
    }
}

impl<'r> FromRow<'r, PgRow> for TotpState {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            user_id: row.try_get("user_id")?,
            secret: row.try_get("secret")?,
            enabled: row.try_get("enabled")?,
            verified_at: row.try_get("verified_at")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupCode {
    pub id: Uuid,
    pub user_id: Uuid,
    pub code_hash: String,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for PendingToken {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            token_hash: row.try_get("token_hash")?,
            expires_at: row.try_get("expires_at")?,
            used_at: row.try_get("used_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SudoSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub ip_address: String,
    pub user_agent: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for SudoSession {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            token_hash: row.try_get("token_hash")?,
            ip_address: row.try_get("ip_address")?,
            user_agent: row.try_get("user_agent")?,
            expires_at: row.try_get("expires_at")?,
            created_at: row.try_get("created_at")?,
            last_used_at: row.try_get("last_used_at")?,
        })
    }
}
