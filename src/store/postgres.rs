//! Postgres backend.

use super::legacy::{BACKFILL_ZERO_USED_AT_SQL, UNUSED_BACKUP_CODE_PREDICATE};
use super::models::{
    DeviceFingerprint, DeviceSighting, NewSession, PendingToken, Session, SessionLock,
    SudoSession, TotpState, User,
};
use super::{AuditStore, DeviceStore, SessionStore, SudoStore, TotpStore, UserStore};
use crate::audit::SecurityEvent;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use tracing::{Instrument, Span, info};
use uuid::Uuid;

const SCHEMA: &str = include_str!("../../sql/schema.sql");

const SESSION_COLUMNS: &str = "id, user_id, refresh_token_hash, access_token_id, ip_address, \
     user_agent, token_family, is_used, created_at, expires_at, last_used_at, revoked_at, \
     revoke_reason";

fn db_span(operation: &'static str, statement: &str) -> Span {
    tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505")
    )
}

fn decode_event(row: &PgRow) -> Result<SecurityEvent> {
    let event_type: String = row.try_get("event_type")?;
    let severity: String = row.try_get("severity")?;
    Ok(SecurityEvent {
        id: row.try_get("id")?,
        event_type: event_type.parse()?,
        user_id: row.try_get("user_id")?,
        email: row.try_get("email")?,
        ip_address: row.try_get("ip_address")?,
        user_agent: row.try_get("user_agent")?,
        success: row.try_get("success")?,
        details: row.try_get("details")?,
        severity: severity.parse()?,
        created_at: row.try_get("created_at")?,
    })
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with default pool options.
    ///
    /// # Errors
    /// Returns an error if the connection cannot be established.
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = PgPool::connect(dsn)
            .await
            .context("Failed to connect to database")?;
        Ok(Self::new(pool))
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the schema and normalize legacy backup code rows.
    ///
    /// # Errors
    /// Returns an error if any statement fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("Failed to apply schema")?;

        let backfilled = sqlx::query(BACKFILL_ZERO_USED_AT_SQL)
            .execute(&self.pool)
            .await
            .context("Failed to backfill backup code used_at")?
            .rows_affected();
        if backfilled > 0 {
            info!("Normalized {backfilled} legacy backup code rows");
        }
        Ok(())
    }

    /// Insert a user row. Returns false if the email is taken.
    ///
    /// # Errors
    /// Returns an error for any failure other than a duplicate email.
    pub async fn insert_user(&self, user: &User) -> Result<bool> {
        let query = r"
            INSERT INTO users (id, email, username, password_hash)
            VALUES ($1, $2, $3, $4)
        ";
        let result = sqlx::query(query)
            .bind(user.id)
            .bind(&user.email)
            .bind(&user.username)
            .bind(&user.password_hash)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(err) if is_unique_violation(&err) => Ok(false),
            Err(err) => Err(err).context("Failed to insert user"),
        }
    }

    async fn upsert_device(
        tx: &mut Transaction<'_, Postgres>,
        sighting: &DeviceSighting<'_>,
    ) -> Result<bool> {
        // Locks the device row for the rest of the transaction.
        sqlx::query(
            r"
            INSERT INTO device_fingerprints
                (fingerprint_hash, first_ip, first_user_agent, account_count, first_seen_at, last_seen_at)
            VALUES ($1, $2, $3, 0, $4, $4)
            ON CONFLICT (fingerprint_hash) DO UPDATE SET last_seen_at = EXCLUDED.last_seen_at
            ",
        )
        .bind(sighting.fingerprint_hash)
        .bind(sighting.ip)
        .bind(sighting.user_agent)
        .bind(sighting.at)
        .execute(&mut **tx)
        .await
        .context("Failed to upsert device")?;

        let inserted = sqlx::query(
            r"
            INSERT INTO device_user_mappings (fingerprint_hash, user_id, first_seen_at, last_seen_at)
            VALUES ($1, $2, $3, $3)
            ON CONFLICT (fingerprint_hash, user_id) DO NOTHING
            ",
        )
        .bind(sighting.fingerprint_hash)
        .bind(sighting.user_id)
        .bind(sighting.at)
        .execute(&mut **tx)
        .await
        .context("Failed to insert device mapping")?
        .rows_affected()
            > 0;

        if inserted {
            sqlx::query(
                "UPDATE device_fingerprints SET account_count = account_count + 1 WHERE fingerprint_hash = $1",
            )
            .bind(sighting.fingerprint_hash)
            .execute(&mut **tx)
            .await
            .context("Failed to increment account count")?;
        } else {
            sqlx::query(
                "UPDATE device_user_mappings SET last_seen_at = $3 WHERE fingerprint_hash = $1 AND user_id = $2",
            )
            .bind(sighting.fingerprint_hash)
            .bind(sighting.user_id)
            .bind(sighting.at)
            .execute(&mut **tx)
            .await
            .context("Failed to touch device mapping")?;
        }
        Ok(inserted)
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>> {
        let query = "SELECT * FROM users WHERE id = $1";
        sqlx::query_as::<_, User>(query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("Failed to fetch user")
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let query = "SELECT * FROM users WHERE email = $1";
        sqlx::query_as::<_, User>(query)
            .bind(email)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("Failed to fetch user by email")
    }

    async fn lock_user(
        &self,
        user_id: Uuid,
        until: DateTime<Utc>,
        reason: &str,
        failed_attempts: i32,
    ) -> Result<()> {
        let query = r"
            UPDATE users
            SET locked_until = $2, lock_reason = $3, failed_login_attempts = $4
            WHERE id = $1
        ";
        sqlx::query(query)
            .bind(user_id)
            .bind(until)
            .bind(reason)
            .bind(failed_attempts)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("Failed to lock user")?;
        Ok(())
    }

    async fn record_failed_login(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let query = r"
            UPDATE users
            SET failed_login_attempts = failed_login_attempts + 1, last_failed_login_at = $2
            WHERE id = $1
        ";
        sqlx::query(query)
            .bind(user_id)
            .bind(at)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("Failed to record failed login")?;
        Ok(())
    }

    async fn record_successful_login(
        &self,
        user_id: Uuid,
        ip: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let query = r"
            UPDATE users
            SET failed_login_attempts = 0,
                locked_until = NULL,
                lock_reason = NULL,
                last_login_at = $3,
                last_login_ip = $2
            WHERE id = $1
        ";
        sqlx::query(query)
            .bind(user_id)
            .bind(ip)
            .bind(at)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("Failed to record successful login")?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn insert_session(&self, session: NewSession) -> Result<Session> {
        let query = format!(
            r"
            INSERT INTO sessions
                (id, user_id, refresh_token_hash, access_token_id, ip_address, user_agent,
                 token_family, created_at, expires_at, last_used_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $8)
            RETURNING {SESSION_COLUMNS}
            "
        );
        sqlx::query_as::<_, Session>(&query)
            .bind(session.id)
            .bind(session.user_id)
            .bind(&session.refresh_token_hash)
            .bind(&session.access_token_id)
            .bind(&session.ip_address)
            .bind(&session.user_agent)
            .bind(&session.token_family)
            .bind(session.created_at)
            .bind(session.expires_at)
            .fetch_one(&self.pool)
            .instrument(db_span("INSERT", &query))
            .await
            .context("Failed to insert session")
    }

    async fn find_session(&self, session_id: Uuid) -> Result<Option<Session>> {
        let query = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1");
        sqlx::query_as::<_, Session>(&query)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", &query))
            .await
            .context("Failed to fetch session")
    }

    async fn find_session_by_refresh_hash(
        &self,
        refresh_token_hash: &str,
    ) -> Result<Option<Session>> {
        let query = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE refresh_token_hash = $1");
        sqlx::query_as::<_, Session>(&query)
            .bind(refresh_token_hash)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", &query))
            .await
            .context("Failed to fetch session by refresh token")
    }

    async fn consume_and_rotate(
        &self,
        session_id: Uuid,
        used_at: DateTime<Utc>,
        child: NewSession,
    ) -> Result<Option<Session>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("begin rotation transaction")?;

        // Compare-and-set: exactly one caller can flip the flag.
        let claimed = sqlx::query(
            r"
            UPDATE sessions
            SET is_used = TRUE, last_used_at = $2
            WHERE id = $1 AND is_used = FALSE AND revoked_at IS NULL
            ",
        )
        .bind(session_id)
        .bind(used_at)
        .execute(&mut *tx)
        .await
        .context("Failed to mark session used")?
        .rows_affected();

        if claimed == 0 {
            tx.rollback().await.context("rollback rotation")?;
            return Ok(None);
        }

        let query = format!(
            r"
            INSERT INTO sessions
                (id, user_id, refresh_token_hash, access_token_id, ip_address, user_agent,
                 token_family, created_at, expires_at, last_used_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $8)
            RETURNING {SESSION_COLUMNS}
            "
        );
        let session = sqlx::query_as::<_, Session>(&query)
            .bind(child.id)
            .bind(child.user_id)
            .bind(&child.refresh_token_hash)
            .bind(&child.access_token_id)
            .bind(&child.ip_address)
            .bind(&child.user_agent)
            .bind(&child.token_family)
            .bind(child.created_at)
            .bind(child.expires_at)
            .fetch_one(&mut *tx)
            .await
            .context("Failed to insert rotated session")?;

        tx.commit().await.context("commit rotation")?;
        Ok(Some(session))
    }

    async fn latest_unused_in_family(
        &self,
        token_family: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        let query = format!(
            r"
            SELECT {SESSION_COLUMNS} FROM sessions
            WHERE token_family = $1 AND is_used = FALSE AND revoked_at IS NULL AND expires_at > $2
            ORDER BY created_at DESC
            LIMIT 1
            "
        );
        sqlx::query_as::<_, Session>(&query)
            .bind(token_family)
            .bind(now)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", &query))
            .await
            .context("Failed to fetch latest session in family")
    }

    async fn live_sessions(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<Vec<Session>> {
        let query = format!(
            r"
            SELECT {SESSION_COLUMNS} FROM sessions
            WHERE user_id = $1 AND revoked_at IS NULL AND NOT is_used AND expires_at > $2
            ORDER BY last_used_at DESC
            "
        );
        sqlx::query_as::<_, Session>(&query)
            .bind(user_id)
            .bind(now)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", &query))
            .await
            .context("Failed to list live sessions")
    }

    async fn sessions_created_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE user_id = $1 AND created_at > $2"
        );
        sqlx::query_as::<_, Session>(&query)
            .bind(user_id)
            .bind(since)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", &query))
            .await
            .context("Failed to list recent sessions")
    }

    async fn sessions_revoked_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE user_id = $1 AND revoked_at > $2"
        );
        sqlx::query_as::<_, Session>(&query)
            .bind(user_id)
            .bind(since)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", &query))
            .await
            .context("Failed to list revoked sessions")
    }

    async fn revoke_session(
        &self,
        session_id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let query = r"
            UPDATE sessions SET revoked_at = $3, revoke_reason = $2
            WHERE id = $1 AND revoked_at IS NULL
        ";
        let result = sqlx::query(query)
            .bind(session_id)
            .bind(reason)
            .bind(at)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("Failed to revoke session")?;
        Ok(result.rows_affected() > 0)
    }

    async fn revoke_user_sessions(
        &self,
        user_id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let query = r"
            UPDATE sessions SET revoked_at = $3, revoke_reason = $2
            WHERE user_id = $1 AND revoked_at IS NULL
        ";
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(reason)
            .bind(at)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("Failed to revoke user sessions")?;
        Ok(result.rows_affected())
    }

    async fn revoke_family(
        &self,
        token_family: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let query = r"
            UPDATE sessions SET revoked_at = $3, revoke_reason = $2
            WHERE token_family = $1 AND revoked_at IS NULL
        ";
        let result = sqlx::query(query)
            .bind(token_family)
            .bind(reason)
            .bind(at)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("Failed to revoke token family")?;
        Ok(result.rows_affected())
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64> {
        let query = "DELETE FROM sessions WHERE expires_at < $1";
        let result = sqlx::query(query)
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await
            .context("Failed to delete expired sessions")?;
        Ok(result.rows_affected())
    }

    async fn insert_lock(&self, lock: SessionLock) -> Result<()> {
        let query = r"
            INSERT INTO session_locks (id, user_id, reason, locked_by, locked_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
        ";
        sqlx::query(query)
            .bind(lock.id)
            .bind(lock.user_id)
            .bind(&lock.reason)
            .bind(&lock.locked_by)
            .bind(lock.locked_at)
            .bind(lock.expires_at)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await
            .context("Failed to insert session lock")?;
        Ok(())
    }

    async fn active_lock(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<Option<SessionLock>> {
        let query = r"
            SELECT id, user_id, reason, locked_by, locked_at, expires_at
            FROM session_locks
            WHERE user_id = $1 AND expires_at > $2
            ORDER BY locked_at DESC
            LIMIT 1
        ";
        sqlx::query_as::<_, SessionLock>(query)
            .bind(user_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("Failed to fetch session lock")
    }
}

#[async_trait]
impl DeviceStore for PgStore {
    async fn find_device(&self, fingerprint_hash: &str) -> Result<Option<DeviceFingerprint>> {
        let query = "SELECT * FROM device_fingerprints WHERE fingerprint_hash = $1";
        sqlx::query_as::<_, DeviceFingerprint>(query)
            .bind(fingerprint_hash)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("Failed to fetch device")
    }

    async fn record_registration(&self, sighting: DeviceSighting<'_>) -> Result<DeviceFingerprint> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("begin device registration transaction")?;
        Self::upsert_device(&mut tx, &sighting).await?;
        let device = sqlx::query_as::<_, DeviceFingerprint>(
            "SELECT * FROM device_fingerprints WHERE fingerprint_hash = $1",
        )
        .bind(sighting.fingerprint_hash)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to reload device")?;
        tx.commit().await.context("commit device registration")?;
        Ok(device)
    }

    async fn record_login(&self, sighting: DeviceSighting<'_>) -> Result<DeviceFingerprint> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("begin device login transaction")?;
        Self::upsert_device(&mut tx, &sighting).await?;
        let device = sqlx::query_as::<_, DeviceFingerprint>(
            r"
            UPDATE device_fingerprints
            SET account_count = (
                SELECT COUNT(*) FROM device_user_mappings WHERE fingerprint_hash = $1
            )
            WHERE fingerprint_hash = $1
            RETURNING *
            ",
        )
        .bind(sighting.fingerprint_hash)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to resync account count")?;
        tx.commit().await.context("commit device login")?;
        Ok(device)
    }

    async fn block_device(
        &self,
        fingerprint_hash: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<DeviceFingerprint> {
        let query = r"
            INSERT INTO device_fingerprints
                (fingerprint_hash, first_ip, first_user_agent, account_count, blocked, block_reason,
                 first_seen_at, last_seen_at)
            VALUES ($1, '', '', 0, TRUE, $2, $3, $3)
            ON CONFLICT (fingerprint_hash)
            DO UPDATE SET blocked = TRUE, block_reason = EXCLUDED.block_reason
            RETURNING *
        ";
        sqlx::query_as::<_, DeviceFingerprint>(query)
            .bind(fingerprint_hash)
            .bind(reason)
            .bind(at)
            .fetch_one(&self.pool)
            .instrument(db_span("INSERT", query))
            .await
            .context("Failed to block device")
    }

    async fn devices_for_user(&self, user_id: Uuid) -> Result<Vec<DeviceFingerprint>> {
        let query = r"
            SELECT d.* FROM device_fingerprints d
            JOIN device_user_mappings m ON m.fingerprint_hash = d.fingerprint_hash
            WHERE m.user_id = $1
            ORDER BY m.last_seen_at DESC
        ";
        sqlx::query_as::<_, DeviceFingerprint>(query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("Failed to list user devices")
    }
}

#[async_trait]
impl TotpStore for PgStore {
    async fn totp_state(&self, user_id: Uuid) -> Result<Option<TotpState>> {
        let query = "SELECT user_id, secret, enabled, verified_at FROM user_totp WHERE user_id = $1";
        sqlx::query_as::<_, TotpState>(query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("Failed to fetch TOTP state")
    }

    async fn save_pending_secret(&self, user_id: Uuid, secret: &str) -> Result<()> {
        let query = r"
            INSERT INTO user_totp (user_id, secret, enabled, verified_at)
            VALUES ($1, $2, FALSE, NULL)
            ON CONFLICT (user_id)
            DO UPDATE SET secret = EXCLUDED.secret, enabled = FALSE, verified_at = NULL
        ";
        sqlx::query(query)
            .bind(user_id)
            .bind(secret)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await
            .context("Failed to store TOTP secret")?;
        Ok(())
    }

    async fn enable_totp(
        &self,
        user_id: Uuid,
        at: DateTime<Utc>,
        code_hashes: &[String],
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("begin TOTP enable transaction")?;

        let enabled = sqlx::query(
            r"
            UPDATE user_totp SET enabled = TRUE, verified_at = $2
            WHERE user_id = $1 AND enabled = FALSE AND secret IS NOT NULL
            ",
        )
        .bind(user_id)
        .bind(at)
        .execute(&mut *tx)
        .await
        .context("Failed to enable TOTP")?
        .rows_affected();

        if enabled == 0 {
            tx.rollback().await.context("rollback TOTP enable")?;
            return Ok(false);
        }

        sqlx::query("DELETE FROM totp_backup_codes WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .context("Failed to clear backup codes")?;

        for hash in code_hashes {
            sqlx::query(
                r"
                INSERT INTO totp_backup_codes (id, user_id, code_hash, used_at, created_at)
                VALUES ($1, $2, $3, NULL, $4)
                ",
            )
            .bind(Uuid::now_v7())
            .bind(user_id)
            .bind(hash)
            .bind(at)
            .execute(&mut *tx)
            .await
            .context("Failed to insert backup code")?;
        }

        tx.commit().await.context("commit TOTP enable")?;
        Ok(true)
    }

    async fn disable_totp(&self, user_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin TOTP disable transaction")?;
        for query in [
            "DELETE FROM user_totp WHERE user_id = $1",
            "DELETE FROM totp_backup_codes WHERE user_id = $1",
            "DELETE FROM totp_pending_tokens WHERE user_id = $1",
        ] {
            sqlx::query(query)
                .bind(user_id)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to run `{query}`"))?;
        }
        tx.commit().await.context("commit TOTP disable")?;
        Ok(())
    }

    async fn consume_backup_code(
        &self,
        user_id: Uuid,
        candidate_hashes: &[String],
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let query = format!(
            r"
            UPDATE totp_backup_codes SET used_at = $3
            WHERE id = (
                SELECT id FROM totp_backup_codes
                WHERE user_id = $1 AND code_hash = ANY($2) AND {UNUSED_BACKUP_CODE_PREDICATE}
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            "
        );
        let result = sqlx::query(&query)
            .bind(user_id)
            .bind(candidate_hashes)
            .bind(at)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", &query))
            .await
            .context("Failed to consume backup code")?;
        Ok(result.rows_affected() > 0)
    }

    async fn backup_code_status(&self, user_id: Uuid) -> Result<(i64, i64)> {
        let query = format!(
            r"
            SELECT
                COUNT(*) FILTER (WHERE {UNUSED_BACKUP_CODE_PREDICATE}) AS remaining,
                COUNT(*) AS total
            FROM totp_backup_codes
            WHERE user_id = $1
            "
        );
        let row = sqlx::query(&query)
            .bind(user_id)
            .fetch_one(&self.pool)
            .instrument(db_span("SELECT", &query))
            .await
            .context("Failed to count backup codes")?;
        Ok((row.try_get("remaining")?, row.try_get("total")?))
    }

    async fn replace_pending_token(&self, token: PendingToken) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin pending token transaction")?;
        sqlx::query("DELETE FROM totp_pending_tokens WHERE user_id = $1")
            .bind(token.user_id)
            .execute(&mut *tx)
            .await
            .context("Failed to clear pending tokens")?;
        sqlx::query(
            r"
            INSERT INTO totp_pending_tokens (id, user_id, token_hash, expires_at, used_at, created_at)
            VALUES ($1, $2, $3, $4, NULL, $5)
            ",
        )
        .bind(token.id)
        .bind(token.user_id)
        .bind(&token.token_hash)
        .bind(token.expires_at)
        .bind(token.created_at)
        .execute(&mut *tx)
        .await
        .context("Failed to insert pending token")?;
        tx.commit().await.context("commit pending token")?;
        Ok(())
    }

    async fn find_pending_token(&self, token_hash: &str) -> Result<Option<PendingToken>> {
        let query = r"
            SELECT id, user_id, token_hash, expires_at, used_at, created_at
            FROM totp_pending_tokens
            WHERE token_hash = $1
        ";
        sqlx::query_as::<_, PendingToken>(query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("Failed to fetch pending token")
    }

    async fn consume_pending_token(&self, token_id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let query = "UPDATE totp_pending_tokens SET used_at = $2 WHERE id = $1 AND used_at IS NULL";
        let result = sqlx::query(query)
            .bind(token_id)
            .bind(at)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("Failed to consume pending token")?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_pending_token(&self, token_id: Uuid) -> Result<()> {
        let query = "UPDATE totp_pending_tokens SET used_at = NULL WHERE id = $1";
        sqlx::query(query)
            .bind(token_id)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("Failed to release pending token")?;
        Ok(())
    }
}

#[async_trait]
impl SudoStore for PgStore {
    async fn insert_sudo_session(&self, session: SudoSession) -> Result<()> {
        let query = r"
            INSERT INTO sudo_sessions
                (id, user_id, token_hash, ip_address, user_agent, expires_at, created_at, last_used_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ";
        sqlx::query(query)
            .bind(session.id)
            .bind(session.user_id)
            .bind(&session.token_hash)
            .bind(&session.ip_address)
            .bind(&session.user_agent)
            .bind(session.expires_at)
            .bind(session.created_at)
            .bind(session.last_used_at)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await
            .context("Failed to insert sudo session")?;
        Ok(())
    }

    async fn find_sudo_session(
        &self,
        user_id: Uuid,
        token_hash: &str,
    ) -> Result<Option<SudoSession>> {
        let query = "SELECT * FROM sudo_sessions WHERE user_id = $1 AND token_hash = $2";
        sqlx::query_as::<_, SudoSession>(query)
            .bind(user_id)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("Failed to fetch sudo session")
    }

    async fn touch_sudo_session(&self, session_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let query = "UPDATE sudo_sessions SET last_used_at = $2 WHERE id = $1";
        sqlx::query(query)
            .bind(session_id)
            .bind(at)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("Failed to touch sudo session")?;
        Ok(())
    }

    async fn extend_sudo_session(
        &self,
        session_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let query = "UPDATE sudo_sessions SET expires_at = $2 WHERE id = $1";
        let result = sqlx::query(query)
            .bind(session_id)
            .bind(expires_at)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("Failed to extend sudo session")?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_sudo_session(&self, user_id: Uuid, token_hash: &str) -> Result<bool> {
        let query = "DELETE FROM sudo_sessions WHERE user_id = $1 AND token_hash = $2";
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(token_hash)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await
            .context("Failed to delete sudo session")?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_user_sudo_sessions(&self, user_id: Uuid) -> Result<u64> {
        let query = "DELETE FROM sudo_sessions WHERE user_id = $1";
        let result = sqlx::query(query)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await
            .context("Failed to delete user sudo sessions")?;
        Ok(result.rows_affected())
    }

    async fn delete_expired_sudo_sessions(
        &self,
        user_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let query = r"
            DELETE FROM sudo_sessions
            WHERE expires_at <= $2 AND ($1::uuid IS NULL OR user_id = $1)
        ";
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await
            .context("Failed to delete expired sudo sessions")?;
        Ok(result.rows_affected())
    }

    async fn latest_sudo_session(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<SudoSession>> {
        let query = r"
            SELECT * FROM sudo_sessions
            WHERE user_id = $1 AND expires_at > $2
            ORDER BY created_at DESC
            LIMIT 1
        ";
        sqlx::query_as::<_, SudoSession>(query)
            .bind(user_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("Failed to fetch sudo session status")
    }
}

#[async_trait]
impl AuditStore for PgStore {
    async fn insert_event(&self, event: &SecurityEvent) -> Result<()> {
        let query = r"
            INSERT INTO security_events
                (id, event_type, user_id, email, ip_address, user_agent, success, details,
                 severity, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ";
        sqlx::query(query)
            .bind(event.id)
            .bind(event.event_type.as_str())
            .bind(event.user_id)
            .bind(&event.email)
            .bind(&event.ip_address)
            .bind(&event.user_agent)
            .bind(event.success)
            .bind(&event.details)
            .bind(event.severity.as_str())
            .bind(event.created_at)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await
            .context("Failed to insert security event")?;
        Ok(())
    }

    async fn recent_events(&self, user_id: Uuid, limit: i64) -> Result<Vec<SecurityEvent>> {
        let query = r"
            SELECT * FROM security_events
            WHERE user_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
        ";
        let rows = sqlx::query(query)
            .bind(user_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("Failed to list security events")?;
        rows.iter().map(decode_event).collect()
    }
}
