use crate::clock::SharedClock;
use crate::config::LoginConfig;
use crate::store::UserStore;
use crate::sweeper::Sweeper;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

/// Verdict for one failed password attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FailedLogin {
    pub should_lock: bool,
    pub delay: Duration,
    pub attempts_remaining: u32,
    pub attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug)]
struct AttemptRecord {
    count: u32,
    first_attempt: DateTime<Utc>,
    last_attempt: DateTime<Utc>,
    locked_until: Option<DateTime<Utc>>,
}

impl AttemptRecord {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            first_attempt: now,
            last_attempt: now,
            locked_until: None,
        }
    }

    fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }
}

#[derive(Clone, Debug)]
struct TotpRecord {
    count: u32,
    reset_at: DateTime<Utc>,
}

struct Inner {
    config: LoginConfig,
    clock: SharedClock,
    users: Arc<dyn UserStore>,
    attempts: RwLock<HashMap<String, AttemptRecord>>,
    totp: RwLock<HashMap<String, TotpRecord>>,
}

impl Inner {
    async fn cleanup(&self) -> usize {
        let now = self.clock.now();
        let window = self.config.attempt_window;

        let mut removed = 0;
        {
            let mut attempts = self.attempts.write().await;
            let before = attempts.len();
            attempts.retain(|_, record| record.is_locked(now) || now - record.last_attempt <= window);
            removed += before - attempts.len();
        }
        {
            let mut totp = self.totp.write().await;
            let before = totp.len();
            totp.retain(|_, record| now < record.reset_at);
            removed += before - totp.len();
        }
        removed
    }
}

/// In-memory brute-force tracker keyed by account identifier (normalized
/// email), with a separate key space for second-factor attempts.
///
/// Durable per-user counters live on the user row and are touched only by
/// the `persist_lock`, `record_failed_attempt_db` and
/// `record_successful_login` helpers.
pub struct LoginAttemptTracker {
    inner: Arc<Inner>,
    sweeper: Sweeper,
}

impl LoginAttemptTracker {
    #[must_use]
    pub fn new(config: LoginConfig, users: Arc<dyn UserStore>, clock: SharedClock) -> Self {
        let sweeper = Sweeper::new("login-attempts", config.sweep_interval);
        Self {
            inner: Arc::new(Inner {
                config,
                clock,
                users,
                attempts: RwLock::new(HashMap::new()),
                totp: RwLock::new(HashMap::new()),
            }),
            sweeper,
        }
    }

    #[must_use]
    pub fn config(&self) -> &LoginConfig {
        &self.inner.config
    }

    /// Count a failed password attempt and report the backoff to apply.
    pub async fn record_failed_login(&self, identifier: &str, ip: &str) -> FailedLogin {
        let config = &self.inner.config;
        let now = self.inner.clock.now();
        let mut attempts = self.inner.attempts.write().await;
        let record = attempts
            .entry(identifier.to_string())
            .or_insert_with(|| AttemptRecord::new(now));

        if !record.is_locked(now)
            && (record.locked_until.is_some() || now - record.last_attempt > config.attempt_window)
        {
            *record = AttemptRecord::new(now);
        }

        record.count = record.count.saturating_add(1);
        record.last_attempt = now;

        let should_lock = record.count >= config.lock_threshold;
        if should_lock {
            record.locked_until = Some(now + config.lock_duration);
            warn!(
                identifier,
                ip,
                attempts = record.count,
                first_attempt = %record.first_attempt,
                "login locked after repeated failures"
            );
        }

        FailedLogin {
            should_lock,
            delay: config.backoff.delay_for(record.count),
            attempts_remaining: config.lock_threshold.saturating_sub(record.count),
            attempts: record.count,
            locked_until: record.locked_until,
        }
    }

    /// Lock expiry while the identifier is locked. Expired locks read as
    /// unlocked without waiting for the sweep.
    pub async fn locked_until(&self, identifier: &str) -> Option<DateTime<Utc>> {
        let now = self.inner.clock.now();
        self.inner
            .attempts
            .read()
            .await
            .get(identifier)
            .and_then(|record| record.locked_until)
            .filter(|until| *until > now)
    }

    pub async fn is_locked(&self, identifier: &str) -> bool {
        self.locked_until(identifier).await.is_some()
    }

    /// Drop the in-memory record after a successful password check.
    pub async fn reset_attempts(&self, identifier: &str) {
        self.inner.attempts.write().await.remove(identifier);
    }

    /// Backoff owed before the next attempt is processed.
    pub async fn delay_for(&self, identifier: &str) -> Duration {
        let config = &self.inner.config;
        let now = self.inner.clock.now();
        match self.inner.attempts.read().await.get(identifier) {
            Some(record) if now - record.last_attempt <= config.attempt_window => {
                config.backoff.delay_for(record.count)
            }
            _ => Duration::ZERO,
        }
    }

    /// Failures counted in the current window.
    pub async fn attempts(&self, identifier: &str) -> u32 {
        self.inner
            .attempts
            .read()
            .await
            .get(identifier)
            .map_or(0, |record| record.count)
    }

    /// Count a wrong second-factor code. Returns the attempts left.
    pub async fn record_totp_attempt(&self, identifier: &str) -> u32 {
        let config = &self.inner.config;
        let now = self.inner.clock.now();
        let mut totp = self.inner.totp.write().await;
        let record = totp.entry(identifier.to_string()).or_insert(TotpRecord {
            count: 0,
            reset_at: now + config.totp_window,
        });
        if now >= record.reset_at {
            record.count = 0;
            record.reset_at = now + config.totp_window;
        }
        record.count = record.count.saturating_add(1);

        let remaining = config.totp_max_attempts.saturating_sub(record.count);
        if remaining == 0 {
            warn!(identifier, "TOTP attempts exhausted");
        }
        remaining
    }

    pub async fn totp_attempts_remaining(&self, identifier: &str) -> u32 {
        let config = &self.inner.config;
        let now = self.inner.clock.now();
        match self.inner.totp.read().await.get(identifier) {
            Some(record) if now < record.reset_at => {
                config.totp_max_attempts.saturating_sub(record.count)
            }
            _ => config.totp_max_attempts,
        }
    }

    pub async fn reset_totp_attempts(&self, identifier: &str) {
        self.inner.totp.write().await.remove(identifier);
    }

    /// Write a brute-force lock onto the user row.
    ///
    /// # Errors
    /// Returns an error if the store update fails.
    pub async fn persist_lock(&self, user_id: Uuid, reason: &str) -> Result<DateTime<Utc>> {
        let config = &self.inner.config;
        let until = self.inner.clock.now() + config.lock_duration;
        let attempts = i32::try_from(config.lock_threshold).unwrap_or(i32::MAX);
        self.inner
            .users
            .lock_user(user_id, until, reason, attempts)
            .await
            .context("Failed to persist login lock")?;
        Ok(until)
    }

    /// Clear in-memory and durable counters and stamp the login.
    ///
    /// # Errors
    /// Returns an error if the store update fails.
    pub async fn record_successful_login(
        &self,
        user_id: Uuid,
        identifier: &str,
        ip: &str,
    ) -> Result<()> {
        self.reset_attempts(identifier).await;
        self.reset_totp_attempts(identifier).await;
        self.inner
            .users
            .record_successful_login(user_id, ip, self.inner.clock.now())
            .await
    }

    /// Bump the durable failure counter on the user row.
    ///
    /// # Errors
    /// Returns an error if the store update fails.
    pub async fn record_failed_attempt_db(&self, user_id: Uuid) -> Result<()> {
        self.inner
            .users
            .record_failed_login(user_id, self.inner.clock.now())
            .await
    }

    /// Evict idle records. Locked records survive until their lock lapses.
    pub async fn cleanup(&self) -> usize {
        self.inner.cleanup().await
    }

    /// Start the periodic cleanup sweep.
    pub fn start(&self) {
        let inner = Arc::clone(&self.inner);
        self.sweeper.start(move || {
            let inner = Arc::clone(&inner);
            async move {
                let removed = inner.cleanup().await;
                if removed > 0 {
                    debug!(removed, "evicted idle login attempt records");
                }
            }
        });
    }

    pub fn stop(&self) {
        self.sweeper.stop();
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.sweeper.is_running()
    }
}
