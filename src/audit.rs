//! Security audit log.
//!
//! Every component reports security-relevant outcomes here. Recording never
//! fails the caller: the event is mirrored to `tracing` at its severity, then
//! persisted, and persistence errors are logged and swallowed.

use crate::clock::SharedClock;
use crate::store::AuditStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    LoginSuccess,
    LoginFailed,
    LoginLocked,
    AccountLocked,
    AccountUnlocked,
    TotpEnabled,
    TotpDisabled,
    TotpSuccess,
    TotpFailed,
    TotpMaxAttempts,
    BackupCodeUsed,
    SessionCreated,
    SessionRefreshed,
    SessionRevoked,
    TokenReuseDetected,
    SudoActivated,
    SudoFailed,
    SudoRevoked,
    IpRotation,
    BruteForceDetected,
    DeviceBlocked,
    DeviceLimitReached,
}

impl SecurityEventType {
    pub const ALL: [Self; 22] = [
        Self::LoginSuccess,
        Self::LoginFailed,
        Self::LoginLocked,
        Self::AccountLocked,
        Self::AccountUnlocked,
        Self::TotpEnabled,
        Self::TotpDisabled,
        Self::TotpSuccess,
        Self::TotpFailed,
        Self::TotpMaxAttempts,
        Self::BackupCodeUsed,
        Self::SessionCreated,
        Self::SessionRefreshed,
        Self::SessionRevoked,
        Self::TokenReuseDetected,
        Self::SudoActivated,
        Self::SudoFailed,
        Self::SudoRevoked,
        Self::IpRotation,
        Self::BruteForceDetected,
        Self::DeviceBlocked,
        Self::DeviceLimitReached,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LoginSuccess => "login_success",
            Self::LoginFailed => "login_failed",
            Self::LoginLocked => "login_locked",
            Self::AccountLocked => "account_locked",
            Self::AccountUnlocked => "account_unlocked",
            Self::TotpEnabled => "totp_enabled",
            Self::TotpDisabled => "totp_disabled",
            Self::TotpSuccess => "totp_success",
            Self::TotpFailed => "totp_failed",
            Self::TotpMaxAttempts => "totp_max_attempts",
            Self::BackupCodeUsed => "backup_code_used",
            Self::SessionCreated => "session_created",
            Self::SessionRefreshed => "session_refreshed",
            Self::SessionRevoked => "session_revoked",
            Self::TokenReuseDetected => "token_reuse_detected",
            Self::SudoActivated => "sudo_activated",
            Self::SudoFailed => "sudo_failed",
            Self::SudoRevoked => "sudo_revoked",
            Self::IpRotation => "ip_rotation",
            Self::BruteForceDetected => "brute_force_detected",
            Self::DeviceBlocked => "device_blocked",
            Self::DeviceLimitReached => "device_limit_reached",
        }
    }

    /// Severity used when the caller does not override it.
    #[must_use]
    pub const fn default_severity(self) -> Severity {
        match self {
            Self::TokenReuseDetected | Self::BruteForceDetected | Self::AccountLocked => {
                Severity::Critical
            }
            Self::LoginFailed
            | Self::LoginLocked
            | Self::TotpFailed
            | Self::TotpMaxAttempts
            | Self::TotpDisabled
            | Self::SudoFailed
            | Self::IpRotation
            | Self::DeviceBlocked
            | Self::DeviceLimitReached => Severity::Warning,
            _ => Severity::Info,
        }
    }
}

impl fmt::Display for SecurityEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecurityEventType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| anyhow::anyhow!("unknown security event type: {value}"))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "critical" => Ok(Self::Critical),
            _ => Err(anyhow::anyhow!("unknown severity: {value}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: Uuid,
    pub event_type: SecurityEventType,
    pub user_id: Option<Uuid>,
    pub email: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub success: bool,
    pub details: String,
    pub severity: Severity,
    pub created_at: DateTime<Utc>,
}

impl SecurityEvent {
    #[must_use]
    pub fn new(event_type: SecurityEventType) -> Self {
        Self {
            id: Uuid::now_v7(),
            event_type,
            user_id: None,
            email: None,
            ip_address: None,
            user_agent: None,
            success: false,
            details: String::new(),
            severity: event_type.default_severity(),
            created_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    #[must_use]
    pub fn user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    #[must_use]
    pub fn email(mut self, email: &str) -> Self {
        self.email = Some(email.to_string());
        self
    }

    #[must_use]
    pub fn ip(mut self, ip: &str) -> Self {
        if !ip.is_empty() {
            self.ip_address = Some(ip.to_string());
        }
        self
    }

    #[must_use]
    pub fn user_agent(mut self, user_agent: &str) -> Self {
        if !user_agent.is_empty() {
            self.user_agent = Some(user_agent.to_string());
        }
        self
    }

    #[must_use]
    pub fn success(mut self) -> Self {
        self.success = true;
        self
    }

    #[must_use]
    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    #[must_use]
    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

/// Sink for security events, implemented by [`AuditLog`].
#[async_trait]
pub trait SecurityAudit: Send + Sync {
    async fn record(&self, event: SecurityEvent);
}

#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn AuditStore>,
    clock: SharedClock,
}

impl AuditLog {
    #[must_use]
    pub fn new(store: Arc<dyn AuditStore>, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    /// Events for a user, newest first.
    ///
    /// # Errors
    /// Returns an error if the store query fails.
    pub async fn recent_events(&self, user_id: Uuid, limit: i64) -> anyhow::Result<Vec<SecurityEvent>> {
        self.store.recent_events(user_id, limit).await
    }
}

#[async_trait]
impl SecurityAudit for AuditLog {
    async fn record(&self, mut event: SecurityEvent) {
        event.created_at = self.clock.now();

        let user_id = event.user_id.map(|id| id.to_string()).unwrap_or_default();
        let email = event.email.as_deref().unwrap_or("");
        let ip = event.ip_address.as_deref().unwrap_or("");
        match event.severity {
            Severity::Critical => error!(
                event_type = event.event_type.as_str(),
                user_id = %user_id, email, ip, details = %event.details, "security event"
            ),
            Severity::Warning => warn!(
                event_type = event.event_type.as_str(),
                user_id = %user_id, email, ip, details = %event.details, "security event"
            ),
            Severity::Info => info!(
                event_type = event.event_type.as_str(),
                user_id = %user_id, email, ip, details = %event.details, "security event"
            ),
        }

        if let Err(err) = self.store.insert_event(&event).await {
            error!(event_type = event.event_type.as_str(), "failed to persist security event: {err:#}");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::store::MemoryStore;

    #[test]
    fn event_types_round_trip_through_strings() {
        for kind in SecurityEventType::ALL {
            assert_eq!(kind.as_str().parse::<SecurityEventType>().unwrap(), kind);
        }
        assert!("nope".parse::<SecurityEventType>().is_err());
    }

    #[test]
    fn theft_and_brute_force_are_critical() {
        assert_eq!(
            SecurityEventType::TokenReuseDetected.default_severity(),
            Severity::Critical
        );
        assert_eq!(
            SecurityEventType::BruteForceDetected.default_severity(),
            Severity::Critical
        );
        assert_eq!(SecurityEventType::LoginFailed.default_severity(), Severity::Warning);
        assert_eq!(SecurityEventType::SessionCreated.default_severity(), Severity::Info);
    }

    #[tokio::test]
    async fn record_persists_with_clock_time() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::default();
        let audit = AuditLog::new(store.clone(), Arc::new(clock.clone()));
        let user_id = Uuid::now_v7();

        audit
            .record(
                SecurityEvent::new(SecurityEventType::LoginSuccess)
                    .user(user_id)
                    .email("alice@example.com")
                    .ip("10.0.0.1")
                    .success(),
            )
            .await;
        clock.advance(chrono::Duration::seconds(1));
        audit
            .record(
                SecurityEvent::new(SecurityEventType::TokenReuseDetected)
                    .user(user_id)
                    .ip("10.0.0.2")
                    .details("refresh token reuse"),
            )
            .await;

        let events = audit.recent_events(user_id, 10).await?;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, SecurityEventType::TokenReuseDetected);
        assert_eq!(events[0].severity, Severity::Critical);
        assert!(!events[0].success);
        assert_eq!(events[1].event_type, SecurityEventType::LoginSuccess);
        assert!(events[1].success);
        assert_eq!(events[0].created_at, clock.now());
        Ok(())
    }

    #[tokio::test]
    async fn anonymous_events_are_not_listed_per_user() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let audit = AuditLog::new(store.clone(), Arc::new(ManualClock::default()));
        audit
            .record(
                SecurityEvent::new(SecurityEventType::LoginFailed)
                    .email("ghost@example.com")
                    .details("unknown account"),
            )
            .await;
        assert!(audit.recent_events(Uuid::now_v7(), 10).await?.is_empty());
        assert_eq!(store.event_count().await, 1);
        Ok(())
    }
}
