//! Device fingerprint tracking and the admin ban collaborator.

pub mod ban;
mod fingerprint;
mod tracker;

pub use ban::{BanChecker, BanStatus, HttpBanChecker, NoopBanChecker};
pub use fingerprint::hash_fingerprint;
pub use tracker::DeviceTracker;

use crate::store::DeviceFingerprint;
use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DenyReason {
    Blocked { reason: Option<String> },
    LimitReached { account_count: i64 },
}

/// Answer of an advisory device check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceVerdict {
    Allowed { account_count: i64 },
    Denied(DenyReason),
    /// Storage failed; callers proceed.
    Unknown,
}

impl DeviceVerdict {
    /// True for `Allowed` and `Unknown`.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Denied(_))
    }
}

/// Device view for code that must not depend on the concrete tracker.
#[async_trait]
pub trait DeviceReputation: Send + Sync {
    async fn check_admin_ban(&self, fingerprint: &str) -> BanStatus;

    async fn is_device_blocked(&self, fingerprint_hash: &str) -> DeviceVerdict;

    async fn can_register_account(
        &self,
        fingerprint_hash: &str,
        ip: &str,
        user_agent: &str,
    ) -> DeviceVerdict;

    async fn record_device_registration(
        &self,
        user_id: Uuid,
        fingerprint_hash: &str,
        ip: &str,
        user_agent: &str,
    ) -> Result<DeviceFingerprint>;

    async fn record_device_login(
        &self,
        user_id: Uuid,
        fingerprint_hash: &str,
        ip: &str,
        user_agent: &str,
    ) -> Result<DeviceFingerprint>;
}

#[async_trait]
impl DeviceReputation for DeviceTracker {
    async fn check_admin_ban(&self, fingerprint: &str) -> BanStatus {
        DeviceTracker::check_admin_ban(self, fingerprint).await
    }

    async fn is_device_blocked(&self, fingerprint_hash: &str) -> DeviceVerdict {
        DeviceTracker::is_device_blocked(self, fingerprint_hash).await
    }

    async fn can_register_account(
        &self,
        fingerprint_hash: &str,
        ip: &str,
        user_agent: &str,
    ) -> DeviceVerdict {
        DeviceTracker::can_register_account(self, fingerprint_hash, ip, user_agent).await
    }

    async fn record_device_registration(
        &self,
        user_id: Uuid,
        fingerprint_hash: &str,
        ip: &str,
        user_agent: &str,
    ) -> Result<DeviceFingerprint> {
        DeviceTracker::record_device_registration(self, user_id, fingerprint_hash, ip, user_agent)
            .await
    }

    async fn record_device_login(
        &self,
        user_id: Uuid,
        fingerprint_hash: &str,
        ip: &str,
        user_agent: &str,
    ) -> Result<DeviceFingerprint> {
        DeviceTracker::record_device_login(self, user_id, fingerprint_hash, ip, user_agent).await
    }
}
