use super::ban::{BanChecker, BanStatus};
use super::{DenyReason, DeviceVerdict};
use crate::audit::{SecurityAudit, SecurityEvent, SecurityEventType};
use crate::cache::TtlCache;
use crate::clock::SharedClock;
use crate::config::DeviceConfig;
use crate::store::{DeviceFingerprint, DeviceSighting, DeviceStore};
use crate::sweeper::Sweeper;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Multi-accounting defense keyed by device fingerprint hash.
///
/// The cache is derived from the store and may lag it by up to its TTL.
/// Gating reads fall through to the store on a miss and answer
/// [`DeviceVerdict::Unknown`] when the store fails.
pub struct DeviceTracker {
    config: DeviceConfig,
    store: Arc<dyn DeviceStore>,
    ban_checker: Arc<dyn BanChecker>,
    audit: Arc<dyn SecurityAudit>,
    clock: SharedClock,
    cache: Arc<TtlCache<String, DeviceFingerprint>>,
    sweeper: Sweeper,
}

impl DeviceTracker {
    #[must_use]
    pub fn new(
        config: DeviceConfig,
        store: Arc<dyn DeviceStore>,
        ban_checker: Arc<dyn BanChecker>,
        audit: Arc<dyn SecurityAudit>,
        clock: SharedClock,
    ) -> Self {
        let cache = Arc::new(TtlCache::new(config.cache_ttl, clock.clone()));
        let sweeper = Sweeper::new("device-cache", config.sweep_interval);
        Self {
            config,
            store,
            ban_checker,
            audit,
            clock,
            cache,
            sweeper,
        }
    }

    async fn lookup(&self, fingerprint_hash: &str) -> Result<Option<DeviceFingerprint>> {
        let key = fingerprint_hash.to_string();
        if let Some(device) = self.cache.get(&key).await {
            return Ok(Some(device));
        }
        let device = self.store.find_device(fingerprint_hash).await?;
        if let Some(device) = &device {
            self.cache.insert(key, device.clone()).await;
        }
        Ok(device)
    }

    /// Gate a new account on this device.
    pub async fn can_register_account(
        &self,
        fingerprint_hash: &str,
        ip: &str,
        user_agent: &str,
    ) -> DeviceVerdict {
        if fingerprint_hash.is_empty() {
            return DeviceVerdict::Allowed { account_count: 0 };
        }
        match self.lookup(fingerprint_hash).await {
            Ok(None) => DeviceVerdict::Allowed { account_count: 0 },
            Ok(Some(device)) if device.blocked => {
                warn!(ip, user_agent, "registration from blocked device");
                DeviceVerdict::Denied(DenyReason::Blocked {
                    reason: device.block_reason,
                })
            }
            Ok(Some(device)) if device.account_count >= self.config.max_accounts_per_device => {
                warn!(
                    ip,
                    user_agent,
                    account_count = device.account_count,
                    "device account limit reached"
                );
                DeviceVerdict::Denied(DenyReason::LimitReached {
                    account_count: device.account_count,
                })
            }
            Ok(Some(device)) => DeviceVerdict::Allowed {
                account_count: device.account_count,
            },
            Err(err) => {
                warn!("Device lookup failed, allowing registration: {err:#}");
                DeviceVerdict::Unknown
            }
        }
    }

    /// Count a new account on this device. Repeat calls for the same user
    /// do not move the counter.
    ///
    /// # Errors
    /// Returns an error if the store transaction fails.
    pub async fn record_device_registration(
        &self,
        user_id: Uuid,
        fingerprint_hash: &str,
        ip: &str,
        user_agent: &str,
    ) -> Result<DeviceFingerprint> {
        let device = self
            .store
            .record_registration(DeviceSighting {
                fingerprint_hash,
                user_id,
                ip,
                user_agent,
                at: self.clock.now(),
            })
            .await
            .context("Failed to record device registration")?;
        info!(
            user_id = %user_id,
            account_count = device.account_count,
            "device registration recorded"
        );
        self.cache
            .insert(fingerprint_hash.to_string(), device.clone())
            .await;
        Ok(device)
    }

    /// Touch the device for a login and resync its account count from the
    /// user mappings.
    ///
    /// # Errors
    /// Returns an error if the store transaction fails.
    pub async fn record_device_login(
        &self,
        user_id: Uuid,
        fingerprint_hash: &str,
        ip: &str,
        user_agent: &str,
    ) -> Result<DeviceFingerprint> {
        let device = self
            .store
            .record_login(DeviceSighting {
                fingerprint_hash,
                user_id,
                ip,
                user_agent,
                at: self.clock.now(),
            })
            .await
            .context("Failed to record device login")?;
        self.cache
            .insert(fingerprint_hash.to_string(), device.clone())
            .await;
        Ok(device)
    }

    /// Blocked check, cache first. Never denies on a store error.
    pub async fn is_device_blocked(&self, fingerprint_hash: &str) -> DeviceVerdict {
        if fingerprint_hash.is_empty() {
            return DeviceVerdict::Allowed { account_count: 0 };
        }
        match self.lookup(fingerprint_hash).await {
            Ok(Some(device)) if device.blocked => DeviceVerdict::Denied(DenyReason::Blocked {
                reason: device.block_reason,
            }),
            Ok(device) => DeviceVerdict::Allowed {
                account_count: device.map_or(0, |d| d.account_count),
            },
            Err(err) => {
                warn!("Device block lookup failed, allowing: {err:#}");
                DeviceVerdict::Unknown
            }
        }
    }

    pub async fn check_admin_ban(&self, fingerprint: &str) -> BanStatus {
        self.ban_checker.check(fingerprint).await
    }

    /// # Errors
    /// Returns an error if the store update fails.
    pub async fn block_device(&self, fingerprint_hash: &str, reason: &str) -> Result<DeviceFingerprint> {
        let device = self
            .store
            .block_device(fingerprint_hash, reason, self.clock.now())
            .await
            .context("Failed to block device")?;
        self.cache
            .insert(fingerprint_hash.to_string(), device.clone())
            .await;
        self.audit
            .record(
                SecurityEvent::new(SecurityEventType::DeviceBlocked)
                    .details(format!("device {fingerprint_hash} blocked: {reason}")),
            )
            .await;
        Ok(device)
    }

    /// # Errors
    /// Returns an error if the store lookup fails.
    pub async fn device_account_count(&self, fingerprint_hash: &str) -> Result<i64> {
        Ok(self
            .lookup(fingerprint_hash)
            .await?
            .map_or(0, |device| device.account_count))
    }

    /// # Errors
    /// Returns an error if the store query fails.
    pub async fn user_devices(&self, user_id: Uuid) -> Result<Vec<DeviceFingerprint>> {
        self.store.devices_for_user(user_id).await
    }

    /// Start the cache eviction sweep.
    pub fn start(&self) {
        let cache = Arc::clone(&self.cache);
        self.sweeper.start(move || {
            let cache = Arc::clone(&cache);
            async move {
                let purged = cache.purge_expired().await;
                if purged > 0 {
                    debug!(purged, "evicted expired device cache entries");
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

    pub async fn cached_devices(&self) -> usize {
        self.cache.len().await
    }
}
