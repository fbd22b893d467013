//! Tunables for every component, with defaults and builder-style overrides.

use anyhow::{Result, anyhow};
use chrono::Duration;
use secrecy::SecretString;
use std::str::FromStr;
use url::Url;

const DEFAULT_ACCESS_TOKEN_TTL_SECONDS: i64 = 5 * 60;
const DEFAULT_REFRESH_TOKEN_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;
const DEFAULT_REUSE_GRACE_SECONDS: i64 = 30;
const DEFAULT_MAX_CONCURRENT_SESSIONS: usize = 5;
const DEFAULT_THEFT_LOCK_SECONDS: i64 = 7 * 24 * 60 * 60;
const DEFAULT_IP_ROTATION_WINDOW_SECONDS: i64 = 60 * 60;
const DEFAULT_IP_ROTATION_THRESHOLD: usize = 3;
const DEFAULT_USER_AGENT_MAX_LEN: usize = 512;

const DEFAULT_ATTEMPT_WINDOW_SECONDS: i64 = 30 * 60;
const DEFAULT_LOCK_THRESHOLD: u32 = 5;
const DEFAULT_LOCK_SECONDS: i64 = 15 * 60;
const DEFAULT_TOTP_WINDOW_SECONDS: i64 = 5 * 60;
const DEFAULT_TOTP_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_LOGIN_SWEEP_SECONDS: u64 = 5 * 60;
const DEFAULT_BACKOFF: &str = "0,1,2,4,8";

const DEFAULT_MAX_ACCOUNTS_PER_DEVICE: i64 = 2;
const DEFAULT_DEVICE_CACHE_TTL_SECONDS: i64 = 24 * 60 * 60;
const DEFAULT_DEVICE_SWEEP_SECONDS: u64 = 60 * 60;
const DEFAULT_BAN_CHECK_TIMEOUT_MS: u64 = 500;

const DEFAULT_TOTP_ISSUER: &str = "Warden";
const DEFAULT_BACKUP_CODE_COUNT: usize = 10;
const DEFAULT_PENDING_TOKEN_TTL_SECONDS: i64 = 5 * 60;

const DEFAULT_SUDO_TTL_SECONDS: i64 = 15 * 60;

/// Progressive delay table indexed by failure count.
///
/// Never empty and never decreasing; lookups past the end clamp to the last
/// entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackoffSchedule {
    delays: Vec<std::time::Duration>,
}

impl BackoffSchedule {
    /// # Errors
    /// Returns an error if `delays` is empty or decreases anywhere.
    pub fn new(delays: Vec<std::time::Duration>) -> Result<Self> {
        if delays.is_empty() {
            return Err(anyhow!("backoff schedule must not be empty"));
        }
        if delays.windows(2).any(|pair| pair[1] < pair[0]) {
            return Err(anyhow!("backoff schedule must be non-decreasing"));
        }
        Ok(Self { delays })
    }

    /// Delay for the given attempt count, clamped to the last entry.
    #[must_use]
    pub fn delay_for(&self, attempts: u32) -> std::time::Duration {
        let idx = usize::try_from(attempts).unwrap_or(usize::MAX);
        self.delays
            .get(idx)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.delays.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.delays.is_empty()
    }
}

impl FromStr for BackoffSchedule {
    type Err = anyhow::Error;

    /// Parse a comma-separated list of seconds, e.g. `"0,1,2,4,8"`.
    fn from_str(value: &str) -> Result<Self> {
        let delays = value
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<u64>()
                    .map(std::time::Duration::from_secs)
                    .map_err(|_| anyhow!("invalid backoff entry: {part}"))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(delays)
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        DEFAULT_BACKOFF
            .parse()
            .unwrap_or_else(|_| Self {
                delays: vec![std::time::Duration::ZERO],
            })
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    pub reuse_grace: Duration,
    pub max_concurrent_sessions: usize,
    pub theft_lock: Duration,
    pub ip_rotation_window: Duration,
    pub ip_rotation_threshold: usize,
    pub user_agent_max_len: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            access_token_ttl: Duration::seconds(DEFAULT_ACCESS_TOKEN_TTL_SECONDS),
            refresh_token_ttl: Duration::seconds(DEFAULT_REFRESH_TOKEN_TTL_SECONDS),
            reuse_grace: Duration::seconds(DEFAULT_REUSE_GRACE_SECONDS),
            max_concurrent_sessions: DEFAULT_MAX_CONCURRENT_SESSIONS,
            theft_lock: Duration::seconds(DEFAULT_THEFT_LOCK_SECONDS),
            ip_rotation_window: Duration::seconds(DEFAULT_IP_ROTATION_WINDOW_SECONDS),
            ip_rotation_threshold: DEFAULT_IP_ROTATION_THRESHOLD,
            user_agent_max_len: DEFAULT_USER_AGENT_MAX_LEN,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn with_access_token_ttl(mut self, ttl: Duration) -> Self {
        self.access_token_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_refresh_token_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_token_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_reuse_grace(mut self, grace: Duration) -> Self {
        self.reuse_grace = grace;
        self
    }

    #[must_use]
    pub fn with_max_concurrent_sessions(mut self, max: usize) -> Self {
        self.max_concurrent_sessions = max.max(1);
        self
    }

    #[must_use]
    pub fn with_user_agent_max_len(mut self, len: usize) -> Self {
        self.user_agent_max_len = len;
        self
    }

    #[must_use]
    pub fn with_theft_lock(mut self, lock: Duration) -> Self {
        self.theft_lock = lock;
        self
    }

    #[must_use]
    pub fn with_ip_rotation(mut self, window: Duration, threshold: usize) -> Self {
        self.ip_rotation_window = window;
        self.ip_rotation_threshold = threshold;
        self
    }
}

#[derive(Clone, Debug)]
pub struct LoginConfig {
    pub attempt_window: Duration,
    pub lock_threshold: u32,
    pub lock_duration: Duration,
    pub backoff: BackoffSchedule,
    pub totp_window: Duration,
    pub totp_max_attempts: u32,
    pub sweep_interval: std::time::Duration,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            attempt_window: Duration::seconds(DEFAULT_ATTEMPT_WINDOW_SECONDS),
            lock_threshold: DEFAULT_LOCK_THRESHOLD,
            lock_duration: Duration::seconds(DEFAULT_LOCK_SECONDS),
            backoff: BackoffSchedule::default(),
            totp_window: Duration::seconds(DEFAULT_TOTP_WINDOW_SECONDS),
            totp_max_attempts: DEFAULT_TOTP_MAX_ATTEMPTS,
            sweep_interval: std::time::Duration::from_secs(DEFAULT_LOGIN_SWEEP_SECONDS),
        }
    }
}

impl LoginConfig {
    #[must_use]
    pub fn with_attempt_window(mut self, window: Duration) -> Self {
        self.attempt_window = window;
        self
    }

    #[must_use]
    pub fn with_lock_threshold(mut self, threshold: u32) -> Self {
        self.lock_threshold = threshold.max(1);
        self
    }

    #[must_use]
    pub fn with_lock_duration(mut self, duration: Duration) -> Self {
        self.lock_duration = duration;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffSchedule) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_totp_limits(mut self, window: Duration, max_attempts: u32) -> Self {
        self.totp_window = window;
        self.totp_max_attempts = max_attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_sweep_interval(mut self, interval: std::time::Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

#[derive(Clone, Debug)]
pub struct DeviceConfig {
    pub max_accounts_per_device: i64,
    pub cache_ttl: Duration,
    pub sweep_interval: std::time::Duration,
    pub ban_check_url: Option<Url>,
    pub ban_check_token: Option<SecretString>,
    pub ban_check_timeout: std::time::Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            max_accounts_per_device: DEFAULT_MAX_ACCOUNTS_PER_DEVICE,
            cache_ttl: Duration::seconds(DEFAULT_DEVICE_CACHE_TTL_SECONDS),
            sweep_interval: std::time::Duration::from_secs(DEFAULT_DEVICE_SWEEP_SECONDS),
            ban_check_url: None,
            ban_check_token: None,
            ban_check_timeout: std::time::Duration::from_millis(DEFAULT_BAN_CHECK_TIMEOUT_MS),
        }
    }
}

impl DeviceConfig {
    #[must_use]
    pub fn with_max_accounts_per_device(mut self, max: i64) -> Self {
        self.max_accounts_per_device = max.max(1);
        self
    }

    #[must_use]
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_sweep_interval(mut self, interval: std::time::Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    #[must_use]
    pub fn with_ban_check(mut self, url: Url, token: SecretString) -> Self {
        self.ban_check_url = Some(url);
        self.ban_check_token = Some(token);
        self
    }

    #[must_use]
    pub fn with_ban_check_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.ban_check_timeout = timeout;
        self
    }
}

#[derive(Clone, Debug)]
pub struct TotpConfig {
    pub issuer: String,
    pub backup_code_count: usize,
    pub pending_token_ttl: Duration,
}

impl Default for TotpConfig {
    fn default() -> Self {
        Self {
            issuer: DEFAULT_TOTP_ISSUER.to_string(),
            backup_code_count: DEFAULT_BACKUP_CODE_COUNT,
            pending_token_ttl: Duration::seconds(DEFAULT_PENDING_TOKEN_TTL_SECONDS),
        }
    }
}

impl TotpConfig {
    #[must_use]
    pub fn with_issuer(mut self, issuer: String) -> Self {
        self.issuer = issuer;
        self
    }

    #[must_use]
    pub fn with_backup_code_count(mut self, count: usize) -> Self {
        self.backup_code_count = count.max(1);
        self
    }

    #[must_use]
    pub fn with_pending_token_ttl(mut self, ttl: Duration) -> Self {
        self.pending_token_ttl = ttl;
        self
    }
}

#[derive(Clone, Debug)]
pub struct SudoConfig {
    pub ttl: Duration,
    pub user_agent_max_len: usize,
}

impl Default for SudoConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::seconds(DEFAULT_SUDO_TTL_SECONDS),
            user_agent_max_len: DEFAULT_USER_AGENT_MAX_LEN,
        }
    }
}

impl SudoConfig {
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_user_agent_max_len(mut self, len: usize) -> Self {
        self.user_agent_max_len = len;
        self
    }
}

/// Every tunable of the security core in one place.
#[derive(Clone, Debug, Default)]
pub struct SecurityConfig {
    pub session: SessionConfig,
    pub login: LoginConfig,
    pub device: DeviceConfig,
    pub totp: TotpConfig,
    pub sudo: SudoConfig,
}

impl SecurityConfig {
    #[must_use]
    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    #[must_use]
    pub fn with_login(mut self, login: LoginConfig) -> Self {
        self.login = login;
        self
    }

    #[must_use]
    pub fn with_device(mut self, device: DeviceConfig) -> Self {
        self.device = device;
        self
    }

    #[must_use]
    pub fn with_totp(mut self, totp: TotpConfig) -> Self {
        self.totp = totp;
        self
    }

    #[must_use]
    pub fn with_sudo(mut self, sudo: SudoConfig) -> Self {
        self.sudo = sudo;
        self
    }

    /// Stored user agents are cut to the same length for sessions and sudo
    /// grants.
    #[must_use]
    pub fn with_user_agent_max_len(mut self, len: usize) -> Self {
        self.session.user_agent_max_len = len;
        self.sudo.user_agent_max_len = len;
        self
    }
}
