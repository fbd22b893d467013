//! Caller-facing error taxonomy for authentication flows.
//!
//! Invalid credentials never say whether the account exists. Both lock
//! sources (brute force and token theft) collapse into `AccountLocked`.

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Invalid token: {0}")]
    InvalidToken(&'static str),
    #[error("Token expired")]
    TokenExpired,
    #[error("Account locked for {}: {reason}", format_remaining(*.remaining))]
    AccountLocked {
        until: DateTime<Utc>,
        remaining: Duration,
        reason: String,
    },
    #[error("Rate limited until {retry_at}")]
    RateLimited { retry_at: DateTime<Utc> },
    #[error("Two-factor code required")]
    TotpRequired,
    #[error("Invalid two-factor code ({attempts_remaining} attempts remaining)")]
    TotpInvalid { attempts_remaining: u32 },
    #[error("Invalid two-factor code")]
    InvalidCode,
    #[error("Too many two-factor attempts, log in again")]
    TotpMaxAttempts,
    #[error("Two-factor authentication is not enabled")]
    TotpNotEnabled,
    #[error("Two-factor authentication is already enabled")]
    TotpAlreadyEnabled,
    #[error("Two-factor setup has not been started")]
    TotpSetupMissing,
    #[error("Device blocked")]
    DeviceBlocked { reason: Option<String> },
    #[error("Device account limit reached ({count})")]
    DeviceLimitReached { count: i64 },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AuthError {
    /// Build a lock error, computing the remaining time from `now`.
    #[must_use]
    pub fn locked(until: DateTime<Utc>, now: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self::AccountLocked {
            until,
            remaining: (until - now).max(Duration::zero()),
            reason: reason.into(),
        }
    }
}

pub type AuthResult<T> = std::result::Result<T, AuthError>;

/// Human-readable remaining time: "42 seconds", "5 minutes", "2 hours 5 minutes".
#[must_use]
pub fn format_remaining(remaining: Duration) -> String {
    let seconds = remaining.num_seconds().max(0);
    if seconds < 60 {
        return plural(seconds, "second");
    }
    if seconds < 3600 {
        return plural(seconds / 60, "minute");
    }
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    if minutes > 0 {
        format!("{} {}", plural(hours, "hour"), plural(minutes, "minute"))
    } else {
        plural(hours, "hour")
    }
}

fn plural(value: i64, unit: &str) -> String {
    if value == 1 {
        format!("{value} {unit}")
    } else {
        format!("{value} {unit}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_remaining_picks_largest_units() {
        assert_eq!(format_remaining(Duration::seconds(42)), "42 seconds");
        assert_eq!(format_remaining(Duration::seconds(1)), "1 second");
        assert_eq!(format_remaining(Duration::minutes(5)), "5 minutes");
        assert_eq!(
            format_remaining(Duration::hours(2) + Duration::minutes(5)),
            "2 hours 5 minutes"
        );
        assert_eq!(format_remaining(Duration::days(7)), "168 hours");
        assert_eq!(format_remaining(Duration::seconds(-3)), "0 seconds");
    }

    #[test]
    fn locked_error_renders_remaining_time() {
        let now = Utc::now();
        let err = AuthError::locked(now + Duration::minutes(15), now, "too many failed attempts");
        assert_eq!(
            err.to_string(),
            "Account locked for 15 minutes: too many failed attempts"
        );
    }

    #[test]
    fn locked_error_never_goes_negative() {
        let now = Utc::now();
        let err = AuthError::locked(now - Duration::minutes(1), now, "expired");
        match err {
            AuthError::AccountLocked { remaining, .. } => assert_eq!(remaining, Duration::zero()),
            other => panic!("unexpected error: {other}"),
        }
    }
}
