//! Compatibility shim for backup codes written before `used_at` was nullable.
//!
//! Older rows mark "unused" with the zero timestamp `0001-01-01T00:00:00Z`
//! instead of NULL. Only the backup-code "unused" predicate accepts it; new
//! rows are always written with NULL. Run [`BACKFILL_ZERO_USED_AT_SQL`] once
//! and this module can go away.

use chrono::{DateTime, NaiveDate, Utc};

/// SQL predicate matching an unused backup code under either encoding.
pub const UNUSED_BACKUP_CODE_PREDICATE: &str =
    "(used_at IS NULL OR used_at = TIMESTAMPTZ '0001-01-01 00:00:00+00')";

/// One-time normalization of zero-timestamp rows to NULL.
pub const BACKFILL_ZERO_USED_AT_SQL: &str = "UPDATE totp_backup_codes SET used_at = NULL WHERE used_at = TIMESTAMPTZ '0001-01-01 00:00:00+00'";

/// The legacy zero timestamp.
#[must_use]
pub fn zero_timestamp() -> Option<DateTime<Utc>> {
    NaiveDate::from_ymd_opt(1, 1, 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// In-memory twin of [`UNUSED_BACKUP_CODE_PREDICATE`].
#[must_use]
pub fn is_unused(used_at: Option<DateTime<Utc>>) -> bool {
    match used_at {
        None => true,
        Some(at) => Some(at) == zero_timestamp(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_encodings_count_as_unused() {
        assert!(is_unused(None));
        assert!(is_unused(zero_timestamp()));
        assert!(!is_unused(Some(Utc::now())));
    }

    #[test]
    fn zero_timestamp_is_year_one() {
        let zero = zero_timestamp();
        assert_eq!(
            zero.map(|at| at.to_rfc3339()),
            Some("0001-01-01T00:00:00+00:00".to_string())
        );
    }
}
