use crate::store::Session;
use serde::Serialize;
use std::collections::HashSet;

/// Sessions created within the last hour above which a user looks automated.
pub const MAX_SESSIONS_PER_HOUR: usize = 10;

/// Marker written as the revoke reason when a family is torn down for reuse.
pub const REUSE_REVOKE_REASON: &str = "token reuse detected";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SessionSecurityStats {
    pub active_sessions: usize,
    pub sessions_last_30_days: usize,
    pub revoked_last_30_days: usize,
    pub unique_ips_last_30_days: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anomaly: Option<String>,
}

pub(crate) fn distinct_ips<'a>(sessions: impl IntoIterator<Item = &'a Session>) -> usize {
    sessions
        .into_iter()
        .map(|session| session.ip_address.as_str())
        .filter(|ip| !ip.is_empty())
        .collect::<HashSet<_>>()
        .len()
}

/// First suspicious pattern found, if any.
pub(crate) fn detect(
    created_last_hour: &[Session],
    revoked_last_day: &[Session],
    ip_threshold: usize,
) -> Option<String> {
    if created_last_hour.len() > MAX_SESSIONS_PER_HOUR {
        return Some(format!(
            "{} sessions created in the last hour",
            created_last_hour.len()
        ));
    }

    let ips = distinct_ips(created_last_hour);
    if ips >= ip_threshold {
        return Some(format!("{ips} distinct IP addresses in the last hour"));
    }

    if revoked_last_day.iter().any(|session| {
        session
            .revoke_reason
            .as_deref()
            .is_some_and(|reason| reason.contains(REUSE_REVOKE_REASON))
    }) {
        return Some("refresh token reuse in the last 24 hours".to_string());
    }

    None
}
