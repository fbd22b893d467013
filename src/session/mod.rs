//! Refresh-token rotation, reuse detection and access-token validation.

mod access;
mod anomaly;
mod manager;

pub use access::{AccessTokenIssuer, Claims, JwtIssuer};
pub use anomaly::{MAX_SESSIONS_PER_HOUR, REUSE_REVOKE_REASON, SessionSecurityStats};
pub use manager::{SessionManager, TokenPair};
