//! # Warden (credential and session security core)
//!
//! `warden` holds the pieces of an identity service that decide whether a
//! credential is still trustworthy. It does not serve HTTP; callers wire the
//! services below into their own handlers.
//!
//! ## Sessions
//!
//! Every login starts a token family. Refresh tokens are opaque, stored only
//! as SHA-256 digests, and rotate on each use through a single
//! compare-and-set in the store. A consumed token presented again inside a
//! short grace period is treated as a client retry; past it, the whole family
//! is revoked and the account locked.
//!
//! ## Brute force and devices
//!
//! - **Login attempts:** in-memory counters with progressive backoff and a
//!   lock threshold, mirrored onto the user row when the lock trips.
//! - **Devices:** fingerprints are hashed and mapped to accounts, capping how
//!   many accounts one device may register. An optional admin ban service is
//!   consulted first; when it cannot answer, the login proceeds.
//!
//! ## Second factor and re-authentication
//!
//! TOTP (RFC 6238) with single-use backup codes, a pending token bridging the
//! password and code steps, and short-lived sudo grants for high-risk actions.
//!
//! Every outcome worth investigating lands in the [`audit`] log.

pub mod audit;
pub mod auth;
pub mod cache;
pub mod cli;
pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod login;
pub mod password;
pub mod services;
pub mod session;
pub mod store;
pub mod sudo;
pub mod sweeper;
pub mod tokens;
pub mod totp;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
