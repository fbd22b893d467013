//! Second factor: TOTP enrollment and verification, backup codes, and the
//! pending token that bridges a verified password to the code prompt.

pub mod backup;
mod service;

pub use service::{TotpService, TotpSetup, build_totp};

/// Second factor offered after a password check.
#[derive(Clone, Copy, Debug)]
pub enum SecondFactor<'a> {
    Totp(&'a str),
    BackupCode(&'a str),
}
