//! Random token generation and hashing.
//!
//! Raw tokens are only handed to the caller; storage only ever sees the
//! SHA-256 hex digest.

use anyhow::{Context, Result};
use base64::Engine;
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};

const OPAQUE_TOKEN_BYTES: usize = 32;
const TOKEN_FAMILY_BYTES: usize = 16;

/// Create a URL-safe opaque token (refresh tokens).
pub fn generate_opaque_token() -> Result<String> {
    let mut bytes = [0u8; OPAQUE_TOKEN_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate opaque token")?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

/// Create a hex token of `len` random bytes (pending and sudo tokens).
pub fn generate_hex_token(len: usize) -> Result<String> {
    let mut bytes = vec![0u8; len];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate hex token")?;
    Ok(hex::encode(bytes))
}

/// New identifier grouping every rotation descended from one login.
pub fn generate_token_family() -> Result<String> {
    generate_hex_token(TOKEN_FAMILY_BYTES)
}

/// SHA-256 hex digest of a token.
#[must_use]
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compare two digests without short-circuiting on the first mismatch.
#[must_use]
pub fn digests_match(left: &str, right: &str) -> bool {
    let (left, right) = (left.as_bytes(), right.as_bytes());
    if left.len() != right.len() {
        return false;
    }
    left.iter()
        .zip(right)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Cut a user agent to at most `max` characters on a char boundary.
#[must_use]
pub fn truncate_user_agent(user_agent: &str, max: usize) -> String {
    user_agent.chars().take(max).collect()
}
