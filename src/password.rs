//! Password hashing collaborator.

use anyhow::{Context, Result, anyhow};
use argon2::{
    Argon2, PasswordHash, PasswordHasher as _, PasswordVerifier as _, password_hash::SaltString,
};
use rand::rngs::OsRng;
use std::sync::Arc;

pub trait PasswordHasher: Send + Sync {
    /// # Errors
    /// Returns an error if hashing fails.
    fn hash(&self, password: &str) -> Result<String>;

    /// # Errors
    /// Returns an error if the stored hash cannot be parsed.
    fn verify(&self, password: &str, stored_hash: &str) -> Result<bool>;
}

/// Argon2id with the crate's default parameters, stored as PHC strings.
#[derive(Clone, Debug, Default)]
pub struct Argon2Hasher;

impl PasswordHasher for Argon2Hasher {
    fn hash(&self, password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|_| anyhow!("failed to hash password"))
    }

    fn verify(&self, password: &str, stored_hash: &str) -> Result<bool> {
        let parsed =
            PasswordHash::new(stored_hash).map_err(|_| anyhow!("invalid password hash"))?;
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    }
}

/// Verify on the blocking pool so slow hashing never stalls the runtime.
///
/// # Errors
/// Returns an error if the hash is malformed or the blocking task panics.
pub async fn verify_password(
    hasher: &Arc<dyn PasswordHasher>,
    password: &str,
    stored_hash: &str,
) -> Result<bool> {
    let hasher = Arc::clone(hasher);
    let password = password.to_string();
    let stored_hash = stored_hash.to_string();
    tokio::task::spawn_blocking(move || hasher.verify(&password, &stored_hash))
        .await
        .context("password verification task failed")?
}
