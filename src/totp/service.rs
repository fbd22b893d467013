use super::backup::{candidate_hashes, generate_backup_codes, hash_backup_code};
use crate::audit::{SecurityAudit, SecurityEvent, SecurityEventType};
use crate::clock::SharedClock;
use crate::config::TotpConfig;
use crate::error::{AuthError, AuthResult};
use crate::password::{PasswordHasher, verify_password};
use crate::store::{PendingToken, TotpStore, UserStore};
use crate::tokens::{digests_match, generate_hex_token, hash_token};
use anyhow::{Context, Result, anyhow};
use std::sync::Arc;
use totp_rs::{Algorithm, Secret, TOTP};
use tracing::{debug, info};
use uuid::Uuid;

const PENDING_TOKEN_BYTES: usize = 32;

/// Build the TOTP generator for a base32 secret: SHA1, 6 digits, 30 s step,
/// one step of skew either way.
///
/// # Errors
/// Returns an error if the secret is not valid base32 or too short.
pub fn build_totp(secret_base32: &str, issuer: &str, account: &str) -> Result<TOTP> {
    let secret_bytes = Secret::Encoded(secret_base32.to_string())
        .to_bytes()
        .map_err(|e| anyhow!("TOTP secret decode error: {e:?}"))?;
    totp_from_bytes(secret_bytes, issuer, account)
}

fn totp_from_bytes(secret_bytes: Vec<u8>, issuer: &str, account: &str) -> Result<TOTP> {
    TOTP::new(
        Algorithm::SHA1,
        6,
        1,
        30,
        secret_bytes,
        Some(issuer.to_string()),
        account.to_string(),
    )
    .map_err(|e| anyhow!("TOTP init error: {e}"))
}

/// Secret and `otpauth://` URL handed to the user during setup.
#[derive(Clone, Debug)]
pub struct TotpSetup {
    pub secret: String,
    pub provisioning_url: String,
}

pub struct TotpService {
    config: TotpConfig,
    store: Arc<dyn TotpStore>,
    users: Arc<dyn UserStore>,
    hasher: Arc<dyn PasswordHasher>,
    audit: Arc<dyn SecurityAudit>,
    clock: SharedClock,
}

impl TotpService {
    #[must_use]
    pub fn new(
        config: TotpConfig,
        store: Arc<dyn TotpStore>,
        users: Arc<dyn UserStore>,
        hasher: Arc<dyn PasswordHasher>,
        audit: Arc<dyn SecurityAudit>,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            store,
            users,
            hasher,
            audit,
            clock,
        }
    }

    fn code_matches(&self, secret: &str, code: &str) -> Result<bool> {
        let code: String = code.chars().filter(|c| !c.is_whitespace()).collect();
        if code.len() != 6 || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(false);
        }
        let totp = build_totp(secret, &self.config.issuer, "user")?;
        let at = u64::try_from(self.clock.now().timestamp()).unwrap_or_default();
        Ok(totp.check(&code, at))
    }

    /// Start enrollment. The secret is stored but stays inactive until
    /// [`Self::verify_and_enable`] succeeds.
    ///
    /// # Errors
    /// `TotpAlreadyEnabled` when enrollment is complete, `Internal` on store
    /// failure.
    pub async fn generate_setup(&self, user_id: Uuid) -> AuthResult<TotpSetup> {
        if self
            .store
            .totp_state(user_id)
            .await?
            .is_some_and(|state| state.enabled)
        {
            return Err(AuthError::TotpAlreadyEnabled);
        }
        let user = self
            .users
            .find_user(user_id)
            .await?
            .ok_or_else(|| anyhow!("user {user_id} not found"))?;

        let secret_bytes = Secret::generate_secret()
            .to_bytes()
            .map_err(|e| anyhow!("Secret gen error: {e:?}"))?;
        let totp = totp_from_bytes(secret_bytes, &self.config.issuer, &user.email)?;
        let secret = totp.get_secret_base32();
        self.store
            .save_pending_secret(user_id, &secret)
            .await
            .context("Failed to store TOTP secret")?;

        debug!(user_id = %user_id, "TOTP setup started");
        Ok(TotpSetup {
            provisioning_url: totp.get_url(),
            secret,
        })
    }

    /// Confirm enrollment with a first code. Returns the plaintext backup
    /// codes; they are never available again.
    ///
    /// # Errors
    /// `TotpSetupMissing`, `TotpAlreadyEnabled` or `InvalidCode`.
    pub async fn verify_and_enable(&self, user_id: Uuid, code: &str) -> AuthResult<Vec<String>> {
        let state = self
            .store
            .totp_state(user_id)
            .await?
            .ok_or(AuthError::TotpSetupMissing)?;
        if state.enabled {
            return Err(AuthError::TotpAlreadyEnabled);
        }
        let secret = state.secret.ok_or(AuthError::TotpSetupMissing)?;

        if !self.code_matches(&secret, code)? {
            self.audit
                .record(
                    SecurityEvent::new(SecurityEventType::TotpFailed)
                        .user(user_id)
                        .details("invalid code during enrollment"),
                )
                .await;
            return Err(AuthError::InvalidCode);
        }

        let codes = generate_backup_codes(self.config.backup_code_count);
        let hashes: Vec<String> = codes.iter().map(|code| hash_backup_code(code)).collect();
        if !self
            .store
            .enable_totp(user_id, self.clock.now(), &hashes)
            .await?
        {
            return Err(AuthError::TotpAlreadyEnabled);
        }

        info!(user_id = %user_id, "TOTP enabled");
        self.audit
            .record(
                SecurityEvent::new(SecurityEventType::TotpEnabled)
                    .user(user_id)
                    .success()
                    .details(format!("{} backup codes issued", codes.len())),
            )
            .await;
        Ok(codes)
    }

    /// Check a code for an enrolled user.
    ///
    /// # Errors
    /// `TotpNotEnabled` when the user has no active secret.
    pub async fn verify(&self, user_id: Uuid, code: &str) -> AuthResult<bool> {
        let state = self.store.totp_state(user_id).await?;
        let Some(secret) = state
            .filter(crate::store::TotpState::is_active)
            .and_then(|state| state.secret)
        else {
            return Err(AuthError::TotpNotEnabled);
        };
        Ok(self.code_matches(&secret, code)?)
    }

    /// Turn 2FA off. Requires both the password and a current code.
    ///
    /// # Errors
    /// `InvalidCredentials` for a wrong password, `TotpNotEnabled`, or
    /// `InvalidCode`.
    pub async fn disable(&self, user_id: Uuid, password: &str, code: &str) -> AuthResult<()> {
        let user = self
            .users
            .find_user(user_id)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;
        if !verify_password(&self.hasher, password, &user.password_hash).await? {
            return Err(AuthError::InvalidCredentials);
        }
        if !self.verify(user_id, code).await? {
            return Err(AuthError::InvalidCode);
        }

        self.store
            .disable_totp(user_id)
            .await
            .context("Failed to disable TOTP")?;
        info!(user_id = %user_id, "TOTP disabled");
        self.audit
            .record(
                SecurityEvent::new(SecurityEventType::TotpDisabled)
                    .user(user_id)
                    .email(&user.email)
                    .success(),
            )
            .await;
        Ok(())
    }

    /// Consume a backup code. A code validates at most once.
    ///
    /// # Errors
    /// Returns an error if the store update fails.
    pub async fn verify_backup_code(&self, user_id: Uuid, code: &str) -> AuthResult<bool> {
        let hashes = candidate_hashes(code);
        if hashes.is_empty() {
            return Ok(false);
        }
        let consumed = self
            .store
            .consume_backup_code(user_id, &hashes, self.clock.now())
            .await?;
        if consumed {
            let (remaining, _) = self.store.backup_code_status(user_id).await?;
            self.audit
                .record(
                    SecurityEvent::new(SecurityEventType::BackupCodeUsed)
                        .user(user_id)
                        .success()
                        .details(format!("{remaining} backup codes remaining")),
                )
                .await;
        }
        Ok(consumed)
    }

    /// # Errors
    /// Returns an error if the store query fails.
    pub async fn is_enabled(&self, user_id: Uuid) -> Result<bool> {
        Ok(self
            .store
            .totp_state(user_id)
            .await?
            .is_some_and(|state| state.is_active()))
    }

    /// `(remaining, total)` backup codes.
    ///
    /// # Errors
    /// Returns an error if the store query fails.
    pub async fn backup_code_status(&self, user_id: Uuid) -> Result<(i64, i64)> {
        self.store.backup_code_status(user_id).await
    }

    /// Issue the token bridging a verified password to the second factor.
    /// Earlier pending tokens for the user are dropped.
    ///
    /// # Errors
    /// Returns an error if token generation or the store write fails.
    pub async fn create_pending_token(&self, user_id: Uuid) -> Result<String> {
        let raw = generate_hex_token(PENDING_TOKEN_BYTES)?;
        let now = self.clock.now();
        self.store
            .replace_pending_token(PendingToken {
                id: Uuid::now_v7(),
                user_id,
                token_hash: hash_token(&raw),
                expires_at: now + self.config.pending_token_ttl,
                used_at: None,
                created_at: now,
            })
            .await
            .context("Failed to store pending token")?;
        Ok(raw)
    }

    /// Resolve a pending token without consuming it, so a wrong code can be
    /// retried.
    ///
    /// # Errors
    /// `InvalidToken` when unknown or used, `TokenExpired` past its TTL.
    pub async fn validate_pending_token(&self, raw: &str) -> AuthResult<PendingToken> {
        let hash = hash_token(raw);
        let token = self
            .store
            .find_pending_token(&hash)
            .await?
            .ok_or(AuthError::InvalidToken("pending token not found"))?;
        if !digests_match(&token.token_hash, &hash) {
            return Err(AuthError::InvalidToken("pending token not found"));
        }
        if token.used_at.is_some() {
            return Err(AuthError::InvalidToken("pending token already used"));
        }
        if token.expires_at <= self.clock.now() {
            return Err(AuthError::TokenExpired);
        }
        Ok(token)
    }

    /// Burn a pending token after its second factor checked out.
    ///
    /// # Errors
    /// `InvalidToken` if a concurrent request consumed it first.
    pub async fn consume_pending_token(&self, token: &PendingToken) -> AuthResult<()> {
        if self
            .store
            .consume_pending_token(token.id, self.clock.now())
            .await?
        {
            Ok(())
        } else {
            Err(AuthError::InvalidToken("pending token already used"))
        }
    }

    /// Undo [`Self::consume_pending_token`] after the claimed factor failed.
    ///
    /// # Errors
    /// Returns an error if the store write fails.
    pub async fn release_pending_token(&self, token: &PendingToken) -> Result<()> {
        self.store.release_pending_token(token.id).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::clock::{Clock, ManualClock};
    use crate::password::Argon2Hasher;
    use crate::store::{MemoryStore, User};
    use chrono::Duration;

    struct Fixture {
        service: TotpService,
        store: Arc<MemoryStore>,
        clock: ManualClock,
        user_id: Uuid,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::default();
        let hasher: Arc<dyn PasswordHasher> = Arc::new(Argon2Hasher);
        let user = User::new("alice@example.com", hasher.hash("hunter22").unwrap());
        let user_id = user.id;
        store.insert_user(user).await;
        let shared: SharedClock = Arc::new(clock.clone());
        let service = TotpService::new(
            TotpConfig::default(),
            store.clone(),
            store.clone(),
            hasher,
            Arc::new(AuditLog::new(store.clone(), shared.clone())),
            shared,
        );
        Fixture {
            service,
            store,
            clock,
            user_id,
        }
    }

    fn code_at(secret: &str, clock: &ManualClock) -> String {
        build_totp(secret, "Warden", "user")
            .unwrap()
            .generate(u64::try_from(clock.now().timestamp()).unwrap())
    }

    async fn enrolled(f: &Fixture) -> (String, Vec<String>) {
        let setup = f.service.generate_setup(f.user_id).await.unwrap();
        let codes = f
            .service
            .verify_and_enable(f.user_id, &code_at(&setup.secret, &f.clock))
            .await
            .unwrap();
        (setup.secret, codes)
    }

    #[tokio::test]
    async fn setup_then_enable_issues_backup_codes() -> anyhow::Result<()> {
        let f = fixture().await;
        let setup = f.service.generate_setup(f.user_id).await?;
        assert!(setup.provisioning_url.starts_with("otpauth://totp/"));
        assert!(setup.provisioning_url.contains("issuer=Warden"));
        assert!(!f.service.is_enabled(f.user_id).await?);

        let codes = f
            .service
            .verify_and_enable(f.user_id, &code_at(&setup.secret, &f.clock))
            .await?;
        assert_eq!(codes.len(), 10);
        assert!(f.service.is_enabled(f.user_id).await?);
        assert_eq!(f.service.backup_code_status(f.user_id).await?, (10, 10));
        Ok(())
    }

    #[tokio::test]
    async fn setup_while_enabled_keeps_existing_secret() {
        let f = fixture().await;
        let (secret, _) = enrolled(&f).await;

        let err = f.service.generate_setup(f.user_id).await.unwrap_err();
        assert!(matches!(err, AuthError::TotpAlreadyEnabled));
        let state = f.store.totp_state(f.user_id).await.unwrap().unwrap();
        assert_eq!(state.secret, Some(secret));
    }

    #[tokio::test]
    async fn enable_without_setup_or_with_bad_code_fails() {
        let f = fixture().await;
        let err = f.service.verify_and_enable(f.user_id, "123456").await.unwrap_err();
        assert!(matches!(err, AuthError::TotpSetupMissing));

        f.service.generate_setup(f.user_id).await.unwrap();
        let err = f.service.verify_and_enable(f.user_id, "abcdef").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCode));
        assert!(!f.service.is_enabled(f.user_id).await.unwrap());
    }

    #[tokio::test]
    async fn verify_tolerates_one_step_of_skew() -> anyhow::Result<()> {
        let f = fixture().await;
        let (secret, _) = enrolled(&f).await;

        let code = code_at(&secret, &f.clock);
        assert!(f.service.verify(f.user_id, &code).await?);

        f.clock.advance(Duration::seconds(30));
        assert!(f.service.verify(f.user_id, &code).await?);

        f.clock.advance(Duration::seconds(60));
        assert!(!f.service.verify(f.user_id, &code).await?);
        Ok(())
    }

    #[tokio::test]
    async fn verify_requires_enrollment() {
        let f = fixture().await;
        let err = f.service.verify(f.user_id, "123456").await.unwrap_err();
        assert!(matches!(err, AuthError::TotpNotEnabled));
    }

    #[tokio::test]
    async fn backup_code_validates_once() -> anyhow::Result<()> {
        let f = fixture().await;
        let (_, codes) = enrolled(&f).await;

        let lowercase = codes[0].to_lowercase().replace('-', " ");
        assert!(f.service.verify_backup_code(f.user_id, &lowercase).await?);
        assert!(!f.service.verify_backup_code(f.user_id, &codes[0]).await?);
        assert!(!f.service.verify_backup_code(f.user_id, "").await?);
        assert_eq!(f.service.backup_code_status(f.user_id).await?, (9, 10));
        Ok(())
    }

    #[tokio::test]
    async fn disable_needs_password_and_code() -> anyhow::Result<()> {
        let f = fixture().await;
        let (secret, _) = enrolled(&f).await;
        let code = code_at(&secret, &f.clock);

        let err = f.service.disable(f.user_id, "wrong", &code).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
        let err = f.service.disable(f.user_id, "hunter22", "000000").await;
        if code != "000000" {
            assert!(matches!(err, Err(AuthError::InvalidCode)));
        }

        f.service.disable(f.user_id, "hunter22", &code).await?;
        assert!(!f.service.is_enabled(f.user_id).await?);
        assert_eq!(f.service.backup_code_status(f.user_id).await?, (0, 0));
        Ok(())
    }

    #[tokio::test]
    async fn pending_token_survives_until_consumed() -> anyhow::Result<()> {
        let f = fixture().await;
        let raw = f.service.create_pending_token(f.user_id).await?;
        assert_eq!(raw.len(), 64);

        let token = f.service.validate_pending_token(&raw).await?;
        let again = f.service.validate_pending_token(&raw).await?;
        assert_eq!(token.id, again.id);

        f.service.consume_pending_token(&token).await?;
        assert!(matches!(
            f.service.validate_pending_token(&raw).await,
            Err(AuthError::InvalidToken(_))
        ));
        assert!(matches!(
            f.service.consume_pending_token(&token).await,
            Err(AuthError::InvalidToken(_))
        ));

        f.service.release_pending_token(&token).await?;
        let released = f.service.validate_pending_token(&raw).await?;
        f.service.consume_pending_token(&released).await?;
        Ok(())
    }

    #[tokio::test]
    async fn pending_token_expires_and_is_replaced() -> anyhow::Result<()> {
        let f = fixture().await;
        let first = f.service.create_pending_token(f.user_id).await?;
        let second = f.service.create_pending_token(f.user_id).await?;
        assert!(matches!(
            f.service.validate_pending_token(&first).await,
            Err(AuthError::InvalidToken(_))
        ));

        f.clock.advance(Duration::minutes(5));
        assert!(matches!(
            f.service.validate_pending_token(&second).await,
            Err(AuthError::TokenExpired)
        ));
        Ok(())
    }
}
