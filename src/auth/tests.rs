#![allow(clippy::unwrap_used)]

use super::*;
use crate::audit::AuditLog;
use crate::clock::{Clock, ManualClock, SharedClock};
use crate::config::{BackoffSchedule, DeviceConfig, LoginConfig, SessionConfig, TotpConfig};
use crate::device::{BanChecker, DeviceTracker, NoopBanChecker};
use crate::password::Argon2Hasher;
use crate::store::{AuditStore, MemoryStore};
use crate::totp::build_totp;
use async_trait::async_trait;
use secrecy::SecretString;
use std::sync::atomic::{AtomicUsize, Ordering};

const PASSWORD: &str = "correct horse battery";
const FINGERPRINT: &str = "canvas:abc|webgl:def";

struct StaticBan(BanStatus);

#[async_trait]
impl BanChecker for StaticBan {
    async fn check(&self, _fingerprint: &str) -> BanStatus {
        self.0.clone()
    }
}

/// Argon2 that counts how often a password was checked.
#[derive(Default)]
struct CountingHasher {
    verifications: AtomicUsize,
}

impl PasswordHasher for CountingHasher {
    fn hash(&self, password: &str) -> anyhow::Result<String> {
        Argon2Hasher.hash(password)
    }

    fn verify(&self, password: &str, stored_hash: &str) -> anyhow::Result<bool> {
        self.verifications.fetch_add(1, Ordering::SeqCst);
        Argon2Hasher.verify(password, stored_hash)
    }
}

struct Fixture {
    auth: Authenticator,
    hasher: Arc<CountingHasher>,
    totp: Arc<TotpService>,
    devices: Arc<DeviceTracker>,
    store: Arc<MemoryStore>,
    clock: ManualClock,
    user: User,
}

async fn fixture_with(ban: Arc<dyn BanChecker>, login: LoginConfig) -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let clock = ManualClock::default();
    let shared: SharedClock = Arc::new(clock.clone());
    let counting = Arc::new(CountingHasher::default());
    let hasher: Arc<dyn PasswordHasher> = counting.clone();
    let audit: Arc<dyn SecurityAudit> = Arc::new(AuditLog::new(store.clone(), shared.clone()));

    let user = User::new("Carol@Example.com", hasher.hash(PASSWORD).unwrap());
    store.insert_user(user.clone()).await;

    let attempts = Arc::new(LoginAttemptTracker::new(login, store.clone(), shared.clone()));
    let devices = Arc::new(DeviceTracker::new(
        DeviceConfig::default(),
        store.clone(),
        ban,
        audit.clone(),
        shared.clone(),
    ));
    let totp = Arc::new(TotpService::new(
        TotpConfig::default(),
        store.clone(),
        store.clone(),
        hasher.clone(),
        audit.clone(),
        shared.clone(),
    ));
    let sessions = Arc::new(SessionManager::new(
        SessionConfig::default(),
        store.clone(),
        store.clone(),
        store.clone(),
        Arc::new(crate::session::JwtIssuer::new(&SecretString::from(
            "authenticator-test-signing-key",
        ))),
        attempts.clone(),
        audit.clone(),
        shared.clone(),
    ));
    let auth = Authenticator::new(
        store.clone(),
        sessions,
        attempts,
        devices.clone(),
        totp.clone(),
        hasher,
        audit,
        shared,
    );
    Fixture {
        auth,
        hasher: counting,
        totp,
        devices,
        store,
        clock,
        user,
    }
}

async fn fixture() -> Fixture {
    let instant = BackoffSchedule::new(vec![std::time::Duration::ZERO]).unwrap();
    fixture_with(
        Arc::new(NoopBanChecker),
        LoginConfig::default().with_backoff(instant),
    )
    .await
}

fn request(email: &str, password: &str) -> LoginRequest {
    LoginRequest {
        email: email.to_string(),
        password: SecretString::from(password),
        device_fingerprint: Some(FINGERPRINT.to_string()),
        ip: "192.0.2.10".to_string(),
        user_agent: "Mozilla/5.0".to_string(),
    }
}

fn client() -> Client<'static> {
    Client {
        ip: "192.0.2.10",
        user_agent: "Mozilla/5.0",
        device_fingerprint: Some(FINGERPRINT),
    }
}

async fn event_types(f: &Fixture) -> Vec<SecurityEventType> {
    f.store
        .recent_events(f.user.id, 100)
        .await
        .unwrap()
        .into_iter()
        .map(|event| event.event_type)
        .collect()
}

async fn enroll(f: &Fixture) -> (String, Vec<String>) {
    let setup = f.totp.generate_setup(f.user.id).await.unwrap();
    let codes = f
        .totp
        .verify_and_enable(f.user.id, &code_now(&setup.secret, &f.clock))
        .await
        .unwrap();
    (setup.secret, codes)
}

fn code_now(secret: &str, clock: &ManualClock) -> String {
    build_totp(secret, "Warden", "user")
        .unwrap()
        .generate(u64::try_from(clock.now().timestamp()).unwrap())
}

async fn pending_token(f: &Fixture) -> String {
    match f.auth.login(request("carol@example.com", PASSWORD)).await.unwrap() {
        LoginOutcome::TotpRequired { pending_token } => pending_token,
        LoginOutcome::Authenticated(_) => panic!("second factor was skipped"),
    }
}

#[tokio::test]
async fn password_login_issues_tokens_and_records_device() -> anyhow::Result<()> {
    let f = fixture().await;
    let outcome = f.auth.login(request("  CAROL@example.com ", PASSWORD)).await?;
    let LoginOutcome::Authenticated(pair) = outcome else {
        panic!("expected tokens");
    };
    assert_eq!(pair.token_type, "Bearer");

    let hash = hash_fingerprint([FINGERPRINT]);
    assert_eq!(f.store.mapping_count(&hash).await, 1);
    assert_eq!(f.devices.user_devices(f.user.id).await?.len(), 1);
    assert!(f.store.user(f.user.id).await.unwrap().last_login_at.is_some());
    assert!(event_types(&f).await.contains(&SecurityEventType::LoginSuccess));
    Ok(())
}

#[tokio::test]
async fn unknown_email_and_wrong_password_look_the_same() -> anyhow::Result<()> {
    let f = fixture().await;
    let unknown = f.auth.login(request("nobody@example.com", PASSWORD)).await;
    let wrong = f.auth.login(request("carol@example.com", "nope")).await;

    let (Err(unknown), Err(wrong)) = (unknown, wrong) else {
        panic!("both logins must fail");
    };
    assert!(matches!(unknown, AuthError::InvalidCredentials));
    assert_eq!(unknown.to_string(), wrong.to_string());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn repeated_failures_lock_the_account() -> anyhow::Result<()> {
    let f = fixture_with(
        Arc::new(NoopBanChecker),
        LoginConfig::default().with_lock_threshold(3),
    )
    .await;

    for _ in 0..3 {
        assert!(matches!(
            f.auth.login(request("carol@example.com", "wrong")).await,
            Err(AuthError::InvalidCredentials)
        ));
    }

    let stored = f.store.user(f.user.id).await.unwrap();
    assert!(stored.is_locked(f.clock.now()));
    let checked = f.hasher.verifications.load(Ordering::SeqCst);
    assert_eq!(checked, 3);

    match f.auth.login(request("carol@example.com", PASSWORD)).await {
        Err(AuthError::AccountLocked { remaining, .. }) => {
            assert_eq!(remaining, chrono::Duration::minutes(15));
        }
        other => panic!("expected lock, got {other:?}"),
    }
    assert_eq!(f.hasher.verifications.load(Ordering::SeqCst), checked);

    let events = event_types(&f).await;
    assert!(events.contains(&SecurityEventType::BruteForceDetected));
    assert!(events.contains(&SecurityEventType::AccountLocked));
    Ok(())
}

#[tokio::test]
async fn totp_login_consumes_pending_token_once() -> anyhow::Result<()> {
    let f = fixture().await;
    let (secret, _) = enroll(&f).await;
    let pending = pending_token(&f).await;

    let code = code_now(&secret, &f.clock);
    let pair = f.auth.complete_totp_login(&pending, &code, client()).await?;
    assert!(!pair.access_token.is_empty());

    assert!(matches!(
        f.auth.complete_totp_login(&pending, &code, client()).await,
        Err(AuthError::InvalidToken(_))
    ));
    Ok(())
}

#[tokio::test]
async fn wrong_codes_exhaust_second_factor_attempts() -> anyhow::Result<()> {
    let f = fixture().await;
    let (secret, _) = enroll(&f).await;
    let pending = pending_token(&f).await;

    assert!(matches!(
        f.auth.complete_totp_login(&pending, "12345", client()).await,
        Err(AuthError::TotpInvalid { attempts_remaining: 2 })
    ));
    assert!(matches!(
        f.auth.complete_totp_login(&pending, "abcdef", client()).await,
        Err(AuthError::TotpInvalid { attempts_remaining: 1 })
    ));
    assert!(matches!(
        f.auth.complete_totp_login(&pending, "", client()).await,
        Err(AuthError::TotpMaxAttempts)
    ));

    let code = code_now(&secret, &f.clock);
    assert!(matches!(
        f.auth.complete_totp_login(&pending, &code, client()).await,
        Err(AuthError::TotpMaxAttempts)
    ));
    let max_attempts = event_types(&f)
        .await
        .into_iter()
        .filter(|event| *event == SecurityEventType::TotpMaxAttempts)
        .count();
    assert_eq!(max_attempts, 2);
    Ok(())
}

#[tokio::test]
async fn backup_code_completes_login_once() -> anyhow::Result<()> {
    let f = fixture().await;
    let (_, codes) = enroll(&f).await;

    let pending = pending_token(&f).await;
    f.auth
        .complete_backup_code_login(&pending, &codes[0].to_lowercase(), client())
        .await?;

    let pending = pending_token(&f).await;
    assert!(matches!(
        f.auth.complete_backup_code_login(&pending, &codes[0], client()).await,
        Err(AuthError::TotpInvalid { .. })
    ));
    assert_eq!(f.totp.backup_code_status(f.user.id).await?, (9, 10));
    Ok(())
}

#[tokio::test]
async fn backup_codes_are_not_burned_without_the_pending_token() -> anyhow::Result<()> {
    let f = fixture().await;
    let (_, codes) = enroll(&f).await;
    let pending = pending_token(&f).await;

    assert!(matches!(
        f.auth.complete_backup_code_login(&pending, "zzzz-zzzz", client()).await,
        Err(AuthError::TotpInvalid { attempts_remaining: 2 })
    ));

    let (first, second) = tokio::join!(
        f.auth.complete_backup_code_login(&pending, &codes[1], client()),
        f.auth.complete_backup_code_login(&pending, &codes[2], client()),
    );
    let loser = match (first, second) {
        (Ok(_), Err(err)) | (Err(err), Ok(_)) => err,
        other => panic!("exactly one login must win, got {other:?}"),
    };
    assert!(matches!(loser, AuthError::InvalidToken(_)));
    assert_eq!(f.totp.backup_code_status(f.user.id).await?, (9, 10));
    Ok(())
}

#[tokio::test]
async fn expired_pending_token_is_rejected() -> anyhow::Result<()> {
    let f = fixture().await;
    let (secret, _) = enroll(&f).await;
    let pending = pending_token(&f).await;

    f.clock.advance(chrono::Duration::minutes(6));
    let code = code_now(&secret, &f.clock);
    assert!(matches!(
        f.auth.complete_totp_login(&pending, &code, client()).await,
        Err(AuthError::TokenExpired)
    ));
    Ok(())
}

#[tokio::test]
async fn blocked_and_banned_devices_cannot_log_in() -> anyhow::Result<()> {
    let f = fixture().await;
    f.devices
        .block_device(&hash_fingerprint([FINGERPRINT]), "chargeback fraud")
        .await?;
    match f.auth.login(request("carol@example.com", PASSWORD)).await {
        Err(AuthError::DeviceBlocked { reason }) => {
            assert_eq!(reason.as_deref(), Some("chargeback fraud"));
        }
        other => panic!("expected block, got {other:?}"),
    }

    let banned = fixture_with(
        Arc::new(StaticBan(BanStatus::Banned {
            message: Some("banned by moderation".to_string()),
        })),
        LoginConfig::default(),
    )
    .await;
    assert!(matches!(
        banned.auth.login(request("carol@example.com", PASSWORD)).await,
        Err(AuthError::DeviceBlocked { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn ban_service_outage_fails_open() -> anyhow::Result<()> {
    let f = fixture_with(Arc::new(StaticBan(BanStatus::Unknown)), LoginConfig::default()).await;
    let outcome = f.auth.login(request("carol@example.com", PASSWORD)).await?;
    assert!(matches!(outcome, LoginOutcome::Authenticated(_)));
    Ok(())
}

#[tokio::test]
async fn device_registration_honors_account_limit() -> anyhow::Result<()> {
    let f = fixture().await;
    let (a, b, c) = (Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7());

    let first = f.auth.register_device(a, FINGERPRINT, "ip", "ua").await?.unwrap();
    assert_eq!(first.account_count, 1);
    let again = f.auth.register_device(a, FINGERPRINT, "ip", "ua").await?.unwrap();
    assert_eq!(again.account_count, 1);
    f.auth.register_device(b, FINGERPRINT, "ip", "ua").await?;

    match f.auth.register_device(c, FINGERPRINT, "ip", "ua").await {
        Err(AuthError::DeviceLimitReached { count }) => assert_eq!(count, 2),
        other => panic!("expected limit, got {other:?}"),
    }
    assert!(f.auth.register_device(c, "", "ip", "ua").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn banned_device_cannot_register_accounts() -> anyhow::Result<()> {
    let f = fixture_with(
        Arc::new(StaticBan(BanStatus::Banned {
            message: Some("ban evasion".to_string()),
        })),
        LoginConfig::default(),
    )
    .await;

    match f.auth.register_device(Uuid::now_v7(), FINGERPRINT, "ip", "ua").await {
        Err(AuthError::DeviceBlocked { reason }) => {
            assert_eq!(reason.as_deref(), Some("ban evasion"));
        }
        other => panic!("expected ban, got {other:?}"),
    }
    assert_eq!(f.store.mapping_count(&hash_fingerprint([FINGERPRINT])).await, 0);

    let outage = fixture_with(Arc::new(StaticBan(BanStatus::Unknown)), LoginConfig::default()).await;
    assert!(
        outage
            .auth
            .register_device(Uuid::now_v7(), FINGERPRINT, "ip", "ua")
            .await?
            .is_some()
    );
    Ok(())
}
