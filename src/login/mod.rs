//! Progressive backoff and lockout for password and second-factor attempts.

mod tracker;

pub use tracker::{FailedLogin, LoginAttemptTracker};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Lockout view for code that must not depend on the concrete tracker.
#[async_trait]
pub trait LoginLockout: Send + Sync {
    async fn locked_until(&self, identifier: &str) -> Option<DateTime<Utc>>;

    async fn record_failure(&self, identifier: &str, ip: &str) -> FailedLogin;

    async fn reset(&self, identifier: &str);
}

#[async_trait]
impl LoginLockout for LoginAttemptTracker {
    async fn locked_until(&self, identifier: &str) -> Option<DateTime<Utc>> {
        LoginAttemptTracker::locked_until(self, identifier).await
    }

    async fn record_failure(&self, identifier: &str, ip: &str) -> FailedLogin {
        self.record_failed_login(identifier, ip).await
    }

    async fn reset(&self, identifier: &str) {
        self.reset_attempts(identifier).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::LoginConfig;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn tracker_behind_trait_object() {
        let clock = ManualClock::default();
        let lockout: Arc<dyn LoginLockout> = Arc::new(LoginAttemptTracker::new(
            LoginConfig::default().with_lock_threshold(2),
            Arc::new(MemoryStore::new()),
            Arc::new(clock.clone()),
        ));

        assert!(!lockout.record_failure("x", "ip").await.should_lock);
        assert!(lockout.record_failure("x", "ip").await.should_lock);
        assert!(lockout.locked_until("x").await.is_some());

        lockout.reset("x").await;
        assert!(lockout.locked_until("x").await.is_none());
    }
}
