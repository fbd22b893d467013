//! In-process cache whose entries expire after a fixed TTL.
//!
//! Entries are strictly derived from the durable store: a miss or an expired
//! hit always means "go ask the store".

use crate::clock::SharedClock;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::hash::Hash;
use tokio::sync::RwLock;

struct Entry<V> {
    value: V,
    expires_at: DateTime<Utc>,
}

pub struct TtlCache<K, V> {
    ttl: Duration,
    clock: SharedClock,
    entries: RwLock<HashMap<K, Entry<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    #[must_use]
    pub fn new(ttl: Duration, clock: SharedClock) -> Self {
        Self {
            ttl,
            clock,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone())
    }

    pub async fn insert(&self, key: K, value: V) {
        let expires_at = self.clock.now() + self.ttl;
        self.entries
            .write()
            .await
            .insert(key, Entry { value, expires_at });
    }

    pub async fn remove(&self, key: &K) -> Option<V> {
        self.entries
            .write()
            .await
            .remove(key)
            .map(|entry| entry.value)
    }

    /// Drop expired entries, returning how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    /// Number of stored entries, expired ones included until purged.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let clock = ManualClock::default();
        let cache = TtlCache::new(Duration::hours(24), Arc::new(clock.clone()));
        cache.insert("fp", 2_i64).await;
        assert_eq!(cache.get(&"fp").await, Some(2));

        clock.advance(Duration::hours(23));
        assert_eq!(cache.get(&"fp").await, Some(2));

        clock.advance(Duration::hours(2));
        assert_eq!(cache.get(&"fp").await, None);
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.purge_expired().await, 1);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn insert_refreshes_expiry() {
        let clock = ManualClock::default();
        let cache = TtlCache::new(Duration::minutes(10), Arc::new(clock.clone()));
        cache.insert("k", "a").await;
        clock.advance(Duration::minutes(8));
        cache.insert("k", "b").await;
        clock.advance(Duration::minutes(8));
        assert_eq!(cache.get(&"k").await, Some("b"));
        assert_eq!(cache.remove(&"k").await, Some("b"));
        assert_eq!(cache.get(&"k").await, None);
    }
}
