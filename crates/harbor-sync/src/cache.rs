//! # TTL Cache
//!
//! Process-scoped cache for configuration lookups (branch bindings) with a
//! fixed time-to-live and explicit invalidation.
//!
//! Entries expire lazily on read. Uses `tokio::time::Instant` so tests can
//! drive expiry with a paused clock.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

struct Slot<V> {
    value: V,
    stored_at: Instant,
}

/// A keyed cache whose entries are trusted for `ttl` after insertion.
pub struct TtlCache<K, V> {
    ttl: Duration,
    slots: RwLock<HashMap<K, Slot<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        TtlCache {
            ttl,
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns a fresh value, dropping it if it has expired.
    pub async fn get(&self, key: &K) -> Option<V> {
        {
            let slots = self.slots.read().await;
            match slots.get(key) {
                Some(slot) if slot.stored_at.elapsed() < self.ttl => {
                    return Some(slot.value.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }

        // Expired: take the write lock and re-check, another task may have
        // refreshed it meanwhile.
        let mut slots = self.slots.write().await;
        match slots.get(key) {
            Some(slot) if slot.stored_at.elapsed() < self.ttl => Some(slot.value.clone()),
            Some(_) => {
                slots.remove(key);
                None
            }
            None => None,
        }
    }

    pub async fn insert(&self, key: K, value: V) {
        self.slots.write().await.insert(
            key,
            Slot {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    /// Drops one key. Returns true if it was cached.
    pub async fn invalidate(&self, key: &K) -> bool {
        self.slots.write().await.remove(key).is_some()
    }

    pub async fn clear(&self) {
        self.slots.write().await.clear();
    }

    /// Removes every expired entry. Returns how many were dropped.
    pub async fn purge_expired(&self) -> usize {
        let mut slots = self.slots.write().await;
        let before = slots.len();
        let ttl = self.ttl;
        slots.retain(|_, slot| slot.stored_at.elapsed() < ttl);
        before - slots.len()
    }

    /// Number of stored entries, expired ones included.
    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.insert("lisbon", 1).await;
        assert_eq!(cache.get(&"lisbon").await, Some(1));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get(&"lisbon").await, None);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_invalidate_and_clear() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.insert("lisbon", "a").await;
        cache.insert("porto", "b").await;

        assert!(cache.invalidate(&"lisbon").await);
        assert!(!cache.invalidate(&"lisbon").await);
        assert_eq!(cache.get(&"porto").await, Some("b"));

        cache.clear().await;
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_keeps_fresh_entries() {
        let cache = TtlCache::new(Duration::from_secs(10));
        cache.insert(1, "old").await;
        tokio::time::advance(Duration::from_secs(8)).await;
        cache.insert(2, "new").await;
        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(cache.purge_expired().await, 1);
        assert_eq!(cache.get(&2).await, Some("new"));
    }
}
