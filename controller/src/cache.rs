//! TTL cache for simulation results, keyed by pod UID.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{event, Level};

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// A small concurrent map where every entry carries its own TTL. Expired entries
/// are invisible to readers immediately and physically removed by the cleanup loop.
#[derive(Clone)]
pub struct TtlCache<V> {
    entries: Arc<RwLock<HashMap<String, Entry<V>>>>,
}

impl<V: Clone + Send + Sync + 'static> TtlCache<V> {
    pub fn new() -> Self {
        TtlCache {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value.clone())
    }

    pub fn insert(&self, key: &str, value: V, ttl: Duration) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn purge_expired(&self) {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, entry| entry.expires_at > now);
    }

    /// Runs the periodic cleanup until the returned future is dropped.
    pub async fn run_cleanup(self, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            self.purge_expired();
            event!(Level::TRACE, "Purged expired simulation cache entries.");
        }
    }
}

impl<V: Clone + Send + Sync + 'static> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_individually() {
        let cache = TtlCache::new();
        cache.insert("short", 1u32, Duration::from_secs(60));
        cache.insert("long", 2u32, Duration::from_secs(180));

        assert_eq!(cache.get("short"), Some(1));
        assert_eq!(cache.get("long"), Some(2));
        assert_eq!(cache.get("missing"), None);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get("short"), None);
        assert_eq!(cache.get("long"), Some(2));

        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(cache.get("long"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_refreshes_ttl() {
        let cache = TtlCache::new();
        cache.insert("key", 1u32, Duration::from_secs(60));
        tokio::time::advance(Duration::from_secs(50)).await;
        cache.insert("key", 2u32, Duration::from_secs(60));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(cache.get("key"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_removes_expired_entries() {
        let cache = TtlCache::new();
        cache.insert("gone", 1u32, Duration::from_secs(10));
        assert_eq!(cache.len(), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        cache.purge_expired();
        assert_eq!(cache.len(), 0);
    }
}
