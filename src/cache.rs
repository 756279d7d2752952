use dashmap::DashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn new(value: V, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }
}

/// In-memory TTL cache with explicit invalidation and bypass semantics.
///
/// Owned by a single component per concern; callers that need fresh data
/// call `invalidate` (or skip `get`) rather than reaching around the cache.
#[derive(Debug)]
pub struct TtlCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
    default_ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
        }
    }

    /// Returns the cached value unless it is absent or past its TTL.
    /// Expired entries are removed on read.
    pub fn get(&self, key: &str) -> Option<V> {
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.insert_with_ttl(key, value, self.default_ttl);
    }

    pub fn insert_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        self.entries.insert(key.into(), CacheEntry::new(value, ttl));
    }

    /// Set-if-absent: returns `true` when the key was vacant or expired.
    /// This is the dedup primitive for webhook event ids.
    pub fn insert_if_absent(&self, key: impl Into<String>, value: V, ttl: Duration) -> bool {
        use dashmap::mapref::entry::Entry;

        match self.entries.entry(key.into()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(CacheEntry::new(value, ttl));
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry::new(value, ttl));
                true
            }
        }
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Drops every expired entry. Cheap enough to call opportunistically.
    pub fn purge_expired(&self) {
        self.entries.retain(|_, entry| !entry.is_expired());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_inserted_value() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.insert("k", 42);
        assert_eq!(cache.get("k"), Some(42));
    }

    #[test]
    fn expired_entries_are_not_returned() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.insert_with_ttl("k", 42, Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn insert_if_absent_dedups_live_keys() {
        let cache = TtlCache::new(Duration::from_secs(60));
        assert!(cache.insert_if_absent("evt_1", (), Duration::from_secs(60)));
        assert!(!cache.insert_if_absent("evt_1", (), Duration::from_secs(60)));
        assert!(cache.insert_if_absent("evt_2", (), Duration::from_secs(60)));
    }

    #[test]
    fn insert_if_absent_reclaims_expired_keys() {
        let cache = TtlCache::new(Duration::from_secs(60));
        assert!(cache.insert_if_absent("evt", (), Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.insert_if_absent("evt", (), Duration::from_secs(60)));
    }

    #[test]
    fn invalidate_forces_a_refresh_path() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.insert("options", vec!["standard"]);
        cache.invalidate("options");
        assert_eq!(cache.get("options"), None);
    }

    #[test]
    fn purge_expired_retains_live_entries() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.insert("live", 1);
        cache.insert_with_ttl("dead", 2, Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        cache.purge_expired();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("live"), Some(1));
    }
}
