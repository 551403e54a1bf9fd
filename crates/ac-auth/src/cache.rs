use std::borrow::Borrow;
use std::hash::Hash;
use std::time::Duration;

use dashmap::DashMap;
use tracing::trace;

use crate::config::CacheTtls;
use crate::session::{LoginResult, XblAuth};

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A cached value and the instant it stops being valid
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry<T> {
    pub value: T,
    pub expires_at_ms: i64,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T, ttl: Duration) -> Self {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        Self {
            value,
            expires_at_ms: now_millis().saturating_add(ttl_ms),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(now_millis())
    }

    pub fn is_valid_at(&self, now_ms: i64) -> bool {
        now_ms < self.expires_at_ms
    }
}

/// Concurrent key/value store whose entries expire after a TTL.
///
/// Expiry is lazy: every lookup checks the entry and drops it once stale.
/// There is no background sweeper; [`purge_expired`](Self::purge_expired)
/// can be called to sweep explicitly.
#[derive(Debug)]
pub struct TokenCache<K, V>
where
    K: Eq + Hash,
{
    name: &'static str,
    default_ttl: Duration,
    entries: DashMap<K, CacheEntry<V>>,
}

impl<K, V> TokenCache<K, V>
where
    K: Eq + Hash,
{
    pub fn new(name: &'static str, default_ttl: Duration) -> Self {
        Self {
            name,
            default_ttl,
            entries: DashMap::new(),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Value for `key` if present and unexpired
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        let now = now_millis();
        match self.entries.get(key) {
            Some(entry) if entry.is_valid_at(now) => return Some(entry.value.clone()),
            Some(_) => {}
            None => return None,
        }

        // the read guard is released above; a writer may have refreshed the entry since
        if self
            .entries
            .remove_if(key, |_, entry| !entry.is_valid_at(now))
            .is_some()
        {
            trace!(cache = self.name, "evicted expired entry");
        }
        None
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries
            .get(key)
            .is_some_and(|entry| entry.is_valid())
    }

    /// Insert or overwrite with an explicit TTL
    pub fn put(&self, key: K, value: V, ttl: Duration) {
        self.entries.insert(key, CacheEntry::new(value, ttl));
    }

    /// Insert or overwrite with the cache's configured TTL
    pub fn insert(&self, key: K, value: V) {
        self.put(key, value, self.default_ttl);
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.remove(key).map(|(_, entry)| entry.value)
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of unexpired entries
    pub fn len(&self) -> usize {
        let now = now_millis();
        self.entries
            .iter()
            .filter(|entry| entry.is_valid_at(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = now_millis();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_valid_at(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            trace!(cache = self.name, removed, "purged expired entries");
        }
        removed
    }
}

/// The three caches consulted by the login chain
#[derive(Debug)]
pub struct AuthCaches {
    /// Full login results keyed by the refresh token the caller presented
    pub login_data: TokenCache<String, LoginResult>,
    /// XBL auth keyed by Microsoft access token
    pub xbl: TokenCache<String, XblAuth>,
    /// Minecraft access tokens keyed by account uuid
    pub mc: TokenCache<String, String>,
}

impl AuthCaches {
    pub fn new(ttls: &CacheTtls) -> Self {
        Self {
            login_data: TokenCache::new("login_data", ttls.login_data),
            xbl: TokenCache::new("xbl", ttls.xbl),
            mc: TokenCache::new("mc", ttls.mc),
        }
    }

    pub fn clear(&self) {
        self.login_data.clear();
        self.xbl.clear();
        self.mc.clear();
    }
}

impl Default for AuthCaches {
    fn default() -> Self {
        Self::new(&CacheTtls::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_get_returns_unexpired_value() {
        let cache: TokenCache<String, String> = TokenCache::new("test", HOUR);
        cache.insert("k".to_string(), "v".to_string());

        assert_eq!(cache.get("k"), Some("v".to_string()));
        assert!(cache.contains_key("k"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_expired_entry_is_absent_and_evicted() {
        let cache: TokenCache<String, u32> = TokenCache::new("test", HOUR);
        cache.put("k".to_string(), 7, Duration::ZERO);

        assert_eq!(cache.get("k"), None);
        assert!(!cache.contains_key("k"));
        assert!(cache.is_empty());
        // lazily evicted by the lookup above
        assert_eq!(cache.remove("k"), None);
    }

    #[test]
    fn test_put_overwrites_expired_entry() {
        let cache: TokenCache<String, u32> = TokenCache::new("test", HOUR);
        cache.put("k".to_string(), 1, Duration::ZERO);
        cache.put("k".to_string(), 2, HOUR);

        assert_eq!(cache.get("k"), Some(2));
    }

    #[test]
    fn test_remove_and_clear() {
        let cache: TokenCache<String, u32> = TokenCache::new("test", HOUR);
        cache.insert("a".to_string(), 1);
        cache.insert("b".to_string(), 2);

        assert_eq!(cache.remove("a"), Some(1));
        assert_eq!(cache.get("a"), None);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_purge_expired_keeps_live_entries() {
        let cache: TokenCache<String, u32> = TokenCache::new("test", HOUR);
        cache.put("old".to_string(), 1, Duration::ZERO);
        cache.put("older".to_string(), 2, Duration::ZERO);
        cache.insert("live".to_string(), 3);

        assert_eq!(cache.purge_expired(), 2);
        assert_eq!(cache.get("live"), Some(3));
    }

    #[test]
    fn test_entry_validity_boundary() {
        let entry = CacheEntry {
            value: (),
            expires_at_ms: 1_000,
        };
        assert!(entry.is_valid_at(999));
        assert!(!entry.is_valid_at(1_000));
    }

    #[test]
    fn test_concurrent_writers_and_readers() {
        let cache: Arc<TokenCache<String, usize>> = Arc::new(TokenCache::new("test", HOUR));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let key = format!("{t}-{i}");
                        cache.insert(key.clone(), i);
                        assert_eq!(cache.get(&key), Some(i));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 800);
    }

    #[test]
    fn test_auth_caches_use_configured_ttls() {
        let caches = AuthCaches::default();
        assert_eq!(caches.login_data.default_ttl(), Duration::from_secs(23 * 3600));
        assert_eq!(caches.xbl.default_ttl(), Duration::from_secs(12 * 3600));
        assert_eq!(caches.mc.default_ttl(), Duration::from_secs(23 * 3600));

        caches.mc.insert("uuid".to_string(), "mc".to_string());
        caches.clear();
        assert!(caches.mc.is_empty());
    }
}
