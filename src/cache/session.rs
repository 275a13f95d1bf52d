//! Domain-keyed session cache with per-domain TTL.
//!
//! Values are stored as `{data, timestamp}` under `domain` or
//! `domain_{scope}`.  Reads never extend an entry's lifetime.  Storage
//! failures and corrupt records degrade to a miss; nothing here returns an
//! error to the caller.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::policy::policy_for;
use super::store::Store;
use crate::clock::SharedClock;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub data: T,
    pub timestamp: i64,
}

/// `domain` alone, or `domain_{scope}` when scoped.
pub fn storage_key(domain: &str, scope: Option<&str>) -> String {
    match scope {
        Some(scope) if !scope.is_empty() => format!("{domain}_{scope}"),
        _ => domain.to_string(),
    }
}

#[derive(Clone)]
pub struct SessionCache {
    store: Arc<dyn Store>,
    clock: SharedClock,
}

impl SessionCache {
    pub fn new(store: Arc<dyn Store>, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn set_cache<T: Serialize>(&self, domain: &str, data: &T, scope: Option<&str>) {
        let key = storage_key(domain, scope);
        let entry = CacheEntry {
            data,
            timestamp: self.clock.now_millis(),
        };
        let json = match serde_json::to_string(&entry) {
            Ok(json) => json,
            Err(e) => {
                warn!(key, error = %e, "cache value not serialisable, skipping write");
                return;
            }
        };
        if let Err(e) = self.store.set(&key, &json) {
            warn!(key, error = %e, "cache write failed");
        }
    }

    /// The cached value, or `None` when absent, expired, or unreadable.
    /// Expired and corrupt records are removed.
    pub fn get_cache<T: DeserializeOwned>(&self, domain: &str, scope: Option<&str>) -> Option<T> {
        let key = storage_key(domain, scope);
        let raw = match self.store.get(&key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(key, error = %e, "cache read failed");
                return None;
            }
        };

        let entry: CacheEntry<T> = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key, error = %e, "corrupt cache record, purging");
                self.remove_key(&key);
                return None;
            }
        };

        let age = self.clock.now_millis().saturating_sub(entry.timestamp);
        if policy_for(domain).is_expired(age) {
            debug!(key, age_ms = age, "cache entry expired");
            self.remove_key(&key);
            return None;
        }
        Some(entry.data)
    }

    pub fn invalidate_cache(&self, domain: &str, scope: Option<&str>) {
        self.remove_key(&storage_key(domain, scope));
    }

    /// Drop every record in the backing store.
    pub fn clear_all(&self) {
        match self.store.clear() {
            Ok(()) => debug!("cache cleared"),
            Err(e) => warn!(error = %e, "cache clear failed"),
        }
    }

    fn remove_key(&self, key: &str) {
        if let Err(e) = self.store.remove(key) {
            warn!(key, error = %e, "cache remove failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::policy::domain;
    use crate::cache::store::MemoryStore;
    use crate::clock::ManualClock;
    use serde_json::json;

    const MINUTE: i64 = 60_000;

    fn cache() -> (SessionCache, Arc<MemoryStore>, ManualClock) {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(1_700_000_000_000);
        let cache = SessionCache::new(store.clone(), Arc::new(clock.clone()));
        (cache, store, clock)
    }

    #[test]
    fn round_trip() {
        let (cache, _, _) = cache();
        let data = json!({"login": "octo", "repos": [1, 2, 3], "nested": {"a": null}});
        cache.set_cache(domain::USER_PROFILE, &data, None);
        assert_eq!(
            cache.get_cache::<serde_json::Value>(domain::USER_PROFILE, None),
            Some(data)
        );
    }

    #[test]
    fn scope_isolates_keys() {
        let (cache, store, _) = cache();
        cache.set_cache(domain::REPOS, &vec!["a"], Some("u1"));
        cache.set_cache(domain::REPOS, &vec!["b"], Some("u2"));
        assert_eq!(cache.get_cache::<Vec<String>>(domain::REPOS, Some("u1")), Some(vec!["a".into()]));
        assert_eq!(cache.get_cache::<Vec<String>>(domain::REPOS, None), None);
        assert!(store.get("repos_u2").unwrap().is_some());
    }

    #[test]
    fn ttl_boundary() {
        let (cache, store, clock) = cache();
        cache.set_cache(domain::REPOS, &1, None);

        clock.advance(5 * MINUTE);
        assert_eq!(cache.get_cache::<i32>(domain::REPOS, None), Some(1));

        clock.advance(1);
        assert_eq!(cache.get_cache::<i32>(domain::REPOS, None), None);
        assert!(store.get("repos").unwrap().is_none());
    }

    #[test]
    fn ancient_timestamp_expires_without_overflow() {
        let (cache, store, _) = cache();
        store
            .set("repos", r#"{"data": 1, "timestamp": -9223372036854775808}"#)
            .unwrap();
        assert_eq!(cache.get_cache::<i32>(domain::REPOS, None), None);
        assert!(store.get("repos").unwrap().is_none());
    }

    #[test]
    fn reads_do_not_extend_lifetime() {
        let (cache, _, clock) = cache();
        cache.set_cache(domain::REPOS, &1, None);
        clock.advance(4 * MINUTE);
        assert!(cache.get_cache::<i32>(domain::REPOS, None).is_some());
        clock.advance(2 * MINUTE);
        assert!(cache.get_cache::<i32>(domain::REPOS, None).is_none());
    }

    #[test]
    fn session_domain_ignores_age() {
        let (cache, _, clock) = cache();
        cache.set_cache(domain::BRANCHES, &vec!["main"], None);
        clock.advance(365 * 24 * 60 * MINUTE);
        assert_eq!(
            cache.get_cache::<Vec<String>>(domain::BRANCHES, None),
            Some(vec!["main".to_string()])
        );
    }

    #[test]
    fn corrupt_record_is_purged() {
        let (cache, store, _) = cache();
        store.set("repos", "{not json").unwrap();
        assert_eq!(cache.get_cache::<i32>(domain::REPOS, None), None);
        assert!(store.get("repos").unwrap().is_none());
    }

    #[test]
    fn wrong_shape_is_purged() {
        let (cache, store, _) = cache();
        store.set("repos", r#"{"data": "text", "timestamp": 1}"#).unwrap();
        assert_eq!(cache.get_cache::<Vec<i32>>(domain::REPOS, None), None);
        assert!(store.get("repos").unwrap().is_none());
    }

    #[test]
    fn quota_failure_degrades_to_miss() {
        let store = Arc::new(MemoryStore::with_quota(16));
        let cache = SessionCache::new(store.clone(), Arc::new(ManualClock::new(0)));
        cache.set_cache(domain::REPOS, &"x".repeat(100), None);
        assert!(store.is_empty());
        assert_eq!(cache.get_cache::<String>(domain::REPOS, None), None);
    }

    #[test]
    fn invalidate_and_clear() {
        let (cache, store, _) = cache();
        cache.set_cache(domain::REPOS, &1, None);
        cache.set_cache(domain::SESSIONS, &2, None);
        cache.invalidate_cache(domain::REPOS, None);
        assert_eq!(cache.get_cache::<i32>(domain::REPOS, None), None);
        assert_eq!(cache.get_cache::<i32>(domain::SESSIONS, None), Some(2));

        cache.clear_all();
        assert!(store.is_empty());
    }
}
