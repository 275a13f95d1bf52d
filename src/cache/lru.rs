//! Least Recently Used (LRU) cap on cached file listings.
//!
//! Every access to a listing is stamped into a persisted access log.  When
//! the number of listing records exceeds the cap, the coldest ones are
//! removed together with their dependent `expanded:` records.  Entries with
//! no access stamp rank by their write timestamp.  Keys outside the listing
//! prefix are never touched.

use std::collections::BTreeMap;
use std::sync::Arc;

use prometheus_client::metrics::counter::Counter;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::listing::{dependent_key, LISTING_PREFIX};
use super::store::Store;
use crate::clock::SharedClock;

pub const ACCESS_LOG_KEY: &str = "cache_access_log";

type AccessLog = BTreeMap<String, i64>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub total: usize,
    pub limit: usize,
    pub utilization_percent: f64,
}

// ---------------------------------------------------------------------------
// EvictionController
// ---------------------------------------------------------------------------

pub struct EvictionController {
    store: Arc<dyn Store>,
    clock: SharedClock,
    max_entries: usize,
    evictions: Counter,
}

impl EvictionController {
    pub fn new(store: Arc<dyn Store>, clock: SharedClock, max_entries: usize, evictions: Counter) -> Self {
        Self {
            store,
            clock,
            max_entries,
            evictions,
        }
    }

    /// Stamp `cache_key` as used now.
    pub fn record_access(&self, cache_key: &str) {
        let mut log = self.load_log();
        log.insert(cache_key.to_string(), self.clock.now_millis());
        self.save_log(&log);
    }

    /// Remove the least recently used listings until at most `max_entries`
    /// remain.  Returns the number of listings removed.
    pub fn enforce_limit(&self) -> usize {
        let keys = self.listing_keys();
        if keys.len() <= self.max_entries {
            return 0;
        }

        let mut log = self.load_log();
        let scored: Vec<(String, i64)> = keys
            .into_iter()
            .map(|key| {
                let last_access = log
                    .get(&key)
                    .copied()
                    .unwrap_or_else(|| self.written_at(&key));
                (key, last_access)
            })
            .collect();

        let excess = scored.len() - self.max_entries;
        let candidates = get_eviction_candidates(scored, excess);

        for key in &candidates {
            self.remove_key(key);
            if let Some(dependent) = dependent_key(key) {
                self.remove_key(&dependent);
            }
            log.remove(key);
        }
        self.save_log(&log);

        self.evictions.inc_by(candidates.len() as u64);
        info!(
            evicted = candidates.len(),
            limit = self.max_entries,
            "evicted least recently used listings"
        );
        candidates.len()
    }

    pub fn stats(&self) -> CacheStats {
        let total = self.listing_keys().len();
        let utilization_percent = if self.max_entries == 0 {
            0.0
        } else {
            total as f64 / self.max_entries as f64 * 100.0
        };
        CacheStats {
            total,
            limit: self.max_entries,
            utilization_percent,
        }
    }

    // -- internals ----------------------------------------------------------

    fn listing_keys(&self) -> Vec<String> {
        match self.store.keys() {
            Ok(keys) => keys
                .into_iter()
                .filter(|k| k.starts_with(LISTING_PREFIX))
                .collect(),
            Err(e) => {
                warn!(error = %e, "cache keys unreadable");
                Vec::new()
            }
        }
    }

    /// Write timestamp of a listing record, or `0` when unreadable so
    /// damaged records go first.
    fn written_at(&self, key: &str) -> i64 {
        self.store
            .get(key)
            .ok()
            .flatten()
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
            .and_then(|v| v.get("timestamp").and_then(|t| t.as_i64()))
            .unwrap_or(0)
    }

    fn load_log(&self) -> AccessLog {
        match self.store.get(ACCESS_LOG_KEY) {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(error = %e, "access log corrupt, starting fresh");
                AccessLog::new()
            }),
            Ok(None) => AccessLog::new(),
            Err(e) => {
                warn!(error = %e, "access log unreadable");
                AccessLog::new()
            }
        }
    }

    fn save_log(&self, log: &AccessLog) {
        let result = serde_json::to_string(log)
            .map_err(anyhow::Error::from)
            .and_then(|json| self.store.set(ACCESS_LOG_KEY, &json));
        if let Err(e) = result {
            warn!(error = %e, "access log write failed");
        }
    }

    fn remove_key(&self, key: &str) {
        if let Err(e) = self.store.remove(key) {
            warn!(key, error = %e, "evicted key could not be removed");
        }
    }
}

// ---------------------------------------------------------------------------
// Candidate selection
// ---------------------------------------------------------------------------

/// Return up to `count` keys ordered by ascending last-access time (least
/// recently used first).  Ties break by key so the choice is deterministic.
pub fn get_eviction_candidates(mut scored: Vec<(String, i64)>, count: usize) -> Vec<String> {
    if scored.is_empty() || count == 0 {
        return Vec::new();
    }

    scored.sort_by(|(a_key, a_ts), (b_key, b_ts)| a_ts.cmp(b_ts).then_with(|| a_key.cmp(b_key)));

    let candidates: Vec<String> = scored.into_iter().take(count).map(|(key, _ts)| key).collect();

    debug!(
        candidate_count = candidates.len(),
        requested = count,
        "selected LRU eviction candidates"
    );

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::listing::ListingCache;
    use crate::cache::policy::CachePolicy;
    use crate::cache::store::MemoryStore;
    use crate::clock::ManualClock;
    use crate::forge::RepoRef;

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: ManualClock,
        listings: ListingCache,
        lru: EvictionController,
    }

    fn fixture(max: usize) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(1_000_000);
        let shared: SharedClock = Arc::new(clock.clone());
        Fixture {
            listings: ListingCache::new(
                store.clone(),
                shared.clone(),
                CachePolicy::stale_while_revalidate(15 * 60_000),
            ),
            lru: EvictionController::new(store.clone(), shared, max, Counter::default()),
            store,
            clock,
        }
    }

    fn repo(i: usize) -> RepoRef {
        RepoRef::new("acme", format!("r{i:02}"), "main")
    }

    fn key(i: usize) -> String {
        format!("listing:acme/r{i:02}@main")
    }

    #[test]
    fn candidates_oldest_first_with_key_tiebreak() {
        let scored = vec![
            ("c".to_string(), 5),
            ("b".to_string(), 1),
            ("a".to_string(), 5),
            ("d".to_string(), 9),
        ];
        assert_eq!(get_eviction_candidates(scored, 3), vec!["b", "a", "c"]);
    }

    #[test]
    fn candidates_empty_inputs() {
        assert!(get_eviction_candidates(Vec::new(), 3).is_empty());
        assert!(get_eviction_candidates(vec![("a".into(), 1)], 0).is_empty());
    }

    #[test]
    fn under_limit_is_noop() {
        let f = fixture(20);
        for i in 0..20 {
            f.listings.write(&repo(i), &[], None);
        }
        assert_eq!(f.lru.enforce_limit(), 0);
        assert_eq!(f.lru.stats().total, 20);
    }

    #[test]
    fn keeps_exactly_the_most_recently_accessed() {
        let f = fixture(20);
        for i in 0..25 {
            f.listings.write(&repo(i), &[], None);
            f.store.set(&format!("expanded:acme/r{i:02}@main"), "[]").unwrap();
        }
        // Access in reverse so r24 is coldest and r00 is hottest.
        for i in (0..25).rev() {
            f.clock.advance(10);
            f.lru.record_access(&key(i));
        }

        assert_eq!(f.lru.enforce_limit(), 5);

        let keys = f.store.keys().unwrap();
        for i in 0..20 {
            assert!(keys.contains(&key(i)), "r{i:02} should survive");
        }
        for i in 20..25 {
            assert!(!keys.contains(&key(i)), "r{i:02} should be evicted");
            assert!(!keys.contains(&format!("expanded:acme/r{i:02}@main")));
        }
        assert_eq!(f.lru.stats().total, 20);

        let log: AccessLog =
            serde_json::from_str(&f.store.get(ACCESS_LOG_KEY).unwrap().unwrap()).unwrap();
        assert_eq!(log.len(), 20);
        assert!(!log.contains_key(&key(24)));
    }

    #[test]
    fn unaccessed_entries_rank_by_write_time() {
        let f = fixture(2);
        f.listings.write(&repo(0), &[], None);
        f.clock.advance(100);
        f.listings.write(&repo(1), &[], None);
        f.clock.advance(100);
        f.listings.write(&repo(2), &[], None);
        // r00 was written first but accessed most recently.
        f.clock.advance(100);
        f.lru.record_access(&key(0));

        assert_eq!(f.lru.enforce_limit(), 1);
        let keys = f.store.keys().unwrap();
        assert!(keys.contains(&key(0)));
        assert!(!keys.contains(&key(1)));
        assert!(keys.contains(&key(2)));
    }

    #[test]
    fn entries_within_ttl_are_still_evicted() {
        let f = fixture(1);
        f.listings.write(&repo(0), &[], None);
        f.clock.advance(1);
        f.listings.write(&repo(1), &[], None);

        assert_eq!(f.lru.enforce_limit(), 1);
        // Both were far inside the listing TTL; the cap wins regardless.
        assert!(f.store.get(&key(0)).unwrap().is_none());
        assert!(f.store.get(&key(1)).unwrap().is_some());
    }

    #[test]
    fn other_domains_are_never_evicted() {
        let f = fixture(1);
        f.store.set("branches_acme/r00", "{}").unwrap();
        f.store.set("expanded:orphan", "[]").unwrap();
        for i in 0..3 {
            f.clock.advance(1);
            f.listings.write(&repo(i), &[], None);
        }
        assert_eq!(f.lru.enforce_limit(), 2);
        assert!(f.store.get("branches_acme/r00").unwrap().is_some());
        assert!(f.store.get("expanded:orphan").unwrap().is_some());
    }

    #[test]
    fn stats_report_utilization() {
        let f = fixture(20);
        for i in 0..5 {
            f.listings.write(&repo(i), &[], None);
        }
        let stats = f.lru.stats();
        assert_eq!(stats.total, 5);
        assert_eq!(stats.limit, 20);
        assert!((stats.utilization_percent - 25.0).abs() < f64::EPSILON);
    }
}
