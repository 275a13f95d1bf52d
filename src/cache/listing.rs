//! Cached file listings, one record per `owner/repo@branch`.
//!
//! Records are `{files, etag, timestamp}` under `listing:{identity}`.  The
//! eviction controller governs every key with the [`LISTING_PREFIX`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::policy::CachePolicy;
use super::store::Store;
use crate::clock::SharedClock;
use crate::forge::RepoRef;
use crate::listing::FileEntry;

pub const LISTING_PREFIX: &str = "listing:";
/// Per-listing UI state (expanded folders) that must go when its listing is
/// evicted.
pub const EXPANDED_PREFIX: &str = "expanded:";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub files: Vec<FileEntry>,
    #[serde(default)]
    pub etag: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Fresh(ListingRecord),
    Stale(ListingRecord),
    Miss,
    /// A record existed but could not be read; it has been purged.
    Corrupt,
}

pub fn listing_key(repo: &RepoRef) -> String {
    format!("{LISTING_PREFIX}{}", repo.identity())
}

/// The secondary key that shares a listing key's identity.
pub fn dependent_key(listing_key: &str) -> Option<String> {
    listing_key
        .strip_prefix(LISTING_PREFIX)
        .map(|identity| format!("{EXPANDED_PREFIX}{identity}"))
}

#[derive(Clone)]
pub struct ListingCache {
    store: Arc<dyn Store>,
    clock: SharedClock,
    policy: CachePolicy,
}

impl ListingCache {
    pub fn new(store: Arc<dyn Store>, clock: SharedClock, policy: CachePolicy) -> Self {
        Self {
            store,
            clock,
            policy,
        }
    }

    /// Classify the stored record.  Expired records are kept and reported
    /// stale so they can still be served.
    pub fn lookup(&self, repo: &RepoRef) -> Lookup {
        let key = listing_key(repo);
        let raw = match self.store.get(&key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Lookup::Miss,
            Err(e) => {
                warn!(key, error = %e, "listing cache read failed");
                return Lookup::Miss;
            }
        };

        let record: ListingRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(e) => {
                warn!(key, error = %e, "corrupt listing record, purging");
                self.remove(repo);
                return Lookup::Corrupt;
            }
        };

        let age = self.clock.now_millis().saturating_sub(record.timestamp);
        if self.policy.is_expired(age) {
            debug!(key, age_ms = age, "listing stale");
            Lookup::Stale(record)
        } else {
            Lookup::Fresh(record)
        }
    }

    /// Overwrite the record with `files` stamped now.
    pub fn write(&self, repo: &RepoRef, files: &[FileEntry], etag: Option<&str>) {
        let record = ListingRecord {
            files: files.to_vec(),
            etag: etag.map(str::to_string),
            timestamp: self.clock.now_millis(),
        };
        self.put(repo, &record);
    }

    /// Re-stamp an existing record without changing its files or etag.
    pub fn touch(&self, repo: &RepoRef, mut record: ListingRecord) -> ListingRecord {
        record.timestamp = self.clock.now_millis();
        self.put(repo, &record);
        record
    }

    pub fn remove(&self, repo: &RepoRef) {
        let key = listing_key(repo);
        if let Err(e) = self.store.remove(&key) {
            warn!(key, error = %e, "listing cache remove failed");
        }
    }

    fn put(&self, repo: &RepoRef, record: &ListingRecord) {
        let key = listing_key(repo);
        let result = serde_json::to_string(record)
            .map_err(anyhow::Error::from)
            .and_then(|json| self.store.set(&key, &json));
        if let Err(e) = result {
            warn!(key, error = %e, "listing cache write failed");
        }
    }
}
