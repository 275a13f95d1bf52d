//! Static per-domain TTL policy table.
//!
//! A TTL of `0` is the session sentinel: entries in that domain never expire
//! by age and live until invalidated or evicted.

use serde::Serialize;

const MINUTE_MS: i64 = 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStrategy {
    /// Expired entries are dropped and read as a miss.
    Expire,
    /// Expired entries are still served while a refresh runs in the
    /// background.
    StaleWhileRevalidate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CachePolicy {
    pub ttl_millis: i64,
    pub strategy: RefreshStrategy,
}

impl CachePolicy {
    pub const SESSION_TTL: i64 = 0;

    pub const fn session() -> Self {
        Self {
            ttl_millis: Self::SESSION_TTL,
            strategy: RefreshStrategy::Expire,
        }
    }

    pub const fn expiring(ttl_millis: i64) -> Self {
        Self {
            ttl_millis,
            strategy: RefreshStrategy::Expire,
        }
    }

    pub const fn stale_while_revalidate(ttl_millis: i64) -> Self {
        Self {
            ttl_millis,
            strategy: RefreshStrategy::StaleWhileRevalidate,
        }
    }

    pub fn is_session(&self) -> bool {
        self.ttl_millis == Self::SESSION_TTL
    }

    /// An entry is expired only once its age strictly exceeds the TTL.
    pub fn is_expired(&self, age_millis: i64) -> bool {
        !self.is_session() && age_millis > self.ttl_millis
    }
}

/// Cache domain names.
pub mod domain {
    pub const ACCOUNT_INFO: &str = "account_info";
    pub const QUEUE_ITEMS: &str = "queue_items";
    pub const BRANCHES: &str = "branches";
    pub const GIST: &str = "gist";
    pub const SESSIONS: &str = "sessions";
    pub const REPOS: &str = "repos";
    pub const CURRENT_BRANCH: &str = "current_branch";
    pub const CURRENT_REPO: &str = "current_repo";
    pub const USER_PROFILE: &str = "user_profile";
    pub const RAW_FILE: &str = "raw_file";
    pub const LISTING: &str = "listing";
}

/// Applied to any domain missing from the table.
pub const DEFAULT_POLICY: CachePolicy = CachePolicy::expiring(5 * MINUTE_MS);

static POLICIES: &[(&str, CachePolicy)] = &[
    (domain::ACCOUNT_INFO, CachePolicy::session()),
    (domain::QUEUE_ITEMS, CachePolicy::session()),
    (domain::BRANCHES, CachePolicy::session()),
    (domain::GIST, CachePolicy::session()),
    (domain::SESSIONS, CachePolicy::expiring(5 * MINUTE_MS)),
    (domain::REPOS, CachePolicy::expiring(5 * MINUTE_MS)),
    (domain::CURRENT_BRANCH, CachePolicy::expiring(5 * MINUTE_MS)),
    (domain::CURRENT_REPO, CachePolicy::expiring(5 * MINUTE_MS)),
    (domain::USER_PROFILE, CachePolicy::expiring(5 * MINUTE_MS)),
    (domain::RAW_FILE, CachePolicy::expiring(5 * MINUTE_MS)),
    (domain::LISTING, CachePolicy::stale_while_revalidate(15 * MINUTE_MS)),
];

pub fn policy_for(domain: &str) -> CachePolicy {
    POLICIES
        .iter()
        .find(|(name, _)| *name == domain)
        .map(|(_, policy)| *policy)
        .unwrap_or(DEFAULT_POLICY)
}
